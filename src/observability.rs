//! Logging bootstrap and the process-level events of feature tools.
//!
//! Every `FRAUD_FEATURES_*` environment setting is read through [`env_setting`],
//! so logging and velocity configuration treat blank values the same way.

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::fit_state::FitState;
use crate::velocity::VelocityConfig;

const LOG_LEVEL_VAR: &str = "FRAUD_FEATURES_LOG_LEVEL";
const LOG_FORMAT_VAR: &str = "FRAUD_FEATURES_LOG_FORMAT";
const LOG_TARGET_VAR: &str = "FRAUD_FEATURES_LOG_TARGET";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Trimmed value of an environment variable; unset and blank are both `None`.
pub(crate) fn env_setting(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Unparseable values keep the default rather than failing startup.
pub fn logging_config_from_env() -> LoggingConfig {
    let defaults = LoggingConfig::default();
    LoggingConfig {
        level: env_setting(LOG_LEVEL_VAR).unwrap_or(defaults.level),
        format: env_setting(LOG_FORMAT_VAR)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(defaults.format),
        include_target: env_setting(LOG_TARGET_VAR)
            .and_then(|raw| parse_switch(&raw))
            .unwrap_or(defaults.include_target),
    }
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

/// Startup event carrying the effective logging and velocity settings.
pub fn log_app_start(app: &str, logging: &LoggingConfig, velocity: &VelocityConfig) {
    info!(
        component = app,
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        window_seconds = velocity.window_seconds,
        allowed_lateness_seconds = velocity.allowed_lateness_seconds
    );
}

/// Emitted once a FitState is ready to serve, so logs tie every later
/// vector to the fingerprint that produced it.
pub fn log_fit_state_ready(app: &str, state: &FitState, range_count: usize) {
    info!(
        component = app,
        event = "app.fit_state.ready",
        fingerprint = %state.fingerprint,
        schema_version = state.schema_version,
        window_seconds = state.window_seconds,
        width = state.width(),
        ranges = range_count
    );
}

/// Outcome of replaying a table through a live store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub skipped: usize,
    pub mismatched: usize,
}

impl ReplaySummary {
    pub fn is_consistent(&self) -> bool {
        self.mismatched == 0
    }
}

pub fn log_replay_finish(app: &str, summary: &ReplaySummary) {
    if summary.is_consistent() {
        info!(
            component = app,
            event = "app.replay.finish",
            replayed = summary.replayed,
            skipped = summary.skipped
        );
    } else {
        warn!(
            component = app,
            event = "app.replay.skew",
            replayed = summary.replayed,
            skipped = summary.skipped,
            mismatched = summary.mismatched
        );
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
