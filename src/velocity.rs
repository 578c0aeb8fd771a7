//! Per-user sliding-window velocity counts.
//!
//! `FeatureStore` serves the live path: one `record_and_count` per inbound
//! event. `batch_window_counts` computes the same counts over a static table
//! for training. Fed the same events in timestamp order, the two agree row by
//! row.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::observability::env_setting;

pub const DEFAULT_WINDOW_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VelocityConfig {
    pub window_seconds: i64,
    /// How far behind a key's newest event a late event may land and still be
    /// counted exactly. Zero expires strictly relative to the newest event.
    pub allowed_lateness_seconds: i64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            allowed_lateness_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VelocityConfigError {
    #[error("window_seconds must be > 0, got {0}")]
    NonPositiveWindow(i64),
    #[error("allowed_lateness_seconds must be >= 0, got {0}")]
    NegativeLateness(i64),
    #[error("{field} of {value}s exceeds the representable span of {max}s")]
    SpanOutOfRange {
        field: &'static str,
        value: i64,
        max: i64,
    },
}

impl VelocityConfig {
    /// Overflowing hour counts saturate and are then rejected by `validate`.
    pub fn hours(window_hours: i64) -> Self {
        Self {
            window_seconds: window_hours.saturating_mul(3_600),
            ..Self::default()
        }
    }

    /// Clamped to the largest representable span; `validate` rejects anything larger.
    pub fn window(&self) -> ChronoDuration {
        span(self.window_seconds)
    }

    pub fn allowed_lateness(&self) -> ChronoDuration {
        span(self.allowed_lateness_seconds)
    }

    pub fn validate(&self) -> Result<(), VelocityConfigError> {
        if self.window_seconds <= 0 {
            return Err(VelocityConfigError::NonPositiveWindow(self.window_seconds));
        }
        if self.allowed_lateness_seconds < 0 {
            return Err(VelocityConfigError::NegativeLateness(
                self.allowed_lateness_seconds,
            ));
        }

        let max = max_span_seconds();
        let retention = self
            .window_seconds
            .checked_add(self.allowed_lateness_seconds)
            .unwrap_or(i64::MAX);
        for (field, value) in [
            ("window_seconds", self.window_seconds),
            ("allowed_lateness_seconds", self.allowed_lateness_seconds),
            ("window_seconds + allowed_lateness_seconds", retention),
        ] {
            if value > max {
                return Err(VelocityConfigError::SpanOutOfRange { field, value, max });
            }
        }
        Ok(())
    }
}

fn max_span_seconds() -> i64 {
    ChronoDuration::MAX.num_seconds()
}

fn span(seconds: i64) -> ChronoDuration {
    ChronoDuration::try_seconds(seconds).unwrap_or(if seconds < 0 {
        ChronoDuration::MIN
    } else {
        ChronoDuration::MAX
    })
}

pub fn velocity_config_from_env() -> VelocityConfig {
    let mut config = VelocityConfig::default();

    if let Some(window) = env_i64("FRAUD_FEATURES_WINDOW_SECONDS") {
        config.window_seconds = window;
    }
    if let Some(lateness) = env_i64("FRAUD_FEATURES_ALLOWED_LATENESS_SECONDS") {
        config.allowed_lateness_seconds = lateness;
    }

    config
}

fn env_i64(key: &str) -> Option<i64> {
    env_setting(key)?.parse::<i64>().ok()
}

/// One key's retained event timestamps, ascending.
#[derive(Debug, Clone, Default)]
pub struct VelocityWindow {
    events: VecDeque<NaiveDateTime>,
    high_water: Option<NaiveDateTime>,
}

impl VelocityWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &NaiveDateTime> {
        self.events.iter()
    }

    pub fn high_water(&self) -> Option<NaiveDateTime> {
        self.high_water
    }

    /// Inserts `event_time` at its sorted position (after equal timestamps),
    /// returns how many retained events fall in `[event_time - window,
    /// event_time]`, then expires.
    ///
    /// The count is taken before expiry, so an event later than the allowed
    /// lateness still counts itself even though it is not retained.
    pub fn record(&mut self, event_time: NaiveDateTime, config: &VelocityConfig) -> usize {
        let idx = self.events.partition_point(|ts| *ts <= event_time);
        self.events.insert(idx, event_time);
        let count = self.count_at(event_time, config.window());

        let high_water = match self.high_water {
            Some(prev) if prev > event_time => prev,
            _ => event_time,
        };
        self.high_water = Some(high_water);

        let retain_from = sub_saturating(
            sub_saturating(high_water, config.window()),
            config.allowed_lateness(),
        );
        self.expire_before(retain_from);

        count
    }

    /// Events in `[at - window, at]` among those retained.
    pub fn count_at(&self, at: NaiveDateTime, window: ChronoDuration) -> usize {
        let lower = sub_saturating(at, window);
        let start = self.events.partition_point(|ts| *ts < lower);
        let end = self.events.partition_point(|ts| *ts <= at);
        end.saturating_sub(start)
    }

    fn expire_before(&mut self, cutoff: NaiveDateTime) {
        while self.events.front().is_some_and(|ts| *ts < cutoff) {
            self.events.pop_front();
        }
    }
}

fn sub_saturating(ts: NaiveDateTime, delta: ChronoDuration) -> NaiveDateTime {
    ts.checked_sub_signed(delta).unwrap_or(NaiveDateTime::MIN)
}

/// Process-wide live velocity state, keyed by user.
///
/// Construct once at startup and share by reference (or `Arc`) with every
/// handler. Calls on the same key are serialized by that key's mutex; calls on
/// different keys only contend on the map lock while the entry is looked up.
#[derive(Debug)]
pub struct FeatureStore<K> {
    config: VelocityConfig,
    windows: RwLock<HashMap<K, Arc<Mutex<VelocityWindow>>>>,
}

impl<K> FeatureStore<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(config: VelocityConfig) -> Result<Self, VelocityConfigError> {
        config.validate()?;
        info!(
            component = "velocity",
            event = "velocity.store.created",
            window_seconds = config.window_seconds,
            allowed_lateness_seconds = config.allowed_lateness_seconds
        );
        Ok(Self {
            config,
            windows: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &VelocityConfig {
        &self.config
    }

    /// Appends the event to the key's window, expires stale entries and
    /// returns the resulting windowed count.
    pub fn record_and_count(&self, key: &K, event_time: NaiveDateTime) -> usize {
        let window = self.window_for(key);
        let mut guard = window
            .lock()
            .expect("velocity window lock should not be poisoned");

        if let Some(high_water) = guard.high_water() {
            let late_by = high_water - event_time;
            if late_by > self.config.allowed_lateness() {
                warn!(
                    component = "velocity",
                    event = "velocity.event.late",
                    key = ?key,
                    event_time = %event_time,
                    high_water = %high_water,
                    late_by_seconds = late_by.num_seconds()
                );
            }
        }

        let count = guard.record(event_time, &self.config);
        debug!(
            component = "velocity",
            event = "velocity.event.recorded",
            key = ?key,
            event_time = %event_time,
            count,
            retained = guard.len()
        );
        count
    }

    /// Windowed count as of `at` without recording anything.
    pub fn current_count(&self, key: &K, at: NaiveDateTime) -> usize {
        let windows = self
            .windows
            .read()
            .expect("velocity map lock should not be poisoned");
        match windows.get(key) {
            Some(window) => window
                .lock()
                .expect("velocity window lock should not be poisoned")
                .count_at(at, self.config.window()),
            None => 0,
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .read()
            .expect("velocity map lock should not be poisoned")
            .len()
    }

    /// Drops every key. Intended for test isolation.
    pub fn reset(&self) {
        let mut windows = self
            .windows
            .write()
            .expect("velocity map lock should not be poisoned");
        let cleared = windows.len();
        windows.clear();
        info!(
            component = "velocity",
            event = "velocity.store.reset",
            cleared_keys = cleared
        );
    }

    fn window_for(&self, key: &K) -> Arc<Mutex<VelocityWindow>> {
        if let Some(window) = self
            .windows
            .read()
            .expect("velocity map lock should not be poisoned")
            .get(key)
        {
            return Arc::clone(window);
        }

        let mut windows = self
            .windows
            .write()
            .expect("velocity map lock should not be poisoned");
        Arc::clone(windows.entry(key.clone()).or_default())
    }
}

/// Backward-looking windowed counts over a static table, in input row order.
///
/// Rows are grouped by key and ordered by time (stable on input order for
/// equal timestamps). Each row counts the rows of its key inside
/// `[time - window, time]` up to and including itself.
pub fn batch_window_counts<K>(
    keys: &[K],
    times: &[NaiveDateTime],
    window: ChronoDuration,
) -> Vec<usize>
where
    K: Eq + Hash,
{
    debug_assert_eq!(keys.len(), times.len());

    let mut groups: HashMap<&K, Vec<usize>> = HashMap::new();
    for (idx, key) in keys.iter().enumerate() {
        groups.entry(key).or_default().push(idx);
    }

    let mut counts = vec![0usize; keys.len()];
    for rows in groups.values_mut() {
        rows.sort_by_key(|idx| (times[*idx], *idx));

        let mut start = 0usize;
        for (pos, row) in rows.iter().enumerate() {
            let lower = sub_saturating(times[*row], window);
            while times[rows[start]] < lower {
                start += 1;
            }
            counts[*row] = pos - start + 1;
        }
    }

    counts
}
