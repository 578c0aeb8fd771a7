//! Fraud-scoring feature computation.
//!
//! Current implemented scope:
//! - per-user sliding-window velocity counts, live and batch
//! - address range to country lookup and calendar features
//! - fitted scaling and one-hot vocabularies shared by training and serving
//! - a scoring pipeline around an external classifier

mod dataset;
mod engineer;
mod fit_state;
mod observability;
mod range_lookup;
mod record;
mod scoring;
mod time_features;
mod velocity;

pub use dataset::{
    load_ip_ranges_csv, load_transactions_csv, read_ip_ranges, read_raw_transactions,
    read_transactions, DataQualityReport, DatasetError,
};
pub use engineer::{
    parse_records, FeatureEngineer, FeatureError, FeatureMatrix, FitOutput, CATEGORICAL_FEATURES,
    NUMERIC_FEATURES,
};
pub use fit_state::{
    CategoricalVocabulary, FitState, FitStateError, NumericScaler, FIT_STATE_SCHEMA_VERSION,
};
pub use observability::{
    init_logging, log_app_start, log_fit_state_ready, log_replay_finish, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError, ReplaySummary,
};
pub use range_lookup::{IpRange, RangeLookup, UNKNOWN_LABEL};
pub use record::{parse_timestamp, RawField, RawTransaction, RecordError, Transaction};
pub use scoring::{
    FraudClassifier, InferenceLogRecord, RiskLevel, ScoredTransaction, ScoringPipeline,
    DEFAULT_DECISION_THRESHOLD,
};
pub use time_features::{derive_time_features, TimeFeatures};
pub use velocity::{
    batch_window_counts, velocity_config_from_env, FeatureStore, VelocityConfig,
    VelocityConfigError, VelocityWindow, DEFAULT_WINDOW_SECONDS,
};
