//! Shared transaction-to-features transform for training and serving.
//!
//! `fit_transform` runs once over a training table and freezes a `FitState`.
//! `apply` reuses that state for held-out batches or single live records; the
//! live path injects the `FeatureStore` count through `velocity_override`.
//! Both paths encode rows through the same function, so a training row and
//! the same row applied later produce identical vectors.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::fit_state::{CategoricalVocabulary, FitState, NumericScaler};
use crate::range_lookup::{RangeLookup, UNKNOWN_LABEL};
use crate::record::{RawTransaction, RecordError, Transaction};
use crate::time_features::derive_time_features;
use crate::velocity::{batch_window_counts, VelocityConfig, VelocityConfigError};

pub const NUMERIC_FEATURES: [&str; 4] = [
    "purchase_value",
    "age",
    "time_since_signup_hours",
    "velocity_count",
];

pub const CATEGORICAL_FEATURES: [&str; 6] = [
    "source",
    "browser",
    "sex",
    "country",
    "hour_of_day",
    "day_of_week",
];

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid input at row {row}: {source}")]
    InvalidInput {
        row: usize,
        #[source]
        source: RecordError,
    },
    #[error("feature engineer is not fitted; call fit_transform or load a fit state first")]
    Unfitted,
    #[error("feature engineer is already fitted")]
    AlreadyFitted,
    #[error("training table is empty")]
    EmptyTable,
    #[error("invalid velocity config: {0}")]
    InvalidConfig(#[from] VelocityConfigError),
    #[error("incompatible fit state: {0}")]
    IncompatibleFitState(String),
}

impl FeatureError {
    /// Offending column for input errors.
    pub fn column(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInput { source, .. } => Some(source.column()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> Option<&[f64]> {
        self.rows.get(idx).map(Vec::as_slice)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOutput {
    pub matrix: FeatureMatrix,
    /// Row-aligned with `matrix`.
    pub labels: Vec<Option<u8>>,
}

#[derive(Debug, Clone)]
struct DerivedRow {
    numeric: [f64; 4],
    categorical: [String; 6],
}

#[derive(Debug, Default)]
struct EncodeStats {
    unknown_ranges: u64,
    unknown_categories: u64,
}

#[derive(Debug, Clone)]
pub struct FeatureEngineer {
    config: VelocityConfig,
    ranges: RangeLookup,
    state: Option<FitState>,
}

impl FeatureEngineer {
    /// Unfitted engineer; only `fit_transform` is legal until it succeeds.
    pub fn new(config: VelocityConfig, ranges: RangeLookup) -> Result<Self, FeatureError> {
        config.validate()?;
        Ok(Self {
            config,
            ranges,
            state: None,
        })
    }

    /// Fitted engineer from a persisted state, for serving processes.
    pub fn from_fit_state(state: FitState, ranges: RangeLookup) -> Result<Self, FeatureError> {
        check_layout(&state)?;
        let config = VelocityConfig {
            window_seconds: state.window_seconds,
            ..VelocityConfig::default()
        };
        config.validate()?;

        info!(
            component = "features",
            event = "features.fit_state.attached",
            window_seconds = state.window_seconds,
            width = state.width(),
            fingerprint = %state.fingerprint,
            range_count = ranges.len()
        );

        Ok(Self {
            config,
            ranges,
            state: Some(state),
        })
    }

    pub fn velocity_config(&self) -> VelocityConfig {
        self.config
    }

    pub fn ranges(&self) -> &RangeLookup {
        &self.ranges
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn fit_state(&self) -> Result<&FitState, FeatureError> {
        self.state.as_ref().ok_or(FeatureError::Unfitted)
    }

    pub fn fit_transform(&mut self, table: &[Transaction]) -> Result<FitOutput, FeatureError> {
        if self.state.is_some() {
            return Err(FeatureError::AlreadyFitted);
        }
        if table.is_empty() {
            return Err(FeatureError::EmptyTable);
        }
        validate_table(table)?;

        info!(
            component = "features",
            event = "features.fit.start",
            rows = table.len(),
            window_seconds = self.config.window_seconds
        );

        let counts = self.velocity_counts(table, None);
        let mut stats = EncodeStats::default();
        let rows = self.derive_rows(table, &counts, &mut stats);

        let numeric = NUMERIC_FEATURES
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let values: Vec<f64> = rows.iter().map(|row| row.numeric[idx]).collect();
                NumericScaler::fit(name, &values)
            })
            .collect();
        let categorical = CATEGORICAL_FEATURES
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let values = rows.iter().map(|row| row.categorical[idx].as_str());
                CategoricalVocabulary::fit(name, values)
            })
            .collect();
        let state = FitState::new(self.config.window_seconds, numeric, categorical);

        let matrix = encode_matrix(&state, &rows, &mut stats);
        let labels = table.iter().map(|tx| tx.label).collect();

        info!(
            component = "features",
            event = "features.fit.finish",
            rows = matrix.len(),
            width = matrix.width(),
            unknown_ranges = stats.unknown_ranges,
            fingerprint = %state.fingerprint
        );

        self.state = Some(state);
        Ok(FitOutput { matrix, labels })
    }

    /// Transforms with the frozen state. Without an override the windowed
    /// count is recomputed over `table` with the batch algorithm.
    pub fn apply(
        &self,
        table: &[Transaction],
        velocity_override: Option<usize>,
    ) -> Result<FeatureMatrix, FeatureError> {
        let state = self.fit_state()?;
        validate_table(table)?;

        let counts = self.velocity_counts(table, velocity_override);
        let mut stats = EncodeStats::default();
        let rows = self.derive_rows(table, &counts, &mut stats);
        let matrix = encode_matrix(state, &rows, &mut stats);

        debug!(
            component = "features",
            event = "features.apply.finish",
            rows = matrix.len(),
            velocity_override = ?velocity_override,
            unknown_ranges = stats.unknown_ranges,
            unknown_categories = stats.unknown_categories
        );

        Ok(matrix)
    }

    pub fn apply_one(
        &self,
        record: &Transaction,
        velocity_override: Option<usize>,
    ) -> Result<Vec<f64>, FeatureError> {
        let matrix = self.apply(std::slice::from_ref(record), velocity_override)?;
        Ok(matrix.rows.into_iter().next().unwrap_or_default())
    }

    fn velocity_counts(
        &self,
        table: &[Transaction],
        velocity_override: Option<usize>,
    ) -> Vec<usize> {
        match velocity_override {
            Some(count) => vec![count; table.len()],
            None => {
                let keys: Vec<i64> = table.iter().map(|tx| tx.user_id).collect();
                let times: Vec<_> = table.iter().map(|tx| tx.purchase_time).collect();
                batch_window_counts(&keys, &times, self.config.window())
            }
        }
    }

    fn derive_rows(
        &self,
        table: &[Transaction],
        counts: &[usize],
        stats: &mut EncodeStats,
    ) -> Vec<DerivedRow> {
        table
            .iter()
            .zip(counts)
            .map(|(tx, count)| {
                let time = derive_time_features(tx.signup_time, tx.purchase_time);
                let country = match &tx.country {
                    Some(country) => country.clone(),
                    None => {
                        let label = self.ranges.lookup(tx.ip_address);
                        if label == UNKNOWN_LABEL {
                            stats.unknown_ranges += 1;
                        }
                        label.to_string()
                    }
                };

                DerivedRow {
                    numeric: [
                        tx.purchase_value,
                        f64::from(tx.age),
                        time.elapsed_hours,
                        *count as f64,
                    ],
                    categorical: [
                        tx.source.clone(),
                        tx.browser.clone(),
                        tx.sex.clone(),
                        country,
                        time.hour_of_day.to_string(),
                        time.day_of_week.to_string(),
                    ],
                }
            })
            .collect()
    }
}

/// Validates raw rows into typed records, reporting the first failing row.
pub fn parse_records(raw: Vec<RawTransaction>) -> Result<Vec<Transaction>, FeatureError> {
    raw.into_iter()
        .enumerate()
        .map(|(row, record)| {
            Transaction::try_from(record)
                .map_err(|source| FeatureError::InvalidInput { row, source })
        })
        .collect()
}

fn validate_table(table: &[Transaction]) -> Result<(), FeatureError> {
    for (row, tx) in table.iter().enumerate() {
        tx.validate()
            .map_err(|source| FeatureError::InvalidInput { row, source })?;
    }
    Ok(())
}

fn check_layout(state: &FitState) -> Result<(), FeatureError> {
    if state.numeric_feature_names() != NUMERIC_FEATURES {
        return Err(FeatureError::IncompatibleFitState(format!(
            "numeric features {:?}, expected {:?}",
            state.numeric_feature_names(),
            NUMERIC_FEATURES
        )));
    }
    if state.categorical_feature_names() != CATEGORICAL_FEATURES {
        return Err(FeatureError::IncompatibleFitState(format!(
            "categorical features {:?}, expected {:?}",
            state.categorical_feature_names(),
            CATEGORICAL_FEATURES
        )));
    }
    Ok(())
}

fn encode_matrix(
    state: &FitState,
    rows: &[DerivedRow],
    stats: &mut EncodeStats,
) -> FeatureMatrix {
    FeatureMatrix {
        columns: state.column_names(),
        rows: rows.iter().map(|row| encode_row(state, row, stats)).collect(),
    }
}

fn encode_row(state: &FitState, row: &DerivedRow, stats: &mut EncodeStats) -> Vec<f64> {
    let mut values = Vec::with_capacity(state.width());

    for (scaler, value) in state.numeric.iter().zip(row.numeric.iter()) {
        values.push(scaler.transform(*value));
    }

    for (vocabulary, value) in state.categorical.iter().zip(row.categorical.iter()) {
        let hit = vocabulary.position(value);
        if hit.is_none() {
            stats.unknown_categories += 1;
            debug!(
                component = "features",
                event = "features.apply.unknown_category",
                feature = %vocabulary.name,
                value = %value
            );
        }
        values.extend((0..vocabulary.len()).map(|idx| if Some(idx) == hit { 1.0 } else { 0.0 }));
    }

    values
}
