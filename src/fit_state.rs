//! Frozen scaling parameters and categorical vocabularies.
//!
//! A `FitState` is learned once from a training table and reused verbatim at
//! serving time. Its column order is the output column order, so the JSON blob
//! must round-trip bit for bit; the fingerprint guards against drift between
//! the artifact and the code that reads it.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const FIT_STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericScaler {
    pub name: String,
    pub mean: f64,
    pub scale: f64,
}

impl NumericScaler {
    /// Mean and population standard deviation; a degenerate spread scales by 1.
    pub fn fit(name: &str, values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                name: name.to_string(),
                mean: 0.0,
                scale: 1.0,
            };
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std = variance.sqrt();
        let scale = if std.is_finite() && std > 0.0 { std } else { 1.0 };

        Self {
            name: name.to_string(),
            mean,
            scale,
        }
    }

    pub fn transform(&self, value: f64) -> f64 {
        (value - self.mean) / self.scale
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalVocabulary {
    pub name: String,
    pub categories: Vec<String>,
}

impl CategoricalVocabulary {
    pub fn fit<'a>(name: &str, values: impl IntoIterator<Item = &'a str>) -> Self {
        let distinct: BTreeSet<&str> = values.into_iter().collect();
        let mut categories: Vec<String> = distinct.into_iter().map(str::to_string).collect();
        categories.sort_by(|a, b| category_order(a, b));
        Self {
            name: name.to_string(),
            categories,
        }
    }

    pub fn position(&self, value: &str) -> Option<usize> {
        self.categories.iter().position(|c| c == value)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Whole numbers sort numerically and before text; text sorts lexicographically.
fn category_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitState {
    pub schema_version: u32,
    pub window_seconds: i64,
    pub numeric: Vec<NumericScaler>,
    pub categorical: Vec<CategoricalVocabulary>,
    pub fingerprint: String,
}

#[derive(Debug, Error)]
pub enum FitStateError {
    #[error("fit state JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("fit state schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("fit state fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}

impl FitState {
    pub fn new(
        window_seconds: i64,
        numeric: Vec<NumericScaler>,
        categorical: Vec<CategoricalVocabulary>,
    ) -> Self {
        let mut state = Self {
            schema_version: FIT_STATE_SCHEMA_VERSION,
            window_seconds,
            numeric,
            categorical,
            fingerprint: String::new(),
        };
        state.fingerprint = state.compute_fingerprint();
        state
    }

    pub fn numeric_feature_names(&self) -> Vec<&str> {
        self.numeric.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn categorical_feature_names(&self) -> Vec<&str> {
        self.categorical.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn scaler(&self, name: &str) -> Option<&NumericScaler> {
        self.numeric.iter().find(|s| s.name == name)
    }

    pub fn vocabulary(&self, name: &str) -> Option<&CategoricalVocabulary> {
        self.categorical.iter().find(|v| v.name == name)
    }

    /// Output width: numeric features plus one indicator per vocabulary entry.
    pub fn width(&self) -> usize {
        self.numeric.len() + self.categorical.iter().map(|v| v.len()).sum::<usize>()
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.width());
        for scaler in &self.numeric {
            columns.push(scaler.name.clone());
        }
        for vocabulary in &self.categorical {
            for category in &vocabulary.categories {
                columns.push(format!("{}_{}", vocabulary.name, category));
            }
        }
        columns
    }

    pub fn to_json(&self) -> Result<String, FitStateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a persisted state and verifies its version and fingerprint.
    pub fn from_json(raw: &str) -> Result<Self, FitStateError> {
        let state: Self = serde_json::from_str(raw)?;
        if state.schema_version != FIT_STATE_SCHEMA_VERSION {
            return Err(FitStateError::SchemaVersionMismatch {
                expected: FIT_STATE_SCHEMA_VERSION,
                actual: state.schema_version,
            });
        }

        let recomputed = state.compute_fingerprint();
        if recomputed != state.fingerprint {
            return Err(FitStateError::FingerprintMismatch {
                expected: recomputed,
                actual: state.fingerprint,
            });
        }

        info!(
            component = "fit_state",
            event = "fit_state.loaded",
            version = state.schema_version,
            width = state.width(),
            fingerprint = %state.fingerprint
        );
        Ok(state)
    }

    pub fn assert_compatible(
        &self,
        expected_version: u32,
        expected_fingerprint: &str,
    ) -> Result<(), FitStateError> {
        if expected_version != self.schema_version {
            return Err(FitStateError::SchemaVersionMismatch {
                expected: expected_version,
                actual: self.schema_version,
            });
        }
        if expected_fingerprint != self.fingerprint {
            return Err(FitStateError::FingerprintMismatch {
                expected: expected_fingerprint.to_string(),
                actual: self.fingerprint.clone(),
            });
        }
        Ok(())
    }

    fn compute_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("version:{};", self.schema_version));
        hasher.update(format!("window_seconds:{};", self.window_seconds));
        hasher.update("numeric:");
        for scaler in &self.numeric {
            hasher.update(format!(
                "{}={:016x}/{:016x};",
                scaler.name,
                scaler.mean.to_bits(),
                scaler.scale.to_bits()
            ));
        }
        hasher.update("columns:");
        for column in self.column_names() {
            hasher.update(column.as_bytes());
            hasher.update(";");
        }
        hex::encode(hasher.finalize())
    }
}
