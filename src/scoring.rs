//! Serving-side glue between the live store, the frozen transform and an
//! external classifier.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engineer::{FeatureEngineer, FeatureError};
use crate::record::{RawTransaction, Transaction};
use crate::velocity::FeatureStore;

pub const DEFAULT_DECISION_THRESHOLD: f64 = 0.5;

/// Probability model fitted outside this crate.
pub trait FraudClassifier: Send + Sync {
    fn predict_proba(&self, features: &[f64]) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_probability(probability: f64) -> Self {
        if probability > 0.8 {
            Self::High
        } else if probability > 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTransaction {
    pub velocity_count: usize,
    pub features: Vec<f64>,
    pub probability: f64,
    pub prediction: u8,
    pub risk_level: RiskLevel,
}

/// Input fields plus model output, as consumed by drift monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceLogRecord {
    pub user_id: i64,
    pub signup_time: String,
    pub purchase_time: String,
    pub purchase_value: f64,
    pub device_id: String,
    pub source: String,
    pub browser: String,
    pub sex: String,
    pub age: u32,
    pub ip_address: i64,
    pub fraud_probability: f64,
    pub prediction: u8,
    pub risk_level: RiskLevel,
}

impl InferenceLogRecord {
    pub fn new(tx: &Transaction, scored: &ScoredTransaction) -> Self {
        Self {
            user_id: tx.user_id,
            signup_time: tx.signup_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            purchase_time: tx.purchase_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            purchase_value: tx.purchase_value,
            device_id: tx.device_id.clone(),
            source: tx.source.clone(),
            browser: tx.browser.clone(),
            sex: tx.sex.clone(),
            age: tx.age,
            ip_address: tx.ip_address,
            fraud_probability: scored.probability,
            prediction: scored.prediction,
            risk_level: scored.risk_level,
        }
    }
}

pub struct ScoringPipeline<C> {
    store: Arc<FeatureStore<i64>>,
    engineer: Arc<FeatureEngineer>,
    classifier: C,
    decision_threshold: f64,
}

impl<C: FraudClassifier> ScoringPipeline<C> {
    /// Requires a fitted engineer whose window matches the store's.
    pub fn new(
        store: Arc<FeatureStore<i64>>,
        engineer: Arc<FeatureEngineer>,
        classifier: C,
    ) -> Result<Self, FeatureError> {
        engineer.fit_state()?;
        let store_window = store.config().window_seconds;
        let fitted_window = engineer.velocity_config().window_seconds;
        if store_window != fitted_window {
            return Err(FeatureError::IncompatibleFitState(format!(
                "store window {store_window}s differs from fitted window {fitted_window}s"
            )));
        }

        Ok(Self {
            store,
            engineer,
            classifier,
            decision_threshold: DEFAULT_DECISION_THRESHOLD,
        })
    }

    pub fn with_decision_threshold(mut self, threshold: f64) -> Self {
        self.decision_threshold = threshold;
        self
    }

    pub fn store(&self) -> &FeatureStore<i64> {
        &self.store
    }

    pub fn engineer(&self) -> &FeatureEngineer {
        &self.engineer
    }

    /// Records the event in the live store, then transforms with the live
    /// count injected. Invalid records are rejected before the store is touched.
    pub fn score(&self, tx: &Transaction) -> Result<ScoredTransaction, FeatureError> {
        self.engineer.fit_state()?;
        tx.validate()
            .map_err(|source| FeatureError::InvalidInput { row: 0, source })?;

        let velocity_count = self.store.record_and_count(&tx.user_id, tx.purchase_time);
        let features = self.engineer.apply_one(tx, Some(velocity_count))?;
        let probability = self.classifier.predict_proba(&features);
        let prediction = u8::from(probability > self.decision_threshold);
        let risk_level = RiskLevel::from_probability(probability);

        info!(
            component = "scoring",
            event = "scoring.transaction.scored",
            user_id = tx.user_id,
            velocity_count,
            probability,
            prediction,
            risk_level = risk_level.as_str()
        );

        Ok(ScoredTransaction {
            velocity_count,
            features,
            probability,
            prediction,
            risk_level,
        })
    }

    pub fn score_raw(&self, raw: RawTransaction) -> Result<ScoredTransaction, FeatureError> {
        let tx = Transaction::try_from(raw)
            .map_err(|source| FeatureError::InvalidInput { row: 0, source })?;
        self.score(&tx)
    }
}
