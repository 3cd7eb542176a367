//! Predictive selector.

use thiserror::Error;

use super::checkpoint::CheckpointSlot;
use super::features::FeatureSchema;
use super::model::ModelError;
use crate::strategies::core::{ContextFeatures, Strategy};

/// Why a prediction could not be used. Every variant routes the caller to the
/// rule-based path.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictionMiss {
    #[error("no model checkpoint installed")]
    NoCheckpoint,
    #[error("checkpoint schema v{found} does not match expected v{expected}")]
    SchemaMismatch { expected: u32, found: u32 },
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("predicted strategy '{0}' is not registered for this protection type")]
    UnknownStrategy(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub strategy_name: String,
    pub confidence: f64,
    pub checkpoint_version: u64,
}

/// Reads the installed checkpoint and maps context features to a strategy name.
#[derive(Debug, Clone)]
pub struct PredictiveSelector {
    slot: CheckpointSlot,
    schema: FeatureSchema,
}

impl PredictiveSelector {
    pub fn new(slot: CheckpointSlot, schema: FeatureSchema) -> Self {
        Self { slot, schema }
    }

    pub fn checkpoint_version(&self) -> Option<u64> {
        self.slot.version()
    }

    pub fn predict(&self, features: &ContextFeatures) -> Result<Prediction, PredictionMiss> {
        let checkpoint = self.slot.current().ok_or(PredictionMiss::NoCheckpoint)?;
        if checkpoint.feature_schema != self.schema {
            return Err(PredictionMiss::SchemaMismatch {
                expected: self.schema.version,
                found: checkpoint.feature_schema.version,
            });
        }

        let vector = checkpoint.parameters.encoder.transform(features);
        let score = checkpoint.parameters.model.predict(&vector)?;
        Ok(Prediction {
            strategy_name: score.label,
            confidence: score.probability,
            checkpoint_version: checkpoint.version,
        })
    }

    /// Predict and resolve the name among the known candidates.
    pub fn select<'a>(
        &self,
        features: &ContextFeatures,
        candidates: &'a [Strategy],
    ) -> Result<(&'a Strategy, Prediction), PredictionMiss> {
        let prediction = self.predict(features)?;
        let strategy = candidates
            .iter()
            .find(|strategy| strategy.name == prediction.strategy_name)
            .ok_or_else(|| PredictionMiss::UnknownStrategy(prediction.strategy_name.clone()))?;
        log::debug!(
            "predicted {} for {} (p={:.3}, checkpoint v{})",
            strategy.id,
            features.protection_type,
            prediction.confidence,
            prediction.checkpoint_version
        );
        Ok((strategy, prediction))
    }
}
