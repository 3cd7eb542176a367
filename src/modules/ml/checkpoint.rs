//! Model checkpoints and training metadata.
//!
//! A checkpoint is built completely off to the side, persisted, and only then
//! swapped into the [`CheckpointSlot`] that selection reads from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use super::features::{FeatureEncoder, FeatureSchema};
use super::model::SoftmaxModel;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("model checkpoint is corrupt: {0}")]
    Corrupt(String),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("checkpoint backend error: {0}")]
    Backend(String),
    #[error("checkpoint lock poisoned")]
    Poisoned,
}

/// Fitted encoder and model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub encoder: FeatureEncoder,
    pub model: SoftmaxModel,
}

/// Versioned, immutable snapshot of the predictive model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub feature_schema: FeatureSchema,
    pub parameters: ModelParameters,
    /// Outcome log length covered by this checkpoint.
    pub source_record_count: u64,
    /// Chained digest of the covered log prefix.
    pub source_log_hash: String,
}

impl ModelCheckpoint {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and sanity-check a stored checkpoint.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let checkpoint: Self =
            serde_json::from_slice(bytes).map_err(|err| CheckpointError::Corrupt(err.to_string()))?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    fn verify(&self) -> Result<(), CheckpointError> {
        if self.parameters.encoder.schema() != &self.feature_schema {
            return Err(CheckpointError::Corrupt(
                "encoder schema differs from checkpoint schema".into(),
            ));
        }
        let width = self.feature_schema.width();
        if self.parameters.model.width() != width {
            return Err(CheckpointError::Corrupt(format!(
                "model width {} does not match schema width {}",
                self.parameters.model.width(),
                width
            )));
        }
        self.parameters
            .model
            .check_shape()
            .map_err(|err| CheckpointError::Corrupt(err.to_string()))

    }
}

/// Trainer bookkeeping persisted next to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingMeta {
    pub last_update: DateTime<Utc>,
    pub last_hash: String,
    pub total_records: u64,
    pub update_count: u64,
    #[serde(default)]
    pub last_version: u64,
}

impl TrainingMeta {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            last_update: now,
            last_hash: String::new(),
            total_records: 0,
            update_count: 0,
            last_version: 0,
        }
    }
}

/// Persistence for the checkpoint artifact and its metadata record.
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when nothing was ever installed; `Corrupt` when the stored
    /// artifact cannot be decoded.
    fn load_checkpoint(&self) -> Result<Option<ModelCheckpoint>, CheckpointError>;

    /// Replace the stored checkpoint in one write.
    fn install_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<(), CheckpointError>;

    fn load_meta(&self) -> Result<Option<TrainingMeta>, CheckpointError>;

    fn save_meta(&self, meta: &TrainingMeta) -> Result<(), CheckpointError>;
}

/// Process-local checkpoint store. Keeps the encoded bytes so decoding is
/// exercised the same way as with durable storage.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Mutex<Option<Vec<u8>>>,
    meta: Mutex<Option<TrainingMeta>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw bytes, e.g. a damaged artifact.
    pub fn with_raw_checkpoint(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            checkpoint: Mutex::new(Some(bytes.into())),
            meta: Mutex::new(None),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load_checkpoint(&self) -> Result<Option<ModelCheckpoint>, CheckpointError> {
        let guard = self.checkpoint.lock().map_err(|_| CheckpointError::Poisoned)?;
        guard.as_deref().map(ModelCheckpoint::from_bytes).transpose()
    }

    fn install_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<(), CheckpointError> {
        let bytes = checkpoint.to_bytes()?;
        let mut guard = self.checkpoint.lock().map_err(|_| CheckpointError::Poisoned)?;
        *guard = Some(bytes);
        Ok(())
    }

    fn load_meta(&self) -> Result<Option<TrainingMeta>, CheckpointError> {
        let guard = self.meta.lock().map_err(|_| CheckpointError::Poisoned)?;
        Ok(guard.clone())
    }

    fn save_meta(&self, meta: &TrainingMeta) -> Result<(), CheckpointError> {
        let mut guard = self.meta.lock().map_err(|_| CheckpointError::Poisoned)?;
        *guard = Some(meta.clone());
        Ok(())
    }
}

/// Copy-on-write holder of the installed checkpoint.
///
/// Readers clone the inner `Arc` and keep using it even if a newer checkpoint
/// is installed meanwhile.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSlot {
    inner: Arc<RwLock<Option<Arc<ModelCheckpoint>>>>,
}

impl CheckpointSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<ModelCheckpoint>> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }

    pub fn version(&self) -> Option<u64> {
        self.current().map(|checkpoint| checkpoint.version)
    }

    pub fn install(&self, checkpoint: Arc<ModelCheckpoint>) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().map_err(|_| CheckpointError::Poisoned)?;
        *guard = Some(checkpoint);
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CheckpointError> {
        let mut guard = self.inner.write().map_err(|_| CheckpointError::Poisoned)?;
        *guard = None;
        Ok(())
    }
}
