//! Predictive strategy selection.
//!
//! Learns which strategy name succeeds for a given request context from the
//! outcome log, and serves predictions from the last fully installed
//! checkpoint.

pub mod checkpoint;
pub mod features;
pub mod model;
pub mod predictor;
pub mod trainer;

pub use checkpoint::{
    CheckpointError, CheckpointSlot, CheckpointStore, MemoryCheckpointStore, ModelCheckpoint,
    ModelParameters, TrainingMeta,
};
pub use features::{FeatureEncoder, FeatureSchema, time_of_day_bucket, user_agent_bucket};
pub use model::{ModelError, SoftmaxModel, TrainingSample};
pub use predictor::{Prediction, PredictionMiss, PredictiveSelector};
pub use trainer::{OnlineTrainer, RetrainOutcome, RetrainTrigger, TrainerConfig, TrainerError};
