//! Cross-cutting services module
//!
//! Event hooks, page feature extraction, the outcome log, and the predictive
//! model with its online trainer.

pub mod events;
pub mod extract;
pub mod ml;
pub mod outcome_log;

// Re-export commonly used types
pub use events::{
    DegradedEvent, DiscoveryEvent, EngineEvent, EventDispatcher, EventHandler, LoggingHandler,
    OutcomeEvent, RetrainEvent, SelectionEvent,
};
pub use extract::{FeatureExtractor, HtmlFeatureExtractor, detect_protection, page_title};
pub use ml::{
    CheckpointSlot, CheckpointStore, MemoryCheckpointStore, ModelCheckpoint, OnlineTrainer,
    PredictiveSelector, RetrainOutcome, RetrainTrigger, TrainerConfig, TrainingMeta,
};
pub use outcome_log::{MemoryOutcomeLog, OutcomeLog, OutcomeLogError, OutcomeRecord};
