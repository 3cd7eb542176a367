//! # adaptive-bypass
//!
//! Adaptive strategy selection for anti-bot bypass pipelines.
//!
//! Given a detected protection type and a request context, the engine decides
//! which bypass strategy to try next, learns from the reported outcomes, and
//! explores new strategies when nothing known applies.
//!
//! ## Features
//!
//! - Deterministic success-rate-first ranking over recorded outcomes
//! - Built-in default strategies per protection type, configurable
//! - Online-trained predictive selector with copy-on-write checkpoints
//! - Seeded traffic split between ranking and prediction
//! - Tactic-based discovery when a protection type has no strategy
//! - Durable strategies, outcome log and model via redb
//!
//! ## Example
//!
//! ```no_run
//! use adaptive_bypass::{OutcomeReport, SelectionContext, StrategyEngine};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StrategyEngine::builder()
//!         .with_storage_path("strategies.redb")
//!         .build()?;
//!     let context = SelectionContext::parse("https://example.com/", "cloudflare")?;
//!     if let Some(selection) = engine.select_strategy(&context).await.into_selection() {
//!         println!("trying {} ({})", selection.strategy.name, selection.method);
//!         engine.report_outcome(OutcomeReport::from_selection(
//!             &selection,
//!             true,
//!             Duration::from_millis(850),
//!         ))?;
//!     }
//!     Ok(())
//! }
//! ```

mod engine;

pub mod config;
pub mod executors;
pub mod modules;
pub mod storage;
pub mod strategies;

pub use crate::engine::{
    Application,
    EngineError,
    EngineResult,
    EngineWarning,
    OutcomeAck,
    OutcomeReport,
    Selection,
    SelectionOutcome,
    StrategyEngine,
    StrategyEngineBuilder,
};

pub use crate::config::{ConfigError, EngineConfig};

pub use crate::executors::{ExecutorRouter, ReqwestExecutor};

pub use crate::storage::{RedbStorage, StorageConfig, StorageError};

pub use crate::strategies::core::{
    BrowserRenderParams,
    ContextFeatures,
    ExecutionMethod,
    ExecutionReport,
    ExecutorError,
    Geolocation,
    HeaderTweakParams,
    Interaction,
    InteractiveParams,
    ParamsError,
    ProtectionType,
    ProxyParams,
    SelectionContext,
    SelectionMethod,
    Strategy,
    StrategyExecutor,
    StrategyId,
    StrategyOrigin,
    StrategyParams,
    StrategyStats,
    Viewport,
    WaitCondition,
};

pub use crate::strategies::{
    ArbitrationConfig,
    DefaultStrategy,
    DiscoveryConfig,
    DiscoveryOutcome,
    MethodStatistics,
    RuleBasedSelector,
    RulesConfig,
    StoreError,
    StrategyRepository,
    StrategyStore,
    Tactic,
    TacticAttempt,
    TacticStatus,
};

pub use crate::modules::{
    CheckpointStore,
    DegradedEvent,
    DiscoveryEvent,
    EngineEvent,
    EventDispatcher,
    EventHandler,
    FeatureExtractor,
    HtmlFeatureExtractor,
    LoggingHandler,
    OutcomeEvent,
    OutcomeLog,
    OutcomeRecord,
    RetrainEvent,
    RetrainTrigger,
    SelectionEvent,
    TrainerConfig,
    detect_protection,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
