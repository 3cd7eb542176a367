//! Core types and the executor seam shared by every strategy component.

pub mod executor;
pub mod types;

pub use executor::{ExecutionReport, ExecutorError, StrategyExecutor};
pub use types::{
    BrowserRenderParams, ContextFeatures, ExecutionMethod, Geolocation, HeaderTweakParams,
    Interaction, InteractiveParams, ParamsError, ProtectionType, ProxyParams, SelectionContext,
    SelectionMethod, Strategy, StrategyId, StrategyOrigin, StrategyParams, StrategyStats,
    Viewport, WaitCondition, path_depth,
};
