//! Strategy model, storage, ranking and the selection paths built on them.

pub mod arbitration;
pub mod core;
pub mod discovery;
pub mod ranking;
pub mod rules;
pub mod store;

pub use arbitration::{ArbitrationConfig, Arbitrator, Choice, MethodStatistics, method_statistics};
pub use discovery::{
    DiscoveryConfig, DiscoveryEngine, DiscoveryOutcome, Tactic, TacticAttempt, TacticStatus,
};
pub use ranking::{RankedStrategy, Ranking, RankingScorer};
pub use rules::{DefaultStrategy, RuleBasedSelector, RulesConfig};
pub use store::{InMemoryStrategyRepository, StoreError, StrategyRepository, StrategyStore};
