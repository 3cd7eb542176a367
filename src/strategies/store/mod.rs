//! Strategy store.
//!
//! Durable registry of known strategies and their running statistics. The
//! engine talks to a [`StrategyRepository`]; the in-memory backend lives in
//! [`memory`] and the redb backend in [`crate::storage`].

pub mod memory;

pub use memory::InMemoryStrategyRepository;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::strategies::core::{ProtectionType, Strategy, StrategyId, StrategyStats};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(StrategyId),
    #[error("strategy store backend error: {0}")]
    Backend(String),
    #[error("strategy row encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("strategy store lock poisoned")]
    Poisoned,
}

/// Repository contract over the strategy table
/// (id, protection_type, name, params, success_count, fail_count,
/// total_success_duration, last_used, created_at).
///
/// Implementations must serialise `record_outcome` per strategy so concurrent
/// reporters never lose an increment.
pub trait StrategyRepository: Send + Sync {
    /// Strategies for one protection type, oldest first (ties broken by id).
    fn list_strategies(
        &self,
        protection_type: &ProtectionType,
    ) -> Result<Vec<Strategy>, StoreError>;

    fn get_strategy(&self, id: &StrategyId) -> Result<Option<Strategy>, StoreError>;

    /// `None` for unknown strategies; zeroed stats for strategies never reported.
    fn get_stats(&self, id: &StrategyId) -> Result<Option<StrategyStats>, StoreError>;

    /// Idempotent upsert keyed by id. Params are replaced, stats and the
    /// original creation time are kept.
    fn save(&self, strategy: &Strategy) -> Result<(), StoreError>;

    /// Atomically fold one outcome into the strategy's stats.
    fn record_outcome(
        &self,
        id: &StrategyId,
        success: bool,
        duration: Duration,
        at: DateTime<Utc>,
    ) -> Result<StrategyStats, StoreError>;
}

/// Thin service wrapper shared by the selectors and the engine.
#[derive(Clone)]
pub struct StrategyStore {
    repository: Arc<dyn StrategyRepository>,
}

impl StrategyStore {
    pub fn new(repository: Arc<dyn StrategyRepository>) -> Self {
        Self { repository }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStrategyRepository::new()))
    }

    pub fn list_strategies(
        &self,
        protection_type: &ProtectionType,
    ) -> Result<Vec<Strategy>, StoreError> {
        self.repository.list_strategies(protection_type)
    }

    pub fn get_strategy(&self, id: &StrategyId) -> Result<Option<Strategy>, StoreError> {
        self.repository.get_strategy(id)
    }

    pub fn get_stats(&self, id: &StrategyId) -> Result<Option<StrategyStats>, StoreError> {
        self.repository.get_stats(id)
    }

    pub fn save(&self, strategy: &Strategy) -> Result<(), StoreError> {
        self.repository.save(strategy)?;
        log::debug!(
            "strategy saved: {} ({}) for {}",
            strategy.id,
            strategy.name,
            strategy.protection_type
        );
        Ok(())
    }

    pub fn record_outcome(
        &self,
        id: &StrategyId,
        success: bool,
        duration: Duration,
    ) -> Result<StrategyStats, StoreError> {
        self.repository.record_outcome(id, success, duration, Utc::now())
    }

    /// Every strategy of the protection type paired with its current stats.
    pub fn strategies_with_stats(
        &self,
        protection_type: &ProtectionType,
    ) -> Result<Vec<(Strategy, StrategyStats)>, StoreError> {
        let strategies = self.repository.list_strategies(protection_type)?;
        let mut paired = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let stats = self
                .repository
                .get_stats(&strategy.id)?
                .unwrap_or_else(|| StrategyStats::empty(strategy.id.clone()));
            paired.push((strategy, stats));
        }
        Ok(paired)
    }
}

impl std::fmt::Debug for StrategyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyStore").finish_non_exhaustive()
    }
}
