//! In-memory strategy repository.
//!
//! Each strategy lives in its own row with a dedicated stats mutex, so
//! concurrent reporters only contend on the row they update.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::{StoreError, StrategyRepository};
use crate::strategies::core::{ProtectionType, Strategy, StrategyId, StrategyStats};

#[derive(Debug)]
struct StrategyRow {
    strategy: RwLock<Strategy>,
    stats: Mutex<StrategyStats>,
}

impl StrategyRow {
    fn new(strategy: Strategy) -> Self {
        let stats = StrategyStats::empty(strategy.id.clone());
        Self {
            strategy: RwLock::new(strategy),
            stats: Mutex::new(stats),
        }
    }

    fn strategy(&self) -> Result<Strategy, StoreError> {
        self.strategy
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| StoreError::Poisoned)
    }
}

/// Thread-safe repository backed by a hash map of rows.
#[derive(Debug, Default)]
pub struct InMemoryStrategyRepository {
    rows: RwLock<HashMap<StrategyId, Arc<StrategyRow>>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, id: &StrategyId) -> Result<Option<Arc<StrategyRow>>, StoreError> {
        let guard = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(id).cloned())
    }
}

impl StrategyRepository for InMemoryStrategyRepository {
    fn list_strategies(
        &self,
        protection_type: &ProtectionType,
    ) -> Result<Vec<Strategy>, StoreError> {
        let rows: Vec<Arc<StrategyRow>> = {
            let guard = self.rows.read().map_err(|_| StoreError::Poisoned)?;
            guard.values().cloned().collect()
        };

        let mut strategies = Vec::new();
        for row in rows {
            let strategy = row.strategy()?;
            if &strategy.protection_type == protection_type {
                strategies.push(strategy);
            }
        }
        strategies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(strategies)
    }

    fn get_strategy(&self, id: &StrategyId) -> Result<Option<Strategy>, StoreError> {
        match self.row(id)? {
            Some(row) => row.strategy().map(Some),
            None => Ok(None),
        }
    }

    fn get_stats(&self, id: &StrategyId) -> Result<Option<StrategyStats>, StoreError> {
        match self.row(id)? {
            Some(row) => {
                let stats = row.stats.lock().map_err(|_| StoreError::Poisoned)?;
                Ok(Some(stats.clone()))
            }
            None => Ok(None),
        }
    }

    fn save(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let mut guard = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(row) = guard.get(&strategy.id).cloned() {
            let mut current = row.strategy.write().map_err(|_| StoreError::Poisoned)?;
            let created_at = current.created_at;
            *current = strategy.clone();
            current.created_at = created_at;
        } else {
            guard.insert(strategy.id.clone(), Arc::new(StrategyRow::new(strategy.clone())));
        }
        Ok(())
    }

    fn record_outcome(
        &self,
        id: &StrategyId,
        success: bool,
        duration: Duration,
        at: DateTime<Utc>,
    ) -> Result<StrategyStats, StoreError> {
        let row = self
            .row(id)?
            .ok_or_else(|| StoreError::UnknownStrategy(id.clone()))?;
        let mut stats = row.stats.lock().map_err(|_| StoreError::Poisoned)?;
        stats.apply(success, duration, at);
        Ok(stats.clone())
    }
}
