//! Durable storage on redb.
//!
//! One database file holds three tables:
//! - `strategies`: strategy id -> JSON row (strategy plus running stats)
//! - `outcomes`: dense sequence -> JSON outcome record, append-only
//! - `model`: `current` -> checkpoint bytes, `meta` -> training metadata
//!
//! Every mutation runs in its own write transaction. redb admits one writer
//! at a time, which is what makes `record_outcome` and `append` atomic.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::modules::ml::{CheckpointError, CheckpointStore, ModelCheckpoint, TrainingMeta};
use crate::modules::outcome_log::{OutcomeLog, OutcomeLogError, OutcomeRecord, ordered_timestamp};
use crate::strategies::core::{ProtectionType, Strategy, StrategyId, StrategyStats};
use crate::strategies::store::{StoreError, StrategyRepository};

const STRATEGIES: TableDefinition<&str, &[u8]> = TableDefinition::new("strategies");
const OUTCOMES: TableDefinition<u64, &[u8]> = TableDefinition::new("outcomes");
const MODEL: TableDefinition<&str, &[u8]> = TableDefinition::new("model");

const CHECKPOINT_KEY: &str = "current";
const META_KEY: &str = "meta";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; `None` keeps everything in process memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Database(#[from] redb::Error),
}

fn backend_message<E: Into<redb::Error>>(err: E) -> String {
    let err: redb::Error = err.into();
    err.to_string()
}

fn store_err<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Backend(backend_message(err))
}

fn log_err<E: Into<redb::Error>>(err: E) -> OutcomeLogError {
    OutcomeLogError::Backend(backend_message(err))
}

fn checkpoint_err<E: Into<redb::Error>>(err: E) -> CheckpointError {
    CheckpointError::Backend(backend_message(err))
}

#[derive(Debug, Serialize, Deserialize)]
struct StrategyRow {
    strategy: Strategy,
    stats: StrategyStats,
}

/// Shared handle; cheap to clone.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open (or create) the database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(redb::Error::from)?;
        Self::initialise(db)
    }

    /// Volatile database, mostly for tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(redb::Error::from)?;
        Self::initialise(db)
    }

    fn initialise(db: Database) -> Result<Self, StorageError> {
        let txn = db.begin_write().map_err(redb::Error::from)?;
        {
            txn.open_table(STRATEGIES).map_err(redb::Error::from)?;
            txn.open_table(OUTCOMES).map_err(redb::Error::from)?;
            txn.open_table(MODEL).map_err(redb::Error::from)?;
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn read_row(&self, id: &StrategyId) -> Result<Option<StrategyRow>, StoreError> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(STRATEGIES).map_err(store_err)?;
        let row = table.get(id.as_str()).map_err(store_err)?;
        match row {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn model_value(&self, key: &str) -> Result<Option<Vec<u8>>, CheckpointError> {
        let txn = self.db.begin_read().map_err(checkpoint_err)?;
        let table = txn.open_table(MODEL).map_err(checkpoint_err)?;
        let value = table.get(key).map_err(checkpoint_err)?;
        Ok(value.map(|bytes| bytes.value().to_vec()))
    }

    fn put_model_value(&self, key: &str, bytes: &[u8]) -> Result<(), CheckpointError> {
        let txn = self.db.begin_write().map_err(checkpoint_err)?;
        {
            let mut table = txn.open_table(MODEL).map_err(checkpoint_err)?;
            table.insert(key, bytes).map_err(checkpoint_err)?;
        }
        txn.commit().map_err(checkpoint_err)
    }
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage").finish_non_exhaustive()
    }
}

impl StrategyRepository for RedbStorage {
    fn list_strategies(
        &self,
        protection_type: &ProtectionType,
    ) -> Result<Vec<Strategy>, StoreError> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(STRATEGIES).map_err(store_err)?;
        let mut strategies = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, value) = entry.map_err(store_err)?;
            let row: StrategyRow = serde_json::from_slice(value.value())?;
            if &row.strategy.protection_type == protection_type {
                strategies.push(row.strategy);
            }
        }
        strategies.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(strategies)
    }

    fn get_strategy(&self, id: &StrategyId) -> Result<Option<Strategy>, StoreError> {
        Ok(self.read_row(id)?.map(|row| row.strategy))
    }

    fn get_stats(&self, id: &StrategyId) -> Result<Option<StrategyStats>, StoreError> {
        Ok(self.read_row(id)?.map(|row| row.stats))
    }

    fn save(&self, strategy: &Strategy) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(STRATEGIES).map_err(store_err)?;
            let existing: Option<StrategyRow> = {
                let stored = table.get(strategy.id.as_str()).map_err(store_err)?;
                match stored {
                    Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                    None => None,
                }
            };
            let row = match existing {
                Some(current) => {
                    let mut replacement = strategy.clone();
                    replacement.created_at = current.strategy.created_at;
                    StrategyRow {
                        strategy: replacement,
                        stats: current.stats,
                    }
                }
                None => StrategyRow {
                    strategy: strategy.clone(),
                    stats: StrategyStats::empty(strategy.id.clone()),
                },
            };
            let bytes = serde_json::to_vec(&row)?;
            table
                .insert(strategy.id.as_str(), bytes.as_slice())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    fn record_outcome(
        &self,
        id: &StrategyId,
        success: bool,
        duration: Duration,
        at: DateTime<Utc>,
    ) -> Result<StrategyStats, StoreError> {
        let txn = self.db.begin_write().map_err(store_err)?;
        let stats = {
            let mut table = txn.open_table(STRATEGIES).map_err(store_err)?;
            let mut row: StrategyRow = match table.get(id.as_str()).map_err(store_err)? {
                Some(bytes) => serde_json::from_slice(bytes.value())?,
                None => return Err(StoreError::UnknownStrategy(id.clone())),
            };
            row.stats.apply(success, duration, at);
            let bytes = serde_json::to_vec(&row)?;
            table.insert(id.as_str(), bytes.as_slice()).map_err(store_err)?;
            row.stats
        };
        txn.commit().map_err(store_err)?;
        Ok(stats)
    }
}

impl OutcomeLog for RedbStorage {
    fn append(&self, mut record: OutcomeRecord) -> Result<OutcomeRecord, OutcomeLogError> {
        let txn = self.db.begin_write().map_err(log_err)?;
        {
            let mut table = txn.open_table(OUTCOMES).map_err(log_err)?;
            let tail: Option<(u64, OutcomeRecord)> = match table.last().map_err(log_err)? {
                Some((key, value)) => Some((key.value(), serde_json::from_slice(value.value())?)),
                None => None,
            };
            record.sequence = tail.as_ref().map(|(sequence, _)| sequence + 1).unwrap_or(0);
            record.timestamp =
                ordered_timestamp(record.timestamp, tail.map(|(_, last)| last.timestamp));
            let bytes = serde_json::to_vec(&record)?;
            table.insert(record.sequence, bytes.as_slice()).map_err(log_err)?;
        }
        txn.commit().map_err(log_err)?;
        Ok(record)
    }

    fn len(&self) -> Result<u64, OutcomeLogError> {
        let txn = self.db.begin_read().map_err(log_err)?;
        let table = txn.open_table(OUTCOMES).map_err(log_err)?;
        let tail = table.last().map_err(log_err)?;
        Ok(tail.map(|(key, _)| key.value() + 1).unwrap_or(0))
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<OutcomeRecord>, OutcomeLogError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(log_err)?;
        let table = txn.open_table(OUTCOMES).map_err(log_err)?;
        let mut records = Vec::new();
        for entry in table.range(start..end).map_err(log_err)? {
            let (_, value) = entry.map_err(log_err)?;
            records.push(serde_json::from_slice(value.value())?);
        }
        Ok(records)
    }
}

impl CheckpointStore for RedbStorage {
    fn load_checkpoint(&self) -> Result<Option<ModelCheckpoint>, CheckpointError> {
        self.model_value(CHECKPOINT_KEY)?
            .map(|bytes| ModelCheckpoint::from_bytes(&bytes))
            .transpose()
    }

    fn install_checkpoint(&self, checkpoint: &ModelCheckpoint) -> Result<(), CheckpointError> {
        let bytes = checkpoint.to_bytes()?;
        self.put_model_value(CHECKPOINT_KEY, &bytes)
    }

    fn load_meta(&self) -> Result<Option<TrainingMeta>, CheckpointError> {
        match self.model_value(META_KEY)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_meta(&self, meta: &TrainingMeta) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(meta)?;
        self.put_model_value(META_KEY, &bytes)
    }
}

/// Overwrite the stored checkpoint with arbitrary bytes.
#[doc(hidden)]
pub fn write_raw_checkpoint(storage: &RedbStorage, bytes: &[u8]) -> Result<(), CheckpointError> {
    storage.put_model_value(CHECKPOINT_KEY, bytes)
}
