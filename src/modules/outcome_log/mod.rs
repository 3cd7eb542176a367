//! Append-only outcome log.
//!
//! Every strategy application lands here exactly once. The log is the training
//! corpus for the online trainer and the source for per-method statistics;
//! records are never mutated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::strategies::core::{
    ContextFeatures, ProtectionType, SelectionMethod, Strategy, StrategyId,
};

/// One strategy application and its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Dense append position, assigned by the log.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub strategy_id: StrategyId,
    pub strategy_name: String,
    pub method: SelectionMethod,
    pub protection_type: ProtectionType,
    pub success: bool,
    pub duration: Duration,
    pub context_features: ContextFeatures,
    pub url: String,
}

impl OutcomeRecord {
    pub fn new(
        strategy: &Strategy,
        method: SelectionMethod,
        success: bool,
        duration: Duration,
        context_features: ContextFeatures,
        url: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            strategy_id: strategy.id.clone(),
            strategy_name: strategy.name.clone(),
            method,
            protection_type: strategy.protection_type.clone(),
            success,
            duration,
            context_features,
            url: url.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Error)]
pub enum OutcomeLogError {
    #[error("outcome log backend error: {0}")]
    Backend(String),
    #[error("outcome record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("outcome log lock poisoned")]
    Poisoned,
}

/// Repository contract over the append-only outcome table
/// (timestamp, strategy_id, method, protection_type, success, duration,
/// context_features, url).
pub trait OutcomeLog: Send + Sync {
    /// Append a record. The log assigns the sequence number and clamps a
    /// timestamp older than the current tail to the tail's timestamp so the
    /// log stays ordered by time.
    fn append(&self, record: OutcomeRecord) -> Result<OutcomeRecord, OutcomeLogError>;

    fn len(&self) -> Result<u64, OutcomeLogError>;

    /// Records with `start <= sequence < end`.
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<OutcomeRecord>, OutcomeLogError>;

    fn read_all(&self) -> Result<Vec<OutcomeRecord>, OutcomeLogError> {
        let len = self.len()?;
        self.read_range(0, len)
    }
}

/// Extend a log digest with further records.
///
/// Digests chain: `chain_digest(&chain_digest("", a)?, b)` equals
/// `chain_digest("", a ++ b)`, so a checkpoint can extend its predecessor's
/// digest with only the delta it trained on.
pub fn chain_digest(previous: &str, records: &[OutcomeRecord]) -> Result<String, OutcomeLogError> {
    let mut digest = previous.to_string();
    for record in records {
        let mut hasher = Sha256::new();
        hasher.update(digest.as_bytes());
        hasher.update(serde_json::to_vec(record)?);
        digest = hex::encode(hasher.finalize());
    }
    Ok(digest)
}

pub(crate) fn ordered_timestamp(
    candidate: DateTime<Utc>,
    tail: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    match tail {
        Some(last) if last > candidate => last,
        _ => candidate,
    }
}

/// Process-local log, used in tests and when no storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryOutcomeLog {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl MemoryOutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutcomeLog for MemoryOutcomeLog {
    fn append(&self, mut record: OutcomeRecord) -> Result<OutcomeRecord, OutcomeLogError> {
        let mut guard = self.records.lock().map_err(|_| OutcomeLogError::Poisoned)?;
        record.sequence = guard.len() as u64;
        record.timestamp = ordered_timestamp(record.timestamp, guard.last().map(|r| r.timestamp));
        guard.push(record.clone());
        Ok(record)
    }

    fn len(&self) -> Result<u64, OutcomeLogError> {
        let guard = self.records.lock().map_err(|_| OutcomeLogError::Poisoned)?;
        Ok(guard.len() as u64)
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<OutcomeRecord>, OutcomeLogError> {
        let guard = self.records.lock().map_err(|_| OutcomeLogError::Poisoned)?;
        let end = (end as usize).min(guard.len());
        let start = (start as usize).min(end);
        Ok(guard[start..end].to_vec())
    }
}
