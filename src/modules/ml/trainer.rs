//! Online trainer.
//!
//! Watches the outcome log and folds new records into the predictive model.
//! A retrain trains on the delta since the installed checkpoint, persists the
//! new checkpoint, and only then swaps it into the shared slot. Any failure
//! before the swap leaves the previous checkpoint serving predictions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::checkpoint::{
    CheckpointError, CheckpointSlot, CheckpointStore, ModelCheckpoint, ModelParameters,
    TrainingMeta,
};
use super::features::{FeatureEncoder, FeatureSchema};
use super::model::{ModelError, SoftmaxModel, TrainingSample};
use crate::modules::outcome_log::{chain_digest, OutcomeLog, OutcomeLogError};

/// Retrain triggers and SGD settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// New records since the last checkpoint that force a retrain.
    pub update_threshold: u64,
    /// Seconds since the last update that force a retrain.
    pub update_interval_secs: u64,
    pub learning_rate: f64,
    pub l2: f64,
    pub epochs: usize,
    /// Run retrains on the blocking pool when a tokio runtime is available.
    pub background: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            update_threshold: 100,
            update_interval_secs: 24 * 60 * 60,
            learning_rate: 0.05,
            l2: 1e-4,
            epochs: 3,
            background: true,
        }
    }
}

impl TrainerConfig {
    pub fn update_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.update_interval_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Log(#[from] OutcomeLogError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("trainer state lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetrainOutcome {
    Installed { version: u64, records: usize },
    /// Nothing new in the log; only `last_update` moved.
    NoNewRecords,
    AlreadyRunning,
    /// Neither trigger held once the retrain guard was taken.
    NotDue,
}

/// Result of asking the trainer whether it should run.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrainTrigger {
    NotDue,
    /// Handed to the blocking pool.
    Scheduled,
    Completed(RetrainOutcome),
}

#[derive(Debug)]
struct TrainerState {
    meta: TrainingMeta,
    full_retrain_pending: bool,
}

pub struct OnlineTrainer {
    config: TrainerConfig,
    schema: FeatureSchema,
    log: Arc<dyn OutcomeLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    slot: CheckpointSlot,
    state: Mutex<TrainerState>,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OnlineTrainer {
    /// Load metadata and the stored checkpoint into `slot`.
    ///
    /// An unreadable or mismatched checkpoint is discarded and a full retrain
    /// from the start of the log is scheduled instead.
    pub fn open(
        config: TrainerConfig,
        schema: FeatureSchema,
        log: Arc<dyn OutcomeLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        slot: CheckpointSlot,
    ) -> Result<Self, TrainerError> {
        let meta = match checkpoints.load_meta() {
            Ok(Some(meta)) => meta,
            Ok(None) => TrainingMeta::fresh(Utc::now()),
            Err(err) => {
                log::warn!("training metadata unreadable, starting fresh: {}", err);
                TrainingMeta::fresh(Utc::now())
            }
        };

        let mut full_retrain_pending = false;
        match checkpoints.load_checkpoint() {
            Ok(Some(checkpoint)) if checkpoint.feature_schema == schema => {
                log::info!(
                    "loaded model checkpoint v{} covering {} records",
                    checkpoint.version,
                    checkpoint.source_record_count
                );
                slot.install(Arc::new(checkpoint))?;
            }
            Ok(Some(checkpoint)) => {
                log::warn!(
                    "discarding checkpoint v{} built for feature schema v{}",
                    checkpoint.version,
                    checkpoint.feature_schema.version
                );
                full_retrain_pending = true;
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("discarding unreadable model checkpoint: {}", err);
                full_retrain_pending = true;
            }
        }

        Ok(Self {
            config,
            schema,
            log,
            checkpoints,
            slot,
            state: Mutex::new(TrainerState {
                meta,
                full_retrain_pending,
            }),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn slot(&self) -> &CheckpointSlot {
        &self.slot
    }

    pub fn meta(&self) -> Result<TrainingMeta, TrainerError> {
        let state = self.state.lock().map_err(|_| TrainerError::Poisoned)?;
        Ok(state.meta.clone())
    }

    pub fn full_retrain_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.full_retrain_pending)
            .unwrap_or(false)
    }

    /// Log records not yet covered by a usable checkpoint.
    pub fn pending_records(&self) -> Result<u64, TrainerError> {
        let covered = self.covered_records()?;
        Ok(self.log.len()?.saturating_sub(covered))
    }

    fn covered_records(&self) -> Result<u64, TrainerError> {
        if self.full_retrain_pending() {
            return Ok(0);
        }
        Ok(self
            .slot
            .current()
            .map(|checkpoint| checkpoint.source_record_count)
            .unwrap_or(0))
    }

    pub fn should_retrain(&self) -> Result<bool, TrainerError> {
        self.should_retrain_at(Utc::now())
    }

    /// True iff `new_records >= update_threshold` or
    /// `now - last_update >= update_interval`. A discarded checkpoint makes
    /// the next check true as well.
    pub fn should_retrain_at(&self, now: DateTime<Utc>) -> Result<bool, TrainerError> {
        if self.full_retrain_pending() || self.pending_records()? >= self.config.update_threshold {
            return Ok(true);
        }
        let last_update = self.meta()?.last_update;
        Ok(now.signed_duration_since(last_update) >= self.config.update_interval())
    }

    pub fn retrain(&self) -> Result<RetrainOutcome, TrainerError> {
        self.retrain_at(Utc::now())
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Incremental retrain over the delta since the installed checkpoint.
    pub fn retrain_at(&self, now: DateTime<Utc>) -> Result<RetrainOutcome, TrainerError> {
        self.guarded(now, false)
    }

    pub fn retrain_if_due(&self) -> Result<RetrainOutcome, TrainerError> {
        self.retrain_if_due_at(Utc::now())
    }

    /// Retrain only if a trigger still holds after taking the guard, so racing
    /// callers that both saw a trigger produce one checkpoint.
    pub fn retrain_if_due_at(&self, now: DateTime<Utc>) -> Result<RetrainOutcome, TrainerError> {
        self.guarded(now, true)
    }

    fn guarded(
        &self,
        now: DateTime<Utc>,
        only_if_due: bool,
    ) -> Result<RetrainOutcome, TrainerError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(RetrainOutcome::AlreadyRunning);
        }
        let _guard = InFlight(&self.in_flight);
        if only_if_due && !self.should_retrain_at(now)? {
            return Ok(RetrainOutcome::NotDue);
        }
        self.train_delta(now)
    }

    fn train_delta(&self, now: DateTime<Utc>) -> Result<RetrainOutcome, TrainerError> {
        let full = self.full_retrain_pending();
        let base = if full { None } else { self.slot.current() };
        let start = base.as_ref().map(|cp| cp.source_record_count).unwrap_or(0);
        let previous_hash = base
            .as_ref()
            .map(|cp| cp.source_log_hash.clone())
            .unwrap_or_default();

        let end = self.log.len()?;
        let delta = self.log.read_range(start, end)?;
        if delta.is_empty() {
            let meta = {
                let mut state = self.state.lock().map_err(|_| TrainerError::Poisoned)?;
                state.meta.last_update = now;
                state.full_retrain_pending = false;
                state.meta.clone()
            };
            self.checkpoints.save_meta(&meta)?;
            log::debug!("retrain skipped: no new outcome records");
            return Ok(RetrainOutcome::NoNewRecords);
        }

        let mut parameters = match &base {
            Some(checkpoint) => checkpoint.parameters.clone(),
            None => ModelParameters {
                encoder: FeatureEncoder::new(self.schema.clone()),
                model: SoftmaxModel::new(
                    self.schema.width(),
                    self.config.learning_rate,
                    self.config.l2,
                ),
            },
        };
        parameters.model.set_learning_rate(self.config.learning_rate);

        let samples: Vec<TrainingSample> = delta
            .iter()
            .map(|record| TrainingSample {
                features: parameters.encoder.fit_transform(&record.context_features),
                label: record.strategy_name.clone(),
                success: record.success,
            })
            .collect();
        parameters.model.partial_fit(&samples, self.config.epochs)?;

        let source_log_hash = chain_digest(&previous_hash, &delta)?;
        let last_version = self.meta()?.last_version;
        let version = last_version.max(self.slot.version().unwrap_or(0)) + 1;
        let checkpoint = ModelCheckpoint {
            version,
            trained_at: now,
            feature_schema: self.schema.clone(),
            parameters,
            source_record_count: start + delta.len() as u64,
            source_log_hash,
        };

        self.checkpoints.install_checkpoint(&checkpoint)?;
        let records = checkpoint.source_record_count;
        let hash = checkpoint.source_log_hash.clone();
        self.slot.install(Arc::new(checkpoint))?;

        let meta = {
            let mut state = self.state.lock().map_err(|_| TrainerError::Poisoned)?;
            state.meta.last_update = now;
            state.meta.last_hash = hash;
            state.meta.total_records = records;
            state.meta.update_count += 1;
            state.meta.last_version = version;
            state.full_retrain_pending = false;
            state.meta.clone()
        };
        if let Err(err) = self.checkpoints.save_meta(&meta) {
            log::warn!("checkpoint v{} installed but metadata not saved: {}", version, err);
        }

        log::info!(
            "installed model checkpoint v{} ({} new records{})",
            version,
            delta.len(),
            if full { ", full retrain" } else { "" }
        );
        Ok(RetrainOutcome::Installed {
            version,
            records: delta.len(),
        })
    }

    /// Run the scheduled full retrain, if one is pending and there is data.
    pub fn recover(&self) -> Result<Option<RetrainOutcome>, TrainerError> {
        if !self.full_retrain_pending() || self.log.len()? == 0 {
            return Ok(None);
        }
        self.retrain().map(Some)
    }

    /// Retrain if due, off the calling thread when configured and possible.
    pub fn maybe_retrain(self: &Arc<Self>) -> Result<RetrainTrigger, TrainerError> {
        if !self.should_retrain()? {
            return Ok(RetrainTrigger::NotDue);
        }

        if self.config.background {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let trainer = Arc::clone(self);
                handle.spawn_blocking(move || match trainer.retrain_if_due() {
                    Ok(RetrainOutcome::NotDue) => log::debug!("background retrain no longer due"),
                    Ok(_) => {}
                    Err(err) => log::warn!("background retrain failed: {}", err),
                });
                return Ok(RetrainTrigger::Scheduled);
            }
        }

        match self.retrain_if_due()? {
            RetrainOutcome::NotDue => Ok(RetrainTrigger::NotDue),
            outcome => Ok(RetrainTrigger::Completed(outcome)),
        }
    }
}

impl std::fmt::Debug for OnlineTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnlineTrainer")
            .field("config", &self.config)
            .field("checkpoint_version", &self.slot.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ml::checkpoint::MemoryCheckpointStore;
    use crate::modules::outcome_log::{MemoryOutcomeLog, OutcomeRecord};
    use crate::strategies::core::{ContextFeatures, HeaderTweakParams, SelectionMethod, Strategy};
    use std::time::Duration;

    fn config(threshold: u64) -> TrainerConfig {
        TrainerConfig {
            update_threshold: threshold,
            update_interval_secs: 3_600,
            background: false,
            ..TrainerConfig::default()
        }
    }

    fn append(log: &MemoryOutcomeLog, name: &str, success: bool) {
        let strategy =
            Strategy::registered("cloudflare", name, HeaderTweakParams::new("UA")).unwrap();
        log.append(OutcomeRecord::new(
            &strategy,
            SelectionMethod::RuleBased,
            success,
            Duration::from_millis(100),
            ContextFeatures::new("cloudflare"),
            "https://example.com/",
        ))
        .unwrap();
    }

    fn trainer(
        config: TrainerConfig,
        log: Arc<MemoryOutcomeLog>,
        store: Arc<dyn CheckpointStore>,
    ) -> OnlineTrainer {
        OnlineTrainer::open(config, FeatureSchema::default(), log, store, CheckpointSlot::new())
            .unwrap()
    }

    #[test]
    fn triggers_on_threshold_or_interval_only() {
        let log = Arc::new(MemoryOutcomeLog::new());
        let trainer = trainer(config(3), log.clone(), Arc::new(MemoryCheckpointStore::new()));
        let start = trainer.meta().unwrap().last_update;

        append(&log, "a", true);
        append(&log, "a", true);
        assert!(!trainer.should_retrain_at(start).unwrap());
        assert!(!trainer.should_retrain_at(start + chrono::Duration::seconds(3_599)).unwrap());
        assert!(trainer.should_retrain_at(start + chrono::Duration::seconds(3_600)).unwrap());

        append(&log, "a", false);
        assert!(trainer.should_retrain_at(start).unwrap());
    }

    #[test]
    fn retrain_trains_on_delta_and_bumps_version() {
        let log = Arc::new(MemoryOutcomeLog::new());
        let store = Arc::new(MemoryCheckpointStore::new());
        let trainer = trainer(config(2), log.clone(), store.clone());

        append(&log, "a", true);
        append(&log, "b", true);
        let first = trainer.retrain().unwrap();
        assert_eq!(first, RetrainOutcome::Installed { version: 1, records: 2 });
        assert_eq!(trainer.pending_records().unwrap(), 0);

        append(&log, "a", true);
        let second = trainer.retrain().unwrap();
        assert_eq!(second, RetrainOutcome::Installed { version: 2, records: 1 });

        let meta = trainer.meta().unwrap();
        assert_eq!(meta.update_count, 2);
        assert_eq!(meta.total_records, 3);
        let all = log.read_all().unwrap();
        assert_eq!(meta.last_hash, chain_digest("", &all).unwrap());
        assert_eq!(store.load_checkpoint().unwrap().unwrap().version, 2);
    }

    #[test]
    fn empty_delta_only_refreshes_timestamp() {
        let log = Arc::new(MemoryOutcomeLog::new());
        let trainer = trainer(config(1), log, Arc::new(MemoryCheckpointStore::new()));
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(trainer.should_retrain_at(later).unwrap());
        assert_eq!(trainer.retrain_at(later).unwrap(), RetrainOutcome::NoNewRecords);
        assert_eq!(trainer.meta().unwrap().last_update, later);
        assert!(trainer.slot().current().is_none());
    }

    #[test]
    fn corrupt_checkpoint_schedules_full_retrain() {
        let log = Arc::new(MemoryOutcomeLog::new());
        append(&log, "a", true);
        append(&log, "b", false);
        let store =
            Arc::new(MemoryCheckpointStore::with_raw_checkpoint(b"\x00\x01garbage".to_vec()));
        let trainer = trainer(config(100), log, store);

        assert!(trainer.slot().current().is_none());
        assert!(trainer.full_retrain_pending());
        assert!(trainer.should_retrain().unwrap());
        let outcome = trainer.recover().unwrap();
        assert_eq!(outcome, Some(RetrainOutcome::Installed { version: 1, records: 2 }));
        assert!(!trainer.full_retrain_pending());
    }

    struct FailingStore;

    impl CheckpointStore for FailingStore {
        fn load_checkpoint(&self) -> Result<Option<ModelCheckpoint>, CheckpointError> {
            Ok(None)
        }
        fn install_checkpoint(&self, _: &ModelCheckpoint) -> Result<(), CheckpointError> {
            Err(CheckpointError::Backend("disk full".into()))
        }
        fn load_meta(&self) -> Result<Option<TrainingMeta>, CheckpointError> {
            Ok(None)
        }
        fn save_meta(&self, _: &TrainingMeta) -> Result<(), CheckpointError> {
            Ok(())
        }
    }

    #[test]
    fn failed_install_keeps_previous_checkpoint() {
        let log = Arc::new(MemoryOutcomeLog::new());
        append(&log, "a", true);
        let trainer = trainer(config(1), log, Arc::new(FailingStore));
        assert!(trainer.retrain().is_err());
        assert!(trainer.slot().current().is_none());
        assert_eq!(trainer.meta().unwrap().update_count, 0);
        assert!(!trainer.in_flight.load(Ordering::Acquire));
    }

    #[test]
    fn second_racing_retrain_sees_no_trigger() {
        let log = Arc::new(MemoryOutcomeLog::new());
        let trainer = trainer(config(3), log.clone(), Arc::new(MemoryCheckpointStore::new()));
        for _ in 0..3 {
            append(&log, "a", true);
        }
        // Both callers observed the trigger before either ran.
        assert!(trainer.should_retrain().unwrap());
        assert!(trainer.should_retrain().unwrap());

        assert_eq!(
            trainer.retrain_if_due().unwrap(),
            RetrainOutcome::Installed { version: 1, records: 3 }
        );
        append(&log, "a", true);
        assert_eq!(trainer.retrain_if_due().unwrap(), RetrainOutcome::NotDue);
        assert_eq!(trainer.slot().version(), Some(1));
        assert_eq!(trainer.meta().unwrap().update_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn background_retrains_cover_a_full_threshold_each() {
        let log = Arc::new(MemoryOutcomeLog::new());
        let config = TrainerConfig {
            background: true,
            ..config(5)
        };
        let store = Arc::new(MemoryCheckpointStore::new());
        let trainer = Arc::new(trainer(config, log.clone(), store));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let log = Arc::clone(&log);
            let trainer = Arc::clone(&trainer);
            handles.push(tokio::spawn(async move {
                append(&log, "a", true);
                trainer.maybe_retrain().unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut polls = 0;
        while trainer.is_running() || trainer.pending_records().unwrap() >= 5 {
            polls += 1;
            assert!(polls < 500, "background retrain did not settle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let meta = trainer.meta().unwrap();
        assert!(meta.update_count >= 1);
        assert!(meta.total_records >= 5 * meta.update_count);
        assert_eq!(trainer.slot().version(), Some(meta.update_count));
    }

    #[test]
    fn inline_maybe_retrain_completes() {
        let log = Arc::new(MemoryOutcomeLog::new());
        let store = Arc::new(MemoryCheckpointStore::new());
        let trainer = Arc::new(trainer(config(1), log.clone(), store));
        assert_eq!(trainer.maybe_retrain().unwrap(), RetrainTrigger::NotDue);
        append(&log, "a", true);
        assert!(matches!(
            trainer.maybe_retrain().unwrap(),
            RetrainTrigger::Completed(RetrainOutcome::Installed { version: 1, .. })
        ));
    }
}
