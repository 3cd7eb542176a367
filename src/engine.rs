//! Strategy engine.
//!
//! [`StrategyEngine`] is the service object callers hold. It answers "which
//! strategy next" for a protection type, takes outcome reports back, and keeps
//! the strategy store, the outcome log and the predictive model in step.
//! Build one through [`StrategyEngineBuilder`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ConfigError, EngineConfig};
use crate::executors::ReqwestExecutor;
use crate::modules::events::{
    DegradedEvent, DiscoveryEvent, EngineEvent, EventDispatcher, EventHandler, LoggingHandler,
    OutcomeEvent, RetrainEvent, SelectionEvent,
};
use crate::modules::extract::{FeatureExtractor, HtmlFeatureExtractor};
use crate::modules::ml::{
    CheckpointSlot, CheckpointStore, FeatureSchema, MemoryCheckpointStore, OnlineTrainer,
    PredictiveSelector, RetrainOutcome, RetrainTrigger, TrainerError,
};
use crate::modules::outcome_log::{MemoryOutcomeLog, OutcomeLog, OutcomeLogError, OutcomeRecord};
use crate::storage::{RedbStorage, StorageError};
use crate::strategies::arbitration::{Arbitrator, MethodStatistics, method_statistics};
use crate::strategies::core::{
    ContextFeatures, ExecutionReport, ExecutorError, ParamsError, ProtectionType,
    SelectionContext, SelectionMethod, Strategy, StrategyExecutor, StrategyId, StrategyStats,
};
use crate::strategies::discovery::{DiscoveryEngine, DiscoveryOutcome, Tactic, TacticAttempt};
use crate::strategies::rules::RuleBasedSelector;
use crate::strategies::store::{
    InMemoryStrategyRepository, StoreError, StrategyRepository, StrategyStore,
};

/// Result alias used across the engine surface.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("strategy store error: {0}")]
    Store(#[from] StoreError),
    #[error("outcome log error: {0}")]
    OutcomeLog(#[from] OutcomeLogError),
    #[error("trainer error: {0}")]
    Trainer(#[from] TrainerError),
    #[error("invalid strategy: {0}")]
    Params(#[from] ParamsError),
    #[error("executor initialisation failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("unknown strategy '{0}'")]
    UnknownStrategy(StrategyId),
}

/// A persistence or model fault the engine worked around.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineWarning {
    /// Candidates could not be read; the answer came from the rule table.
    StoreUnavailable(String),
    NotPersisted {
        strategy_id: StrategyId,
        error: String,
    },
    OutcomeNotLogged(String),
    StatsNotUpdated(String),
    Retrain(String),
}

impl EngineWarning {
    pub fn component(&self) -> &'static str {
        match self {
            EngineWarning::StoreUnavailable(_)
            | EngineWarning::NotPersisted { .. }
            | EngineWarning::StatsNotUpdated(_) => "strategy_store",
            EngineWarning::OutcomeNotLogged(_) => "outcome_log",
            EngineWarning::Retrain(_) => "trainer",
        }
    }
}

impl fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineWarning::StoreUnavailable(err) => {
                write!(f, "strategy store unavailable: {}", err)
            }
            EngineWarning::NotPersisted { strategy_id, error } => {
                write!(f, "strategy {} not persisted: {}", strategy_id, error)
            }
            EngineWarning::OutcomeNotLogged(err) => write!(f, "outcome not logged: {}", err),
            EngineWarning::StatsNotUpdated(err) => write!(f, "stats not updated: {}", err),
            EngineWarning::Retrain(err) => write!(f, "retrain failed: {}", err),
        }
    }
}

/// A strategy handed to the caller and how it was picked.
#[derive(Debug, Clone)]
pub struct Selection {
    pub strategy: Strategy,
    pub method: SelectionMethod,
    pub context: SelectionContext,
    /// The predictive path was drawn but missed.
    pub fell_back: bool,
    /// Set when discovery ran during this call and produced the strategy.
    pub discovered_by: Option<Tactic>,
    pub warnings: Vec<EngineWarning>,
}

#[derive(Debug, Clone)]
pub enum SelectionOutcome {
    Selected(Selection),
    /// No strategy exists and discovery could not find one.
    Unresolved {
        protection_type: ProtectionType,
        attempts: Vec<TacticAttempt>,
        /// The caller deadline cut discovery short.
        aborted: bool,
        warnings: Vec<EngineWarning>,
    },
}

impl SelectionOutcome {
    pub fn selection(&self) -> Option<&Selection> {
        match self {
            SelectionOutcome::Selected(selection) => Some(selection),
            SelectionOutcome::Unresolved { .. } => None,
        }
    }

    pub fn into_selection(self) -> Option<Selection> {
        match self {
            SelectionOutcome::Selected(selection) => Some(selection),
            SelectionOutcome::Unresolved { .. } => None,
        }
    }

    pub fn is_selected(&self) -> bool {
        matches!(self, SelectionOutcome::Selected(_))
    }

    pub fn warnings(&self) -> &[EngineWarning] {
        match self {
            SelectionOutcome::Selected(selection) => &selection.warnings,
            SelectionOutcome::Unresolved { warnings, .. } => warnings,
        }
    }
}

/// What the caller observed after applying a strategy.
#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub strategy: Strategy,
    pub method: SelectionMethod,
    pub success: bool,
    pub duration: Duration,
    pub features: ContextFeatures,
    pub url: url::Url,
}

impl OutcomeReport {
    pub fn new(
        strategy: Strategy,
        method: SelectionMethod,
        url: url::Url,
        success: bool,
        duration: Duration,
    ) -> Self {
        let features = ContextFeatures::for_url(strategy.protection_type.clone(), &url)
            .observed_at(Utc::now());
        Self {
            strategy,
            method,
            success,
            duration,
            features,
            url,
        }
    }

    pub fn from_selection(selection: &Selection, success: bool, duration: Duration) -> Self {
        Self {
            strategy: selection.strategy.clone(),
            method: selection.method,
            success,
            duration,
            features: selection.context.features.clone(),
            url: selection.context.url.clone(),
        }
    }

    pub fn with_features(mut self, features: ContextFeatures) -> Self {
        self.features = features;
        self
    }
}

/// Acknowledgement of a reported outcome.
#[derive(Debug, Clone)]
pub struct OutcomeAck {
    /// The appended record, `None` if the log write failed.
    pub record: Option<OutcomeRecord>,
    /// Stats after the increment, `None` if the store write failed.
    pub stats: Option<StrategyStats>,
    pub retrain: Option<RetrainTrigger>,
    pub warnings: Vec<EngineWarning>,
}

/// Result of [`StrategyEngine::apply_selection`].
#[derive(Debug)]
pub struct Application {
    pub report: Result<ExecutionReport, ExecutorError>,
    /// Features folded into the outcome record.
    pub features: ContextFeatures,
    pub ack: OutcomeAck,
}

/// Fluent builder for [`StrategyEngine`].
pub struct StrategyEngineBuilder {
    config: EngineConfig,
    executor: Option<Arc<dyn StrategyExecutor>>,
    extractor: Option<Arc<dyn FeatureExtractor>>,
    repository: Option<Arc<dyn StrategyRepository>>,
    outcome_log: Option<Arc<dyn OutcomeLog>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl StrategyEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            executor: None,
            extractor: None,
            repository: None,
            outcome_log: None,
            checkpoints: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_ml_weight(mut self, ml_weight: f64) -> Self {
        self.config.arbitration.ml_weight = ml_weight;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.arbitration.seed = Some(seed);
        self
    }

    pub fn with_update_threshold(mut self, threshold: u64) -> Self {
        self.config.trainer.update_threshold = threshold;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_feature_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn StrategyRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_outcome_log(mut self, log: Arc<dyn OutcomeLog>) -> Self {
        self.outcome_log = Some(log);
        self
    }

    pub fn with_checkpoint_store(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Use one redb database for strategies, outcomes and the model.
    pub fn with_storage(self, storage: RedbStorage) -> Self {
        let storage = Arc::new(storage);
        self.with_repository(storage.clone())
            .with_outcome_log(storage.clone())
            .with_checkpoint_store(storage)
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.path = Some(path.into());
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn disable_discovery(mut self) -> Self {
        self.config.discovery.enabled = false;
        self
    }

    pub fn disable_background_training(mut self) -> Self {
        self.config.trainer.background = false;
        self
    }

    pub fn build(self) -> EngineResult<StrategyEngine> {
        StrategyEngine::from_parts(self)
    }
}

impl Default for StrategyEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Adaptive strategy selection service.
pub struct StrategyEngine {
    config: EngineConfig,
    store: StrategyStore,
    log: Arc<dyn OutcomeLog>,
    arbitrator: Arbitrator,
    trainer: Arc<OnlineTrainer>,
    discovery: Option<DiscoveryEngine>,
    executor: Arc<dyn StrategyExecutor>,
    extractor: Arc<dyn FeatureExtractor>,
    events: Arc<EventDispatcher>,
}

impl StrategyEngine {
    /// Engine with default configuration, in-memory persistence and the
    /// reqwest executor.
    pub fn new() -> EngineResult<Self> {
        StrategyEngineBuilder::new().build()
    }

    pub fn builder() -> StrategyEngineBuilder {
        StrategyEngineBuilder::new()
    }

    fn from_parts(builder: StrategyEngineBuilder) -> EngineResult<Self> {
        let StrategyEngineBuilder {
            config,
            executor,
            extractor,
            repository,
            outcome_log,
            checkpoints,
            handlers,
        } = builder;

        config.validate()?;
        let rules = RuleBasedSelector::from_config(&config.rules)?;

        let durable = match &config.storage.path {
            Some(path)
                if repository.is_none() || outcome_log.is_none() || checkpoints.is_none() =>
            {
                log::info!("opening strategy database at {}", path.display());
                Some(Arc::new(RedbStorage::open(path)?))
            }
            _ => None,
        };

        let repository: Arc<dyn StrategyRepository> = match (repository, &durable) {
            (Some(repository), _) => repository,
            (None, Some(storage)) => storage.clone(),
            (None, None) => Arc::new(InMemoryStrategyRepository::new()),
        };
        let log: Arc<dyn OutcomeLog> = match (outcome_log, &durable) {
            (Some(log), _) => log,
            (None, Some(storage)) => storage.clone(),
            (None, None) => Arc::new(MemoryOutcomeLog::new()),
        };
        let checkpoints: Arc<dyn CheckpointStore> = match (checkpoints, &durable) {
            (Some(checkpoints), _) => checkpoints,
            (None, Some(storage)) => storage.clone(),
            (None, None) => Arc::new(MemoryCheckpointStore::new()),
        };

        let executor: Arc<dyn StrategyExecutor> = match executor {
            Some(executor) => executor,
            None => Arc::new(ReqwestExecutor::new()?),
        };
        let extractor = extractor.unwrap_or_else(|| Arc::new(HtmlFeatureExtractor::new()));

        let schema = FeatureSchema::default();
        let slot = CheckpointSlot::new();
        let trainer = Arc::new(OnlineTrainer::open(
            config.trainer.clone(),
            schema.clone(),
            log.clone(),
            checkpoints,
            slot.clone(),
        )?);
        match trainer.recover() {
            Ok(Some(outcome)) => log::info!("model recovered from the outcome log: {:?}", outcome),
            Ok(None) => {}
            Err(err) => log::warn!("model recovery failed, serving rule-based only: {}", err),
        }

        let store = StrategyStore::new(repository);
        let arbitrator = Arbitrator::new(
            config.arbitration.clone(),
            rules,
            PredictiveSelector::new(slot, schema),
        );
        let discovery = config
            .discovery
            .enabled
            .then(|| {
                DiscoveryEngine::new(config.discovery.clone(), executor.clone(), store.clone())
            });

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));
        for handler in handlers {
            events.register_handler(handler);
        }

        let engine = Self {
            config,
            store,
            log,
            arbitrator,
            trainer,
            discovery,
            executor,
            extractor,
            events: Arc::new(events),
        };

        if let Err(err) = engine.bootstrap_defaults() {
            log::warn!("default strategies not bootstrapped: {}", err);
        }
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StrategyStore {
        &self.store
    }

    pub fn outcome_log(&self) -> &Arc<dyn OutcomeLog> {
        &self.log
    }

    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    pub fn trainer(&self) -> &Arc<OnlineTrainer> {
        &self.trainer
    }

    pub fn rules(&self) -> &RuleBasedSelector {
        self.arbitrator.rules()
    }

    /// Version of the checkpoint currently serving predictions.
    pub fn checkpoint_version(&self) -> Option<u64> {
        self.arbitrator.predictor().checkpoint_version()
    }

    /// Pick a strategy for the context's protection type.
    ///
    /// A protection type with no stored strategies and no rule of its own
    /// runs discovery once; only an unsuccessful discovery yields
    /// [`SelectionOutcome::Unresolved`].
    pub async fn select_strategy(&self, context: &SelectionContext) -> SelectionOutcome {
        self.select(context, None).await
    }

    /// Like [`select_strategy`](Self::select_strategy), but discovery stops
    /// starting new tactics once `deadline` passes.
    pub async fn select_strategy_until(
        &self,
        context: &SelectionContext,
        deadline: Instant,
    ) -> SelectionOutcome {
        self.select(context, Some(deadline)).await
    }

    async fn select(
        &self,
        context: &SelectionContext,
        deadline: Option<Instant>,
    ) -> SelectionOutcome {
        let protection_type = &context.protection_type;
        let mut warnings = Vec::new();
        let mut discovered_by = None;

        let candidates = match self.store.strategies_with_stats(protection_type) {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => match &self.discovery {
                Some(discovery) if !self.rules().has_specific(protection_type) => {
                    let outcome = discovery.discover(protection_type, &context.url, deadline).await;
                    self.dispatch_discovery(context, &outcome);
                    match outcome {
                        DiscoveryOutcome::Found {
                            strategy,
                            tactic,
                            persist_error,
                            ..
                        } => {
                            if let Some(err) = persist_error {
                                self.degrade(
                                    EngineWarning::NotPersisted {
                                        strategy_id: strategy.id.clone(),
                                        error: err.to_string(),
                                    },
                                    &mut warnings,
                                );
                            }
                            discovered_by = Some(tactic);
                            match self.store.strategies_with_stats(protection_type) {
                                Ok(stored) if !stored.is_empty() => stored,
                                _ => {
                                    let stats = StrategyStats::empty(strategy.id.clone());
                                    vec![(strategy, stats)]
                                }
                            }
                        }
                        DiscoveryOutcome::NotFound { attempts } => {
                            return SelectionOutcome::Unresolved {
                                protection_type: protection_type.clone(),
                                attempts,
                                aborted: false,
                                warnings,
                            };
                        }
                        DiscoveryOutcome::Aborted { attempts } => {
                            return SelectionOutcome::Unresolved {
                                protection_type: protection_type.clone(),
                                attempts,
                                aborted: true,
                                warnings,
                            };
                        }
                    }
                }
                _ => self.materialize_defaults(protection_type, &mut warnings),
            },
            Err(err) => {
                self.degrade(EngineWarning::StoreUnavailable(err.to_string()), &mut warnings);
                self.rule_defaults(protection_type)
            }
        };

        let Some(choice) = self
            .arbitrator
            .choose(protection_type, &context.features, &candidates)
        else {
            return SelectionOutcome::Unresolved {
                protection_type: protection_type.clone(),
                attempts: Vec::new(),
                aborted: false,
                warnings,
            };
        };

        let fell_back = choice.prediction_miss.is_some();
        self.events.dispatch(EngineEvent::Selection(SelectionEvent {
            protection_type: protection_type.clone(),
            strategy_id: choice.strategy.id.clone(),
            method: choice.method,
            fell_back,
            timestamp: Utc::now(),
        }));

        SelectionOutcome::Selected(Selection {
            strategy: choice.strategy,
            method: choice.method,
            context: context.clone(),
            fell_back,
            discovered_by,
            warnings,
        })
    }

    /// Rule defaults paired with empty stats, without touching the store.
    fn rule_defaults(&self, protection_type: &ProtectionType) -> Vec<(Strategy, StrategyStats)> {
        match self.rules().materialize(protection_type) {
            Ok(strategies) => strategies
                .into_iter()
                .map(|strategy| {
                    let stats = StrategyStats::empty(strategy.id.clone());
                    (strategy, stats)
                })
                .collect(),
            Err(err) => {
                log::warn!("rule defaults for {} are invalid: {}", protection_type, err);
                Vec::new()
            }
        }
    }

    /// Save the rule defaults for an empty protection type, then read back.
    fn materialize_defaults(
        &self,
        protection_type: &ProtectionType,
        warnings: &mut Vec<EngineWarning>,
    ) -> Vec<(Strategy, StrategyStats)> {
        let defaults = self.rule_defaults(protection_type);
        for (strategy, _) in &defaults {
            if let Err(err) = self.store.save(strategy) {
                self.degrade(
                    EngineWarning::NotPersisted {
                        strategy_id: strategy.id.clone(),
                        error: err.to_string(),
                    },
                    warnings,
                );
            }
        }
        match self.store.strategies_with_stats(protection_type) {
            Ok(stored) if !stored.is_empty() => stored,
            _ => defaults,
        }
    }

    /// Record an applied strategy: append to the log, bump the stats, and
    /// give the trainer a chance to run.
    pub fn report_outcome(&self, report: OutcomeReport) -> EngineResult<OutcomeAck> {
        let mut warnings = Vec::new();
        let strategy = match self.store.get_strategy(&report.strategy.id) {
            Ok(Some(stored)) => stored,
            Ok(None) => return Err(EngineError::UnknownStrategy(report.strategy.id)),
            Err(err) => {
                self.degrade(EngineWarning::StoreUnavailable(err.to_string()), &mut warnings);
                report.strategy.clone()
            }
        };

        let mut features = report.features;
        features.protection_type = strategy.protection_type.clone();
        let record = OutcomeRecord::new(
            &strategy,
            report.method,
            report.success,
            report.duration,
            features,
            report.url.as_str(),
        );
        let record = match self.log.append(record) {
            Ok(record) => Some(record),
            Err(err) => {
                self.degrade(EngineWarning::OutcomeNotLogged(err.to_string()), &mut warnings);
                None
            }
        };

        let stats = match self
            .store
            .record_outcome(&strategy.id, report.success, report.duration)
        {
            Ok(stats) => Some(stats),
            Err(err) => {
                self.degrade(EngineWarning::StatsNotUpdated(err.to_string()), &mut warnings);
                None
            }
        };

        self.events.dispatch(EngineEvent::Outcome(OutcomeEvent {
            strategy_id: strategy.id.clone(),
            method: report.method,
            success: report.success,
            duration: report.duration,
            timestamp: Utc::now(),
        }));

        let retrain = match self.trainer.maybe_retrain() {
            Ok(trigger) => {
                if let RetrainTrigger::Completed(RetrainOutcome::Installed { version, records }) =
                    &trigger
                {
                    self.events.dispatch(EngineEvent::Retrain(RetrainEvent {
                        version: *version,
                        records: *records,
                        timestamp: Utc::now(),
                    }));
                }
                Some(trigger)
            }
            Err(err) => {
                self.degrade(EngineWarning::Retrain(err.to_string()), &mut warnings);
                None
            }
        };

        Ok(OutcomeAck {
            record,
            stats,
            retrain,
            warnings,
        })
    }

    /// Execute a selection through the configured executor, extract features
    /// from what came back, and report the outcome. Executor errors and
    /// timeouts count as failed attempts.
    pub async fn apply_selection(
        &self,
        selection: &Selection,
        timeout: Duration,
    ) -> EngineResult<Application> {
        let url = &selection.context.url;
        let started = std::time::Instant::now();
        let attempt = self.executor.apply(&selection.strategy.params, url);
        let report = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout(timeout)),
        };

        let base = selection.context.features.clone();
        let (success, duration, features) = match &report {
            Ok(report) => (
                report.success,
                report.duration,
                self.extractor.extract(url, report, base),
            ),
            Err(err) => {
                log::debug!(
                    "{} via {} failed: {}",
                    selection.strategy.id,
                    self.executor.name(),
                    err
                );
                (false, started.elapsed(), base)
            }
        };

        let outcome = OutcomeReport::from_selection(selection, success, duration)
            .with_features(features.clone());
        let ack = self.report_outcome(outcome)?;
        Ok(Application {
            report,
            features,
            ack,
        })
    }

    /// Per-method aggregates over the whole outcome log.
    pub fn statistics(&self) -> EngineResult<BTreeMap<SelectionMethod, MethodStatistics>> {
        let records = self.log.read_all()?;
        Ok(method_statistics(&records))
    }

    /// Add (or update) a strategy by hand.
    pub fn register_strategy(&self, strategy: Strategy) -> EngineResult<()> {
        if strategy.name.trim().is_empty() {
            return Err(ParamsError::Empty("name").into());
        }
        strategy.params.validate()?;
        self.store.save(&strategy)?;
        Ok(())
    }

    /// Upsert the rule defaults of every protection type with a rule of its
    /// own. Existing stats are kept. Returns the number of strategies written.
    pub fn bootstrap_defaults(&self) -> EngineResult<usize> {
        let mut saved = 0;
        for protection_type in self.rules().protection_types() {
            for strategy in self.rules().materialize(protection_type)? {
                self.store.save(&strategy)?;
                saved += 1;
            }
        }
        log::debug!("bootstrapped {} default strategies", saved);
        Ok(saved)
    }

    fn dispatch_discovery(&self, context: &SelectionContext, outcome: &DiscoveryOutcome) {
        let (tactic, strategy_id) = match outcome {
            DiscoveryOutcome::Found { strategy, tactic, .. } => {
                (Some(tactic.as_str().to_string()), Some(strategy.id.clone()))
            }
            _ => (None, None),
        };
        self.events.dispatch(EngineEvent::Discovery(DiscoveryEvent {
            protection_type: context.protection_type.clone(),
            url: context.url.clone(),
            tactic,
            strategy_id,
            tactics_tried: outcome.attempts().len(),
            timestamp: Utc::now(),
        }));
    }

    fn degrade(&self, warning: EngineWarning, warnings: &mut Vec<EngineWarning>) {
        self.events.dispatch(EngineEvent::Degraded(DegradedEvent {
            component: warning.component(),
            error: warning.to_string(),
            timestamp: Utc::now(),
        }));
        warnings.push(warning);
    }
}

impl fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .field("discovery", &self.discovery.is_some())
            .field("checkpoint_version", &self.checkpoint_version())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::core::HeaderTweakParams;
    use async_trait::async_trait;
    use url::Url;

    struct StaticExecutor;

    #[async_trait]
    impl StrategyExecutor for StaticExecutor {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn apply(
            &self,
            _params: &crate::strategies::core::StrategyParams,
            _url: &Url,
        ) -> Result<ExecutionReport, ExecutorError> {
            Ok(ExecutionReport::new(
                200,
                "<html><head><title>Welcome</title></head><body>ok</body></html>",
                Duration::from_millis(40),
            ))
        }
    }

    struct BrokenRepository;

    impl StrategyRepository for BrokenRepository {
        fn list_strategies(&self, _: &ProtectionType) -> Result<Vec<Strategy>, StoreError> {
            Err(StoreError::Backend("disk gone".into()))
        }

        fn get_strategy(&self, _: &StrategyId) -> Result<Option<Strategy>, StoreError> {
            Err(StoreError::Backend("disk gone".into()))
        }

        fn get_stats(&self, _: &StrategyId) -> Result<Option<StrategyStats>, StoreError> {
            Err(StoreError::Backend("disk gone".into()))
        }

        fn save(&self, _: &Strategy) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk gone".into()))
        }

        fn record_outcome(
            &self,
            _: &StrategyId,
            _: bool,
            _: Duration,
            _: chrono::DateTime<Utc>,
        ) -> Result<StrategyStats, StoreError> {
            Err(StoreError::Backend("disk gone".into()))
        }
    }

    fn engine() -> StrategyEngine {
        StrategyEngine::builder()
            .with_executor(Arc::new(StaticExecutor))
            .with_ml_weight(0.0)
            .with_seed(11)
            .disable_background_training()
            .build()
            .unwrap()
    }

    fn context(protection_type: &str) -> SelectionContext {
        SelectionContext::parse("https://example.com/login", protection_type).unwrap()
    }

    #[tokio::test]
    async fn build_bootstraps_rule_defaults() {
        let engine = engine();
        let cloudflare = engine.store().list_strategies(&"cloudflare".into()).unwrap();
        let mut names: Vec<&str> = cloudflare.iter().map(|s| s.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["browser_interactive", "browser_render", "stealth_headers"]);

        let selection = engine
            .select_strategy(&context("cloudflare"))
            .await
            .into_selection()
            .unwrap();
        assert_eq!(selection.strategy.name, "browser_render");
        assert_eq!(selection.method, SelectionMethod::RuleBased);
        assert!(selection.warnings.is_empty());
    }

    #[tokio::test]
    async fn unknown_strategy_report_is_rejected() {
        let engine = engine();
        let stray =
            Strategy::registered("cloudflare", "never_saved", HeaderTweakParams::new("UA"))
                .unwrap();
        let report = OutcomeReport::new(
            stray,
            SelectionMethod::RuleBased,
            Url::parse("https://example.com/").unwrap(),
            true,
            Duration::from_millis(10),
        );
        assert!(matches!(
            engine.report_outcome(report),
            Err(EngineError::UnknownStrategy(_))
        ));
        assert_eq!(engine.outcome_log().len().unwrap(), 0);
    }

    #[tokio::test]
    async fn store_outage_degrades_to_rule_defaults() {
        let engine = StrategyEngine::builder()
            .with_executor(Arc::new(StaticExecutor))
            .with_repository(Arc::new(BrokenRepository))
            .with_ml_weight(0.0)
            .disable_background_training()
            .build()
            .unwrap();

        let outcome = engine.select_strategy(&context("cloudflare")).await;
        let selection = outcome.selection().unwrap();
        assert_eq!(selection.strategy.name, "browser_render");
        assert!(matches!(
            selection.warnings.as_slice(),
            [EngineWarning::StoreUnavailable(_)]
        ));

        let ack = engine
            .report_outcome(OutcomeReport::from_selection(
                selection,
                true,
                Duration::from_millis(5),
            ))
            .unwrap();
        assert!(ack.record.is_some());
        assert!(ack.stats.is_none());
        assert!(ack
            .warnings
            .iter()
            .any(|warning| matches!(warning, EngineWarning::StatsNotUpdated(_))));
    }

    #[tokio::test]
    async fn apply_selection_reports_extracted_features() {
        let engine = engine();
        let selection = engine
            .select_strategy(&context("ddos_guard"))
            .await
            .into_selection()
            .unwrap();
        let applied = engine.apply_selection(&selection, Duration::from_secs(5)).await.unwrap();

        assert!(applied.report.is_ok());
        let record = applied.ack.record.unwrap();
        assert!(record.success);
        assert_eq!(record.duration, Duration::from_millis(40));
        assert_eq!(record.context_features.url_depth, 1);
        assert_eq!(applied.ack.stats.unwrap().success_count, 1);

        let stats = engine.statistics().unwrap();
        assert_eq!(stats[&SelectionMethod::RuleBased].count, 1);
        assert!(!stats.contains_key(&SelectionMethod::Predictive));
    }

    #[tokio::test]
    async fn registered_strategy_is_selectable() {
        let engine = StrategyEngine::builder()
            .with_executor(Arc::new(StaticExecutor))
            .with_ml_weight(0.0)
            .disable_discovery()
            .disable_background_training()
            .build()
            .unwrap();
        let custom =
            Strategy::registered("akamai", "custom_headers", HeaderTweakParams::new("UA/1.0"))
                .unwrap();
        engine.register_strategy(custom.clone()).unwrap();

        let selection = engine.select_strategy(&context("akamai")).await.into_selection().unwrap();
        assert_eq!(selection.strategy.id, custom.id);
        assert!(selection.discovered_by.is_none());
    }

    #[tokio::test]
    async fn registrations_with_overlapping_names_stay_separate() {
        let engine = engine();
        let first = Strategy::registered("a", "b_c", HeaderTweakParams::new("UA/1.0")).unwrap();
        let second = Strategy::registered("a_b", "c", HeaderTweakParams::new("UA/2.0")).unwrap();
        engine.register_strategy(first.clone()).unwrap();
        engine.register_strategy(second.clone()).unwrap();

        let under_a = engine.store().list_strategies(&"a".into()).unwrap();
        let under_a_b = engine.store().list_strategies(&"a_b".into()).unwrap();
        assert_eq!(under_a.len(), 1);
        assert_eq!(under_a[0].id, first.id);
        assert_eq!(under_a_b.len(), 1);
        assert_eq!(under_a_b[0].id, second.id);
    }
}
