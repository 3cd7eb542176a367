//! Discovery engine.
//!
//! Runs the fixed tactic list against a URL when a protection type has no
//! known strategy. Tactics run one after another (browser tactics may hold
//! session state), each under its own timeout. The first variant the executor
//! reports as bypassed is saved as a new strategy in one upsert.

pub mod tactics;

pub use tactics::{NamedGeolocation, Tactic, TacticCatalog, TacticVariant};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::strategies::core::{
    ProtectionType, Strategy, StrategyExecutor, StrategyId, StrategyOrigin, Viewport,
};
use crate::strategies::store::{StoreError, StrategyStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Budget for one tactic, all of its variants included.
    pub tactic_timeout_ms: u64,
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub viewports: Vec<Viewport>,
    pub geolocations: Vec<NamedGeolocation>,
    pub locale: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        let catalog = TacticCatalog::default();
        Self {
            enabled: true,
            tactic_timeout_ms: 30_000,
            user_agents: catalog.user_agents,
            proxies: catalog.proxies,
            viewports: catalog.viewports,
            geolocations: catalog.geolocations,
            locale: catalog.locale,
        }
    }
}

impl DiscoveryConfig {
    pub fn tactic_timeout(&self) -> Duration {
        Duration::from_millis(self.tactic_timeout_ms)
    }

    pub fn catalog(&self) -> TacticCatalog {
        TacticCatalog {
            user_agents: self.user_agents.clone(),
            proxies: self.proxies.clone(),
            viewports: self.viewports.clone(),
            geolocations: self.geolocations.clone(),
            locale: self.locale.clone(),
        }
    }
}

/// How one tactic ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TacticStatus {
    Succeeded,
    /// Every variant was probed without a bypass.
    Exhausted,
    TimedOut,
    /// The caller deadline fired while the tactic was running.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TacticAttempt {
    pub tactic: Tactic,
    pub probes: usize,
    pub status: TacticStatus,
}

#[derive(Debug)]
pub enum DiscoveryOutcome {
    Found {
        strategy: Strategy,
        tactic: Tactic,
        attempts: Vec<TacticAttempt>,
        /// Set when the strategy worked but could not be persisted.
        persist_error: Option<StoreError>,
    },
    NotFound {
        attempts: Vec<TacticAttempt>,
    },
    /// Caller deadline reached before the tactic list was exhausted.
    Aborted {
        attempts: Vec<TacticAttempt>,
    },
}

impl DiscoveryOutcome {
    pub fn attempts(&self) -> &[TacticAttempt] {
        match self {
            DiscoveryOutcome::Found { attempts, .. }
            | DiscoveryOutcome::NotFound { attempts }
            | DiscoveryOutcome::Aborted { attempts } => attempts,
        }
    }

    pub fn strategy(&self) -> Option<&Strategy> {
        match self {
            DiscoveryOutcome::Found { strategy, .. } => Some(strategy),
            _ => None,
        }
    }
}

enum Probe {
    Bypassed(Strategy, usize),
    Exhausted(usize),
}

pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    catalog: TacticCatalog,
    executor: Arc<dyn StrategyExecutor>,
    store: StrategyStore,
}

impl DiscoveryEngine {
    pub fn new(
        config: DiscoveryConfig,
        executor: Arc<dyn StrategyExecutor>,
        store: StrategyStore,
    ) -> Self {
        let catalog = config.catalog();
        Self {
            config,
            catalog,
            executor,
            store,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn StrategyExecutor> {
        &self.executor
    }

    /// Explore tactics until one bypasses, the list runs out, or `deadline`
    /// passes.
    pub async fn discover(
        &self,
        protection_type: &ProtectionType,
        url: &Url,
        deadline: Option<Instant>,
    ) -> DiscoveryOutcome {
        log::info!("discovery started for {} at {}", protection_type, url);
        let mut attempts = Vec::with_capacity(Tactic::ORDERED.len());

        for tactic in Tactic::ORDERED {
            let mut budget = self.config.tactic_timeout();
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    log::info!("discovery for {} aborted before {}", protection_type, tactic);
                    return DiscoveryOutcome::Aborted { attempts };
                }
                budget = budget.min(remaining);
            }

            let probe =
                tokio::time::timeout(budget, self.run_tactic(tactic, protection_type, url)).await;
            match probe {
                Ok(Probe::Bypassed(strategy, probes)) => {
                    attempts.push(TacticAttempt {
                        tactic,
                        probes,
                        status: TacticStatus::Succeeded,
                    });
                    let persist_error = self.store.save(&strategy).err();
                    if let Some(err) = &persist_error {
                        log::warn!("discovered strategy {} not persisted: {}", strategy.id, err);
                    }
                    log::info!(
                        "discovery for {} found {} via {}",
                        protection_type,
                        strategy.id,
                        tactic
                    );
                    return DiscoveryOutcome::Found {
                        strategy,
                        tactic,
                        attempts,
                        persist_error,
                    };
                }
                Ok(Probe::Exhausted(probes)) => {
                    log::debug!("tactic {} exhausted after {} probes", tactic, probes);
                    attempts.push(TacticAttempt {
                        tactic,
                        probes,
                        status: TacticStatus::Exhausted,
                    });
                }
                Err(_) => {
                    let aborted = deadline.is_some_and(|deadline| Instant::now() >= deadline);
                    let status = if aborted {
                        TacticStatus::Aborted
                    } else {
                        TacticStatus::TimedOut
                    };
                    log::debug!("tactic {} ended: {:?}", tactic, status);
                    attempts.push(TacticAttempt {
                        tactic,
                        probes: 0,
                        status,
                    });
                    if aborted {
                        return DiscoveryOutcome::Aborted { attempts };
                    }
                }
            }
        }

        log::info!("discovery for {} exhausted every tactic", protection_type);
        DiscoveryOutcome::NotFound { attempts }
    }

    async fn run_tactic(
        &self,
        tactic: Tactic,
        protection_type: &ProtectionType,
        url: &Url,
    ) -> Probe {
        let mut probes = 0;
        for variant in self.catalog.variants(tactic) {
            let built = StrategyId::derived(protection_type, tactic.as_str(), &variant.params)
                .and_then(|id| {
                    Strategy::new(
                        id,
                        protection_type.clone(),
                        variant.name.clone(),
                        variant.params.clone(),
                        StrategyOrigin::Discovered {
                            tactic: tactic.as_str().to_string(),
                        },
                    )
                });
            let strategy = match built {
                Ok(strategy) => strategy,
                Err(err) => {
                    log::warn!("skipping invalid {} variant {}: {}", tactic, variant.name, err);
                    continue;
                }
            };

            probes += 1;
            match self.executor.apply(&strategy.params, url).await {
                Ok(report) if report.is_bypassed() => return Probe::Bypassed(strategy, probes),
                Ok(report) => {
                    log::debug!(
                        "{} probe {} returned status {}",
                        tactic,
                        variant.name,
                        report.status
                    );
                }
                Err(err) => {
                    log::debug!("{} probe {} failed: {}", tactic, variant.name, err);
                }
            }
        }
        Probe::Exhausted(probes)
    }
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::core::{
        ExecutionMethod, ExecutionReport, ExecutorError, StrategyParams,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Bypasses only for the listed execution methods.
    struct ScriptedExecutor {
        bypass: Vec<ExecutionMethod>,
        delay: Duration,
        calls: Mutex<Vec<ExecutionMethod>>,
    }

    impl ScriptedExecutor {
        fn new(bypass: Vec<ExecutionMethod>) -> Self {
            Self {
                bypass,
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StrategyExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn apply(
            &self,
            params: &StrategyParams,
            _url: &Url,
        ) -> Result<ExecutionReport, ExecutorError> {
            self.calls.lock().unwrap().push(params.method());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.bypass.contains(&params.method()) {
                Ok(ExecutionReport::new(200, "<html>content</html>", Duration::from_millis(5)))
            } else {
                Err(ExecutorError::Transport("403 from upstream".into()))
            }
        }
    }

    fn url() -> Url {
        Url::parse("https://guarded.example/").unwrap()
    }

    #[tokio::test]
    async fn first_successful_tactic_wins() {
        let executor = Arc::new(ScriptedExecutor::new(vec![ExecutionMethod::HeaderTweak]));
        let store = StrategyStore::in_memory();
        let engine =
            DiscoveryEngine::new(DiscoveryConfig::default(), executor.clone(), store.clone());

        let outcome = engine.discover(&"akamai".into(), &url(), None).await;
        let strategy = outcome.strategy().unwrap().clone();
        assert_eq!(strategy.name, "user_agent_rotation_1");
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        assert_eq!(store.list_strategies(&"akamai".into()).unwrap(), vec![strategy]);
    }

    #[tokio::test]
    async fn rediscovery_reuses_the_same_id() {
        let executor = Arc::new(ScriptedExecutor::new(vec![ExecutionMethod::Interactive]));
        let store = StrategyStore::in_memory();
        let engine = DiscoveryEngine::new(DiscoveryConfig::default(), executor, store.clone());

        let first = engine.discover(&"akamai".into(), &url(), None).await;
        let second = engine.discover(&"akamai".into(), &url(), None).await;
        assert_eq!(first.strategy().unwrap().id, second.strategy().unwrap().id);
        assert_eq!(store.list_strategies(&"akamai".into()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_not_found() {
        let executor = Arc::new(ScriptedExecutor::new(vec![]));
        let store = StrategyStore::in_memory();
        let engine = DiscoveryEngine::new(DiscoveryConfig::default(), executor, store.clone());

        let outcome = engine.discover(&"akamai".into(), &url(), None).await;
        assert!(matches!(outcome, DiscoveryOutcome::NotFound { .. }));
        let statuses: Vec<_> = outcome.attempts().iter().map(|a| a.status).collect();
        assert_eq!(statuses, vec![TacticStatus::Exhausted; 5]);
        assert_eq!(outcome.attempts()[0].probes, 4);
        assert_eq!(outcome.attempts()[1].probes, 8);
        assert!(store.list_strategies(&"akamai".into()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_tactic_times_out_and_discovery_moves_on() {
        let mut scripted = ScriptedExecutor::new(vec![ExecutionMethod::BrowserRender]);
        scripted.delay = Duration::from_millis(40);
        let executor = Arc::new(scripted);
        let config = DiscoveryConfig {
            tactic_timeout_ms: 60,
            ..DiscoveryConfig::default()
        };
        let engine = DiscoveryEngine::new(config, executor, StrategyStore::in_memory());

        let outcome = engine.discover(&"akamai".into(), &url(), None).await;
        assert_eq!(outcome.attempts()[0].status, TacticStatus::TimedOut);
        assert_eq!(outcome.strategy().unwrap().name, "viewport_variation_1920x1080");
    }

    #[tokio::test]
    async fn expired_deadline_aborts_without_probing() {
        let executor = Arc::new(ScriptedExecutor::new(vec![ExecutionMethod::HeaderTweak]));
        let store = StrategyStore::in_memory();
        let engine =
            DiscoveryEngine::new(DiscoveryConfig::default(), executor.clone(), store.clone());

        let outcome = engine
            .discover(&"akamai".into(), &url(), Some(Instant::now()))
            .await;
        assert!(matches!(outcome, DiscoveryOutcome::Aborted { .. }));
        assert!(executor.calls.lock().unwrap().is_empty());
        assert!(store.list_strategies(&"akamai".into()).unwrap().is_empty());
    }
}
