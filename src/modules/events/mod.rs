//! Engine event system.
//!
//! Hooks for logging and custom reactions around selection, outcome
//! reporting, discovery, and retraining.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::strategies::core::{ProtectionType, SelectionMethod, StrategyId};

/// A strategy was handed to a caller.
#[derive(Debug, Clone)]
pub struct SelectionEvent {
    pub protection_type: ProtectionType,
    pub strategy_id: StrategyId,
    pub method: SelectionMethod,
    /// The predictive path was drawn but missed.
    pub fell_back: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub strategy_id: StrategyId,
    pub method: SelectionMethod,
    pub success: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub protection_type: ProtectionType,
    pub url: Url,
    pub tactic: Option<String>,
    pub strategy_id: Option<StrategyId>,
    pub tactics_tried: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetrainEvent {
    pub version: u64,
    pub records: usize,
    pub timestamp: DateTime<Utc>,
}

/// A persistence or model component failed and the engine kept going.
#[derive(Debug, Clone)]
pub struct DegradedEvent {
    pub component: &'static str,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Selection(SelectionEvent),
    Outcome(OutcomeEvent),
    Discovery(DiscoveryEvent),
    Retrain(RetrainEvent),
    Degraded(DegradedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Selection(selection) => {
                log::debug!(
                    "select {} -> {} via {}{}",
                    selection.protection_type,
                    selection.strategy_id,
                    selection.method,
                    if selection.fell_back { " (fallback)" } else { "" }
                );
            }
            EngineEvent::Outcome(outcome) => {
                log::debug!(
                    "outcome {} [{}] success={} ({:.2}s)",
                    outcome.strategy_id,
                    outcome.method,
                    outcome.success,
                    outcome.duration.as_secs_f64()
                );
            }
            EngineEvent::Discovery(discovery) => match &discovery.strategy_id {
                Some(id) => log::info!(
                    "discovery {} at {} found {} after {} tactics",
                    discovery.protection_type,
                    discovery.url,
                    id,
                    discovery.tactics_tried
                ),
                None => log::info!(
                    "discovery {} at {} unresolved after {} tactics",
                    discovery.protection_type,
                    discovery.url,
                    discovery.tactics_tried
                ),
            },
            EngineEvent::Retrain(retrain) => {
                log::info!("model v{} installed from {} records", retrain.version, retrain.records);
            }
            EngineEvent::Degraded(degraded) => {
                log::warn!("degraded {} -> {}", degraded.component, degraded.error);
            }
        }
    }
}
