//! Engine configuration.
//!
//! Each component owns its config struct; [`EngineConfig`] aggregates them so
//! a deployment can ship one JSON document. Every section and field is
//! optional and falls back to its default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::modules::ml::TrainerConfig;
use crate::storage::StorageConfig;
use crate::strategies::arbitration::ArbitrationConfig;
use crate::strategies::core::ParamsError;
use crate::strategies::discovery::DiscoveryConfig;
use crate::strategies::rules::{RuleBasedSelector, RulesConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid rule defaults: {0}")]
    Rules(#[from] ParamsError),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub arbitration: ArbitrationConfig,
    pub trainer: TrainerConfig,
    pub discovery: DiscoveryConfig,
    pub rules: RulesConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Range checks plus a dry build of the rule table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.arbitration.validate().map_err(ConfigError::Invalid)?;
        if self.trainer.update_threshold == 0 {
            return Err(ConfigError::Invalid("trainer.update_threshold must be positive".into()));
        }
        if self.trainer.epochs == 0 {
            return Err(ConfigError::Invalid("trainer.epochs must be positive".into()));
        }
        if self.trainer.learning_rate.is_nan() || self.trainer.learning_rate <= 0.0 {
            return Err(ConfigError::Invalid("trainer.learning_rate must be positive".into()));
        }
        if self.discovery.tactic_timeout_ms == 0 {
            return Err(ConfigError::Invalid("discovery.tactic_timeout_ms must be positive".into()));
        }
        RuleBasedSelector::from_config(&self.rules)?;
        Ok(())
    }
}
