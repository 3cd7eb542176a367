//! Executor seam.
//!
//! The engine never fetches pages itself. Callers (and the discovery probe)
//! hand strategy parameters to an executor that performs the actual HTTP or
//! browser work and reports back what happened.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use super::types::{ExecutionMethod, StrategyParams};

/// Contract implemented by HTTP/browser backends.
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, params: &StrategyParams, url: &Url)
    -> Result<ExecutionReport, ExecutorError>;
}

/// What an executor observed while applying a strategy.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub status: u16,
    pub content: String,
    pub duration: Duration,
    pub metadata: HashMap<String, String>,
}

impl ExecutionReport {
    /// Report whose success flag follows the bypass criterion.
    pub fn new(status: u16, content: impl Into<String>, duration: Duration) -> Self {
        let content = content.into();
        let success = status == 200 && !content.trim().is_empty();
        Self {
            success,
            status,
            content,
            duration,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// HTTP-200-equivalent status with a non-empty body.
    pub fn is_bypassed(&self) -> bool {
        self.status == 200 && !self.content.trim().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor transport error: {0}")]
    Transport(String),
    #[error("executor does not support {} strategies", .0.as_str())]
    Unsupported(ExecutionMethod),
    #[error("strategy execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("executor error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_requires_ok_status_and_content() {
        assert!(ExecutionReport::new(200, "<html>ok</html>", Duration::ZERO).is_bypassed());
        assert!(!ExecutionReport::new(200, "   ", Duration::ZERO).is_bypassed());
        assert!(!ExecutionReport::new(403, "denied", Duration::ZERO).is_bypassed());
        assert!(!ExecutionReport::new(503, "", Duration::ZERO).success);
    }
}
