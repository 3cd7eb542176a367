#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use adaptive_bypass::{
    ExecutionReport, ExecutorError, SelectionContext, StrategyEngine, StrategyEngineBuilder,
    StrategyExecutor, StrategyParams,
};
use async_trait::async_trait;
use url::Url;

type Rule = dyn Fn(&StrategyParams) -> bool + Send + Sync;

/// Executor whose bypass decision is a predicate over the strategy params.
pub struct ScriptedExecutor {
    rule: Box<Rule>,
    calls: Mutex<Vec<StrategyParams>>,
}

impl ScriptedExecutor {
    pub fn new<F>(rule: F) -> Self
    where
        F: Fn(&StrategyParams) -> bool + Send + Sync + 'static,
    {
        Self {
            rule: Box::new(rule),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always() -> Self {
        Self::new(|_| true)
    }

    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn calls(&self) -> Vec<StrategyParams> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
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
        self.calls.lock().unwrap().push(params.clone());
        if (self.rule)(params) {
            Ok(ExecutionReport::new(
                200,
                "<html><head><title>Catalog</title></head><body>items</body></html>",
                Duration::from_millis(120),
            ))
        } else {
            Ok(ExecutionReport::new(
                403,
                "<html><head><title>Just a moment...</title></head></html>",
                Duration::from_millis(300),
            ))
        }
    }
}

/// Deterministic engine: seeded, rule path only, inline retraining.
pub fn builder(executor: Arc<ScriptedExecutor>) -> StrategyEngineBuilder {
    StrategyEngine::builder()
        .with_executor(executor)
        .with_seed(7)
        .with_ml_weight(0.0)
        .disable_background_training()
}

pub fn context(protection_type: &str) -> SelectionContext {
    SelectionContext::parse("https://shop.example/catalog/items", protection_type).unwrap()
}
