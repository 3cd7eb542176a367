//! Strategy executors.
//!
//! [`ReqwestExecutor`] covers the HTTP strategies. [`ExecutorRouter`] lets a
//! caller plug a browser backend in for the browser strategies while keeping
//! one executor handle for the engine.

pub mod reqwest_client;

pub use reqwest_client::ReqwestExecutor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::strategies::core::{
    ExecutionMethod, ExecutionReport, ExecutorError, StrategyExecutor, StrategyParams,
};

/// Dispatches each strategy to the executor registered for its method.
#[derive(Default, Clone)]
pub struct ExecutorRouter {
    routes: HashMap<ExecutionMethod, Arc<dyn StrategyExecutor>>,
    fallback: Option<Arc<dyn StrategyExecutor>>,
}

impl ExecutorRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, method: ExecutionMethod, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.routes.insert(method, executor);
        self
    }

    /// Executor for methods without an explicit route.
    pub fn fallback(mut self, executor: Arc<dyn StrategyExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }
}

#[async_trait]
impl StrategyExecutor for ExecutorRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn apply(
        &self,
        params: &StrategyParams,
        url: &Url,
    ) -> Result<ExecutionReport, ExecutorError> {
        let method = params.method();
        let executor = self
            .routes
            .get(&method)
            .or(self.fallback.as_ref())
            .ok_or(ExecutorError::Unsupported(method))?;
        executor.apply(params, url).await
    }
}

impl std::fmt::Debug for ExecutorRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<(&'static str, &'static str)> = self
            .routes
            .iter()
            .map(|(method, executor)| (method.as_str(), executor.name()))
            .collect();
        routes.sort();
        f.debug_struct("ExecutorRouter")
            .field("routes", &routes)
            .field("fallback", &self.fallback.as_ref().map(|executor| executor.name()))
            .finish()
    }
}
