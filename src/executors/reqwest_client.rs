//! Reqwest-backed strategy executor.
//!
//! Runs header-tweak and proxy strategies as plain HTTP GETs. Browser-driven
//! strategies need a real browser and are reported as unsupported.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT};
use reqwest::{Client, Proxy};
use url::Url;

use crate::strategies::core::{
    ExecutionReport, ExecutorError, HeaderTweakParams, ProxyParams, StrategyExecutor,
    StrategyParams,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP executor for non-browser strategies.
pub struct ReqwestExecutor {
    client: Client,
    timeout: Duration,
}

impl ReqwestExecutor {
    pub fn new() -> Result<Self, ExecutorError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ExecutorError> {
        let client = base_builder(timeout)
            .build()
            .map_err(|err| ExecutorError::Transport(err.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// Wrap an existing client; proxy strategies still build their own.
    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn fetch(
        &self,
        client: &Client,
        url: &Url,
        headers: HeaderMap,
    ) -> Result<ExecutionReport, ExecutorError> {
        let started = Instant::now();
        let response = client
            .get(url.as_str())
            .headers(headers)
            .send()
            .await
            .map_err(|err| self.map_error(err))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|err| self.map_error(err))?;
        let elapsed = started.elapsed();

        log::debug!("GET {} -> {} ({:.2}s)", url, status, elapsed.as_secs_f64());
        Ok(ExecutionReport::new(status, body, elapsed).with_metadata("final_url", final_url))
    }

    fn map_error(&self, err: reqwest::Error) -> ExecutorError {
        if err.is_timeout() {
            ExecutorError::Timeout(self.timeout)
        } else {
            ExecutorError::Transport(err.to_string())
        }
    }

    async fn header_tweak(
        &self,
        params: &HeaderTweakParams,
        url: &Url,
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut headers = convert_headers(params.headers.iter())?;
        headers.insert(USER_AGENT, header_value(&params.user_agent)?);
        if let Some(referer) = &params.referer {
            headers.insert(REFERER, header_value(referer)?);
        }
        self.fetch(&self.client, url, headers).await
    }

    async fn proxied(
        &self,
        params: &ProxyParams,
        url: &Url,
    ) -> Result<ExecutionReport, ExecutorError> {
        let proxy = Proxy::all(params.endpoint.as_str())
            .map_err(|err| {
                ExecutorError::Transport(format!("proxy {}: {}", params.endpoint, err))
            })?;
        let client = base_builder(self.timeout)
            .proxy(proxy)
            .build()
            .map_err(|err| ExecutorError::Transport(err.to_string()))?;

        let mut headers = convert_headers(params.headers.iter())?;
        if let Some(user_agent) = &params.user_agent {
            headers.insert(USER_AGENT, header_value(user_agent)?);
        }
        self.fetch(&client, url, headers)
            .await
            .map(|report| report.with_metadata("proxy", params.endpoint.clone()))
    }
}

#[async_trait]
impl StrategyExecutor for ReqwestExecutor {
    fn name(&self) -> &'static str {
        "reqwest"
    }

    async fn apply(
        &self,
        params: &StrategyParams,
        url: &Url,
    ) -> Result<ExecutionReport, ExecutorError> {
        match params {
            StrategyParams::HeaderTweak(params) => self.header_tweak(params, url).await,
            StrategyParams::Proxy(params) => self.proxied(params, url).await,
            other => Err(ExecutorError::Unsupported(other.method())),
        }
    }
}

impl std::fmt::Debug for ReqwestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestExecutor")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn base_builder(timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder().cookie_store(true).timeout(timeout)
}

fn header_value(value: &str) -> Result<HeaderValue, ExecutorError> {
    HeaderValue::from_str(value).map_err(|err| ExecutorError::Other(err.to_string()))
}

fn convert_headers<'a, I>(headers: I) -> Result<HeaderMap, ExecutorError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| ExecutorError::Other(err.to_string()))?;
        map.insert(name, header_value(value)?);
    }
    Ok(map)
}
