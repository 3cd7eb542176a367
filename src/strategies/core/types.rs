//! Core data structures shared across the store, selectors, trainer, and
//! discovery layers.

use chrono::{DateTime, Timelike, Utc};
use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Category label for a detected anti-bot mechanism (`cloudflare`, `captcha`…).
///
/// Labels are normalised to trimmed lowercase so `Cloudflare` and `cloudflare`
/// address the same strategies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProtectionType(String);

impl ProtectionType {
    pub fn new(label: impl AsRef<str>) -> Self {
        Self(label.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtectionType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProtectionType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<ProtectionType> for String {
    fn from(value: ProtectionType) -> Self {
        value.0
    }
}

/// Unique strategy identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(String);

impl StrategyId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Identifier used for bootstrap defaults and explicit registrations:
    /// `<protection_type>/<name>` with `%` and `/` escaped in both parts, so
    /// distinct pairs never share an id.
    pub fn for_name(protection_type: &ProtectionType, name: &str) -> Self {
        Self(format!(
            "{}/{}",
            escape_id_part(protection_type.as_str()),
            escape_id_part(name)
        ))
    }

    /// Content-derived identifier: the same tactic with the same parameters for
    /// the same protection type always yields the same id.
    pub fn derived(
        protection_type: &ProtectionType,
        tactic: &str,
        params: &StrategyParams,
    ) -> Result<Self, ParamsError> {
        let encoded =
            serde_json::to_vec(params).map_err(|err| ParamsError::Unencodable(err.to_string()))?;
        let mut hasher = Sha256::new();
        for part in [protection_type.as_str().as_bytes(), tactic.as_bytes()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        hasher.update(&encoded);
        let digest = hex::encode(hasher.finalize());
        Ok(Self(format!("{}-{}", tactic, &digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape_id_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            other => escaped.push(other),
        }
    }
    escaped
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StrategyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Selection path that produced a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    RuleBased,
    Predictive,
}

impl SelectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionMethod::RuleBased => "rule_based",
            SelectionMethod::Predictive => "predictive",
        }
    }
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a strategy entered the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyOrigin {
    Bootstrap,
    Discovered { tactic: String },
    Registered,
}

/// Validation failures for strategy parameters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParamsError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),
    #[error("invalid value for header '{0}'")]
    InvalidHeaderValue(String),
    #[error("invalid proxy endpoint '{endpoint}': {reason}")]
    InvalidProxy { endpoint: String, reason: String },
    #[error("viewport {width}x{height} is not drawable")]
    InvalidViewport { width: u32, height: u32 },
    #[error("geolocation ({latitude}, {longitude}) is out of range")]
    InvalidGeolocation { latitude: f64, longitude: f64 },
    #[error("delay range {0}..{1}ms is inverted")]
    InvalidDelayRange(u64, u64),
    #[error("params cannot be encoded: {0}")]
    Unencodable(String),
}

fn validate_headers(headers: &BTreeMap<String, String>) -> Result<(), ParamsError> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ParamsError::InvalidHeaderName(name.clone()))?;
        HeaderValue::from_str(value).map_err(|_| ParamsError::InvalidHeaderValue(name.clone()))?;
    }
    Ok(())
}

fn validate_user_agent(user_agent: &str) -> Result<(), ParamsError> {
    if user_agent.trim().is_empty() {
        return Err(ParamsError::Empty("user_agent"));
    }
    HeaderValue::from_str(user_agent)
        .map(|_| ())
        .map_err(|_| ParamsError::InvalidHeaderValue("User-Agent".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn validate(&self) -> Result<(), ParamsError> {
        if self.width == 0 || self.height == 0 {
            return Err(ParamsError::InvalidViewport {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl Geolocation {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    fn validate(&self) -> Result<(), ParamsError> {
        let lat_ok = (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = (-180.0..=180.0).contains(&self.longitude);
        if !lat_ok || !lon_ok {
            return Err(ParamsError::InvalidGeolocation {
                latitude: self.latitude,
                longitude: self.longitude,
            });
        }
        Ok(())
    }
}

/// Page lifecycle event a browser render waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    Load,
    DomContentLoaded,
    NetworkIdle,
}

/// Simulated user interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    Scroll,
    Click,
}

/// Plain HTTP request with a spoofed user-agent and extra headers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderTweakParams {
    pub user_agent: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub referer: Option<String>,
}

impl HeaderTweakParams {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            headers: BTreeMap::new(),
            referer: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        validate_user_agent(&self.user_agent)?;
        validate_headers(&self.headers)?;
        if let Some(referer) = &self.referer {
            HeaderValue::from_str(referer)
                .map_err(|_| ParamsError::InvalidHeaderValue("Referer".into()))?;
        }
        Ok(())
    }
}

/// HTTP request routed through an upstream proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyParams {
    pub endpoint: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProxyParams {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        let parsed = Url::parse(&self.endpoint).map_err(|err| ParamsError::InvalidProxy {
            endpoint: self.endpoint.clone(),
            reason: err.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(ParamsError::InvalidProxy {
                endpoint: self.endpoint.clone(),
                reason: "missing host".into(),
            });
        }
        if let Some(user_agent) = &self.user_agent {
            validate_user_agent(user_agent)?;
        }
        validate_headers(&self.headers)
    }
}

/// Headless browser render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserRenderParams {
    pub wait_until: WaitCondition,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub geolocation: Option<Geolocation>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl BrowserRenderParams {
    pub fn new(wait_until: WaitCondition) -> Self {
        Self {
            wait_until,
            viewport: None,
            geolocation: None,
            locale: None,
            user_agent: None,
        }
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }

    pub fn with_geolocation(mut self, geolocation: Geolocation, locale: impl Into<String>) -> Self {
        self.geolocation = Some(geolocation);
        self.locale = Some(locale.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        if let Some(viewport) = &self.viewport {
            viewport.validate()?;
        }
        if let Some(geolocation) = &self.geolocation {
            geolocation.validate()?;
        }
        if let Some(locale) = &self.locale {
            if locale.trim().is_empty() {
                return Err(ParamsError::Empty("locale"));
            }
        }
        if let Some(user_agent) = &self.user_agent {
            validate_user_agent(user_agent)?;
        }
        Ok(())
    }
}

/// Browser session that simulates scrolling and clicking between delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveParams {
    pub viewport: Viewport,
    pub interactions: Vec<Interaction>,
    pub delay_range_ms: (u64, u64),
}

impl InteractiveParams {
    pub fn new(viewport: Viewport, interactions: Vec<Interaction>) -> Self {
        Self {
            viewport,
            interactions,
            delay_range_ms: (1_000, 3_000),
        }
    }

    pub fn with_delay_range_ms(mut self, min: u64, max: u64) -> Self {
        self.delay_range_ms = (min, max);
        self
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        self.viewport.validate()?;
        if self.interactions.is_empty() {
            return Err(ParamsError::Empty("interactions"));
        }
        let (min, max) = self.delay_range_ms;
        if min > max {
            return Err(ParamsError::InvalidDelayRange(min, max));
        }
        Ok(())
    }
}

/// Execution method a strategy needs from the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMethod {
    HeaderTweak,
    Proxy,
    BrowserRender,
    Interactive,
}

impl ExecutionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMethod::HeaderTweak => "header_tweak",
            ExecutionMethod::Proxy => "proxy",
            ExecutionMethod::BrowserRender => "browser_render",
            ExecutionMethod::Interactive => "interactive",
        }
    }
}

/// Strategy parameters, one variant per execution method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum StrategyParams {
    HeaderTweak(HeaderTweakParams),
    Proxy(ProxyParams),
    BrowserRender(BrowserRenderParams),
    Interactive(InteractiveParams),
}

impl StrategyParams {
    pub fn method(&self) -> ExecutionMethod {
        match self {
            StrategyParams::HeaderTweak(_) => ExecutionMethod::HeaderTweak,
            StrategyParams::Proxy(_) => ExecutionMethod::Proxy,
            StrategyParams::BrowserRender(_) => ExecutionMethod::BrowserRender,
            StrategyParams::Interactive(_) => ExecutionMethod::Interactive,
        }
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        match self {
            StrategyParams::HeaderTweak(params) => params.validate(),
            StrategyParams::Proxy(params) => params.validate(),
            StrategyParams::BrowserRender(params) => params.validate(),
            StrategyParams::Interactive(params) => params.validate(),
        }
    }
}

impl From<HeaderTweakParams> for StrategyParams {
    fn from(value: HeaderTweakParams) -> Self {
        StrategyParams::HeaderTweak(value)
    }
}

impl From<ProxyParams> for StrategyParams {
    fn from(value: ProxyParams) -> Self {
        StrategyParams::Proxy(value)
    }
}

impl From<BrowserRenderParams> for StrategyParams {
    fn from(value: BrowserRenderParams) -> Self {
        StrategyParams::BrowserRender(value)
    }
}

impl From<InteractiveParams> for StrategyParams {
    fn from(value: InteractiveParams) -> Self {
        StrategyParams::Interactive(value)
    }
}

/// A named, parameterised bypass technique for one protection type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub protection_type: ProtectionType,
    pub name: String,
    pub params: StrategyParams,
    pub origin: StrategyOrigin,
    pub created_at: DateTime<Utc>,
}

impl Strategy {
    /// Build a strategy, rejecting invalid parameters.
    pub fn new(
        id: StrategyId,
        protection_type: ProtectionType,
        name: impl Into<String>,
        params: StrategyParams,
        origin: StrategyOrigin,
    ) -> Result<Self, ParamsError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ParamsError::Empty("name"));
        }
        if id.as_str().is_empty() {
            return Err(ParamsError::Empty("id"));
        }
        if protection_type.as_str().is_empty() {
            return Err(ParamsError::Empty("protection_type"));
        }
        params.validate()?;
        Ok(Self {
            id,
            protection_type,
            name,
            params,
            origin,
            created_at: Utc::now(),
        })
    }

    /// Explicitly registered strategy with a name-derived id.
    pub fn registered(
        protection_type: impl Into<ProtectionType>,
        name: impl Into<String>,
        params: impl Into<StrategyParams>,
    ) -> Result<Self, ParamsError> {
        let protection_type = protection_type.into();
        let name = name.into();
        let id = StrategyId::for_name(&protection_type, &name);
        Self::new(id, protection_type, name, params.into(), StrategyOrigin::Registered)
    }
}

/// Running aggregate statistics for one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub strategy_id: StrategyId,
    pub success_count: u64,
    pub fail_count: u64,
    pub total_success_duration: Duration,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl StrategyStats {
    pub fn empty(strategy_id: StrategyId) -> Self {
        Self {
            strategy_id,
            success_count: 0,
            fail_count: 0,
            total_success_duration: Duration::ZERO,
            last_used_at: None,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.success_count.saturating_add(self.fail_count)
    }

    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.attempts();
        (attempts > 0).then(|| self.success_count as f64 / attempts as f64)
    }

    /// Mean duration of successful attempts; failed attempts never contribute.
    pub fn avg_duration(&self) -> Option<Duration> {
        if self.success_count == 0 {
            return None;
        }
        let nanos = self.total_success_duration.as_nanos() / u128::from(self.success_count);
        Some(Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64))
    }

    /// Fold one outcome into the aggregates.
    pub fn apply(&mut self, success: bool, duration: Duration, at: DateTime<Utc>) {
        if success {
            self.success_count = self.success_count.saturating_add(1);
            self.total_success_duration = self.total_success_duration.saturating_add(duration);
        } else {
            self.fail_count = self.fail_count.saturating_add(1);
        }
        self.last_used_at = Some(match self.last_used_at {
            Some(previous) if previous > at => previous,
            _ => at,
        });
    }
}

/// Number of non-empty path segments in a URL.
pub fn path_depth(url: &Url) -> u32 {
    url.path_segments()
        .map(|segments| segments.filter(|segment| !segment.is_empty()).count() as u32)
        .unwrap_or(0)
}

/// Request-context signals folded into outcome records and fed to prediction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFeatures {
    pub protection_type: ProtectionType,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub has_captcha: bool,
    #[serde(default)]
    pub title_keywords: Vec<String>,
    #[serde(default)]
    pub ip_region: Option<String>,
    #[serde(default)]
    pub url_depth: u32,
    #[serde(default)]
    pub hour_of_day: Option<u32>,
}

impl ContextFeatures {
    pub fn new(protection_type: impl Into<ProtectionType>) -> Self {
        Self {
            protection_type: protection_type.into(),
            user_agent: None,
            has_captcha: false,
            title_keywords: Vec::new(),
            ip_region: None,
            url_depth: 0,
            hour_of_day: None,
        }
    }

    pub fn for_url(protection_type: impl Into<ProtectionType>, url: &Url) -> Self {
        let mut features = Self::new(protection_type);
        features.url_depth = path_depth(url);
        features
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_captcha(mut self, has_captcha: bool) -> Self {
        self.has_captcha = has_captcha;
        self
    }

    pub fn with_title_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.title_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ip_region(mut self, region: impl Into<String>) -> Self {
        self.ip_region = Some(region.into());
        self
    }

    pub fn with_hour_of_day(mut self, hour: u32) -> Self {
        self.hour_of_day = Some(hour % 24);
        self
    }

    pub fn observed_at(self, at: DateTime<Utc>) -> Self {
        self.with_hour_of_day(at.hour())
    }
}

/// Ephemeral input to a selection call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionContext {
    pub url: Url,
    pub protection_type: ProtectionType,
    pub features: ContextFeatures,
}

impl SelectionContext {
    pub fn new(url: Url, protection_type: impl Into<ProtectionType>) -> Self {
        let protection_type = protection_type.into();
        let features =
            ContextFeatures::for_url(protection_type.clone(), &url).observed_at(Utc::now());
        Self {
            url,
            protection_type,
            features,
        }
    }

    pub fn parse(
        url: &str,
        protection_type: impl Into<ProtectionType>,
    ) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?, protection_type))
    }

    /// Replace the feature set; the protection type is kept in sync.
    pub fn with_features(mut self, mut features: ContextFeatures) -> Self {
        features.protection_type = self.protection_type.clone();
        self.features = features;
        self
    }
}
