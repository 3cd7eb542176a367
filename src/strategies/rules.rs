//! Rule-based selector.
//!
//! Static `protection_type -> ordered defaults` mapping with a generic
//! fallback list. Used to bootstrap the store and to pick the first untried
//! candidate while a protection type has no successful history yet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::strategies::core::{
    BrowserRenderParams, HeaderTweakParams, Interaction, InteractiveParams, ParamsError,
    ProtectionType, ProxyParams, Strategy, StrategyId, StrategyOrigin, StrategyParams,
    StrategyStats, Viewport, WaitCondition,
};

const DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Named default strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultStrategy {
    pub name: String,
    pub params: StrategyParams,
}

impl DefaultStrategy {
    pub fn new(name: impl Into<String>, params: impl Into<StrategyParams>) -> Self {
        Self {
            name: name.into(),
            params: params.into(),
        }
    }

    fn browser_render() -> Self {
        Self::new(
            "browser_render",
            BrowserRenderParams::new(WaitCondition::NetworkIdle),
        )
    }

    fn browser_interactive() -> Self {
        Self::new(
            "browser_interactive",
            InteractiveParams::new(
                Viewport::new(1920, 1080),
                vec![Interaction::Scroll, Interaction::Click],
            ),
        )
    }

    fn stealth_headers() -> Self {
        Self::new(
            "stealth_headers",
            HeaderTweakParams::new(DESKTOP_USER_AGENT)
                .with_header(
                    "Accept",
                    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
                )
                .with_header("Accept-Language", "en-US,en;q=0.5")
                .with_header("Upgrade-Insecure-Requests", "1")
                .with_header("Cache-Control", "max-age=0"),
        )
    }

    fn rotating_proxy(index: usize, endpoint: &str) -> Self {
        Self::new(
            format!("rotating_proxy_{}", index + 1),
            ProxyParams::new(endpoint).with_user_agent(DESKTOP_USER_AGENT),
        )
    }
}

/// Configuration overrides for the rule table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Replaces (or adds) the defaults for the listed protection types.
    pub overrides: BTreeMap<String, Vec<DefaultStrategy>>,
    /// Replaces the generic fallback list.
    pub fallback: Option<Vec<DefaultStrategy>>,
    /// Proxy endpoints turned into rotating-proxy defaults for `ip_block`.
    pub proxy_pool: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuleBasedSelector {
    rules: BTreeMap<ProtectionType, Vec<DefaultStrategy>>,
    fallback: Vec<DefaultStrategy>,
}

impl RuleBasedSelector {
    pub fn new(
        rules: BTreeMap<ProtectionType, Vec<DefaultStrategy>>,
        fallback: Vec<DefaultStrategy>,
    ) -> Result<Self, ParamsError> {
        for default in rules.values().flatten().chain(fallback.iter()) {
            if default.name.trim().is_empty() {
                return Err(ParamsError::Empty("name"));
            }
            default.params.validate()?;
        }
        Ok(Self { rules, fallback })
    }

    /// Built-in table.
    pub fn standard() -> Self {
        Self::with_proxy_pool(&[])
    }

    fn with_proxy_pool(proxies: &[String]) -> Self {
        let mut rules = BTreeMap::new();
        rules.insert(
            ProtectionType::new("cloudflare"),
            vec![
                DefaultStrategy::browser_render(),
                DefaultStrategy::browser_interactive(),
                DefaultStrategy::stealth_headers(),
            ],
        );
        rules.insert(
            ProtectionType::new("ddos_guard"),
            vec![
                DefaultStrategy::stealth_headers(),
                DefaultStrategy::browser_interactive(),
                DefaultStrategy::browser_render(),
            ],
        );
        for captcha in ["captcha", "recaptcha"] {
            rules.insert(
                ProtectionType::new(captcha),
                vec![
                    DefaultStrategy::browser_interactive(),
                    DefaultStrategy::browser_render(),
                ],
            );
        }

        let mut ip_block: Vec<DefaultStrategy> = proxies
            .iter()
            .enumerate()
            .map(|(index, endpoint)| DefaultStrategy::rotating_proxy(index, endpoint))
            .collect();
        ip_block.push(DefaultStrategy::stealth_headers());
        ip_block.push(DefaultStrategy::browser_render());
        rules.insert(ProtectionType::new("ip_block"), ip_block);

        Self {
            rules,
            fallback: vec![
                DefaultStrategy::browser_render(),
                DefaultStrategy::stealth_headers(),
            ],
        }
    }

    /// Built-in table with configuration overrides applied.
    pub fn from_config(config: &RulesConfig) -> Result<Self, ParamsError> {
        let base = Self::with_proxy_pool(&config.proxy_pool);
        let mut rules = base.rules;
        for (protection_type, defaults) in &config.overrides {
            rules.insert(ProtectionType::new(protection_type), defaults.clone());
        }
        let fallback = config.fallback.clone().unwrap_or(base.fallback);
        Self::new(rules, fallback)
    }

    pub fn with_rule(
        mut self,
        protection_type: impl Into<ProtectionType>,
        defaults: Vec<DefaultStrategy>,
    ) -> Self {
        self.rules.insert(protection_type.into(), defaults);
        self
    }

    /// Whether the protection type has its own rule (not just the fallback).
    pub fn has_specific(&self, protection_type: &ProtectionType) -> bool {
        self.rules
            .get(protection_type)
            .is_some_and(|defaults| !defaults.is_empty())
    }

    pub fn defaults_for(&self, protection_type: &ProtectionType) -> &[DefaultStrategy] {
        match self.rules.get(protection_type) {
            Some(defaults) if !defaults.is_empty() => defaults,
            _ => &self.fallback,
        }
    }

    pub fn protection_types(&self) -> impl Iterator<Item = &ProtectionType> {
        self.rules.keys()
    }

    /// Defaults for the protection type as bootstrap strategies.
    pub fn materialize(
        &self,
        protection_type: &ProtectionType,
    ) -> Result<Vec<Strategy>, ParamsError> {
        self.defaults_for(protection_type)
            .iter()
            .map(|default| {
                Strategy::new(
                    StrategyId::for_name(protection_type, &default.name),
                    protection_type.clone(),
                    default.name.clone(),
                    default.params.clone(),
                    StrategyOrigin::Bootstrap,
                )
            })
            .collect()
    }

    /// First candidate without recorded attempts: rule order first, then
    /// store order for anything the rules do not name.
    pub fn first_unseen<'a>(
        &self,
        protection_type: &ProtectionType,
        candidates: &'a [(Strategy, StrategyStats)],
    ) -> Option<&'a Strategy> {
        let untried = |(_, stats): &&(Strategy, StrategyStats)| stats.attempts() == 0;

        for default in self.defaults_for(protection_type) {
            let id = StrategyId::for_name(protection_type, &default.name);
            if let Some((strategy, _)) = candidates
                .iter()
                .filter(untried)
                .find(|(strategy, _)| strategy.id == id)
            {
                return Some(strategy);
            }
        }

        candidates
            .iter()
            .find(|entry| untried(entry))
            .map(|(strategy, _)| strategy)
    }
}

impl Default for RuleBasedSelector {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn known_and_unknown_types() {
        let selector = RuleBasedSelector::standard();
        let cf = ProtectionType::new("cloudflare");
        assert!(selector.has_specific(&cf));
        assert_eq!(selector.defaults_for(&cf)[0].name, "browser_render");

        let unknown = ProtectionType::new("mystery_shield");
        assert!(!selector.has_specific(&unknown));
        assert_eq!(selector.defaults_for(&unknown)[0].name, "browser_render");
        assert_eq!(selector.defaults_for(&unknown).len(), 2);
    }

    #[test]
    fn materialized_defaults_use_name_ids() {
        let selector = RuleBasedSelector::standard();
        let strategies = selector.materialize(&"ddos_guard".into()).unwrap();
        assert_eq!(strategies[0].id.as_str(), "ddos_guard/stealth_headers");
        assert!(strategies.iter().all(|s| s.origin == StrategyOrigin::Bootstrap));
    }

    #[test]
    fn proxy_pool_leads_ip_block_rules() {
        let config = RulesConfig {
            proxy_pool: vec!["http://10.0.0.1:3128".into()],
            ..RulesConfig::default()
        };
        let selector = RuleBasedSelector::from_config(&config).unwrap();
        let defaults = selector.defaults_for(&"ip_block".into());
        assert_eq!(defaults[0].name, "rotating_proxy_1");
    }

    #[test]
    fn invalid_override_is_rejected() {
        let mut config = RulesConfig::default();
        config.overrides.insert(
            "cloudflare".into(),
            vec![DefaultStrategy::new("broken", ProxyParams::new("::nope::"))],
        );
        assert!(RuleBasedSelector::from_config(&config).is_err());
    }

    #[test]
    fn first_unseen_follows_rule_order() {
        let selector = RuleBasedSelector::standard();
        let cf = ProtectionType::new("cloudflare");
        let mut candidates: Vec<(Strategy, StrategyStats)> = selector
            .materialize(&cf)
            .unwrap()
            .into_iter()
            .rev()
            .map(|strategy| {
                let stats = StrategyStats::empty(strategy.id.clone());
                (strategy, stats)
            })
            .collect();

        let first = selector.first_unseen(&cf, &candidates).unwrap();
        assert_eq!(first.name, "browser_render");

        for (strategy, stats) in candidates.iter_mut() {
            if strategy.name == "browser_render" {
                stats.apply(false, Duration::from_secs(1), Utc::now());
            }
        }
        let next = selector.first_unseen(&cf, &candidates).unwrap();
        assert_eq!(next.name, "browser_interactive");
    }
}
