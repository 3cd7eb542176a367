//! Exploration tactics and their bounded variant lists.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::strategies::core::{
    BrowserRenderParams, Geolocation, HeaderTweakParams, Interaction, InteractiveParams,
    ProxyParams, StrategyParams, Viewport, WaitCondition,
};

/// Discovery tactics in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tactic {
    UserAgentRotation,
    ProxyHeaderRotation,
    ViewportVariation,
    GeolocationEmulation,
    InteractionSimulation,
}

impl Tactic {
    pub const ORDERED: [Tactic; 5] = [
        Tactic::UserAgentRotation,
        Tactic::ProxyHeaderRotation,
        Tactic::ViewportVariation,
        Tactic::GeolocationEmulation,
        Tactic::InteractionSimulation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tactic::UserAgentRotation => "user_agent_rotation",
            Tactic::ProxyHeaderRotation => "proxy_header_rotation",
            Tactic::ViewportVariation => "viewport_variation",
            Tactic::GeolocationEmulation => "geolocation_emulation",
            Tactic::InteractionSimulation => "interaction_simulation",
        }
    }
}

impl fmt::Display for Tactic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geolocation variant with a label used in the strategy name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedGeolocation {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl NamedGeolocation {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }
}

pub fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
        "Mozilla/5.0 (Linux; Android 14; SM-S918B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Mobile Safari/537.36",
    ]
    .iter()
    .map(|ua| ua.to_string())
    .collect()
}

pub fn default_viewports() -> Vec<Viewport> {
    vec![
        Viewport::new(1920, 1080),
        Viewport::new(1366, 768),
        Viewport::new(1536, 864),
    ]
}

pub fn default_geolocations() -> Vec<NamedGeolocation> {
    vec![
        NamedGeolocation::new("new_york", 40.7128, -74.0060),
        NamedGeolocation::new("london", 51.5074, -0.1278),
        NamedGeolocation::new("tokyo", 35.6762, 139.6503),
    ]
}

/// Extra request headers layered on a proxy or direct route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderSet {
    Bare,
    Language,
    LanguageReferer,
}

impl HeaderSet {
    const ALL: [HeaderSet; 3] = [HeaderSet::Bare, HeaderSet::Language, HeaderSet::LanguageReferer];

    fn label(self) -> &'static str {
        match self {
            HeaderSet::Bare => "bare",
            HeaderSet::Language => "lang",
            HeaderSet::LanguageReferer => "lang_referer",
        }
    }

    fn headers(self, locale: &str) -> Vec<(&'static str, String)> {
        match self {
            HeaderSet::Bare => Vec::new(),
            HeaderSet::Language => vec![("Accept-Language", accept_language(locale))],
            HeaderSet::LanguageReferer => vec![
                ("Accept-Language", accept_language(locale)),
                ("Referer", "https://www.google.com/".to_string()),
            ],
        }
    }
}

/// `en-US` becomes `en-US,en;q=0.9`.
fn accept_language(locale: &str) -> String {
    match locale.split_once('-') {
        Some((primary, _)) if !primary.is_empty() => format!("{},{};q=0.9", locale, primary),
        _ => locale.to_string(),
    }
}

fn routed_params(
    proxy: Option<&String>,
    user_agent: &str,
    headers: Vec<(&'static str, String)>,
) -> StrategyParams {
    match proxy {
        Some(endpoint) => {
            let mut params = ProxyParams::new(endpoint.clone()).with_user_agent(user_agent);
            for (name, value) in headers {
                params = params.with_header(name, value);
            }
            params.into()
        }
        None => {
            let mut params = HeaderTweakParams::new(user_agent);
            for (name, value) in headers {
                params = params.with_header(name, value);
            }
            params.into()
        }
    }
}

/// One concrete probe of a tactic.
#[derive(Debug, Clone, PartialEq)]
pub struct TacticVariant {
    pub name: String,
    pub params: StrategyParams,
}

/// Variant pools for every tactic.
#[derive(Debug, Clone, PartialEq)]
pub struct TacticCatalog {
    pub user_agents: Vec<String>,
    pub proxies: Vec<String>,
    pub viewports: Vec<Viewport>,
    pub geolocations: Vec<NamedGeolocation>,
    pub locale: String,
}

impl Default for TacticCatalog {
    fn default() -> Self {
        Self {
            user_agents: default_user_agents(),
            proxies: Vec::new(),
            viewports: default_viewports(),
            geolocations: default_geolocations(),
            locale: "en-US".to_string(),
        }
    }
}

impl TacticCatalog {
    /// Variants of a tactic in probe order. An empty list means the tactic
    /// cannot run with the current pools.
    pub fn variants(&self, tactic: Tactic) -> Vec<TacticVariant> {
        match tactic {
            Tactic::UserAgentRotation => self
                .user_agents
                .iter()
                .enumerate()
                .map(|(index, ua)| TacticVariant {
                    name: format!("{}_{}", tactic, index + 1),
                    params: HeaderTweakParams::new(ua.clone()).into(),
                })
                .collect(),
            Tactic::ProxyHeaderRotation => {
                let routes = std::iter::once(None).chain(self.proxies.iter().map(Some));
                let mut variants = Vec::new();
                for (r, proxy) in routes.enumerate() {
                    let route = match proxy {
                        Some(_) => format!("proxy{}", r),
                        None => "direct".to_string(),
                    };
                    for set in HeaderSet::ALL {
                        // Direct with bare headers is user agent rotation again.
                        if proxy.is_none() && set == HeaderSet::Bare {
                            continue;
                        }
                        for (u, ua) in self.user_agents.iter().enumerate() {
                            let params = routed_params(proxy, ua, set.headers(&self.locale));
                            variants.push(TacticVariant {
                                name: format!("{}_{}_{}_{}", tactic, route, set.label(), u + 1),
                                params,
                            });
                        }
                    }
                }
                variants
            }
            Tactic::ViewportVariation => self
                .viewports
                .iter()
                .map(|viewport| TacticVariant {
                    name: format!("{}_{}", tactic, viewport),
                    params: BrowserRenderParams::new(WaitCondition::NetworkIdle)
                        .with_viewport(*viewport)
                        .into(),
                })
                .collect(),
            Tactic::GeolocationEmulation => self
                .geolocations
                .iter()
                .map(|geo| TacticVariant {
                    name: format!("{}_{}", tactic, geo.name),
                    params: BrowserRenderParams::new(WaitCondition::NetworkIdle)
                        .with_geolocation(
                            Geolocation::new(geo.latitude, geo.longitude),
                            self.locale.clone(),
                        )
                        .into(),
                })
                .collect(),
            Tactic::InteractionSimulation => self
                .viewports
                .iter()
                .map(|viewport| TacticVariant {
                    name: format!("{}_{}", tactic, viewport),
                    params: InteractiveParams::new(
                        *viewport,
                        vec![Interaction::Scroll, Interaction::Click],
                    )
                    .into(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::core::ExecutionMethod;

    #[test]
    fn default_catalog_shapes() {
        let catalog = TacticCatalog::default();
        assert_eq!(catalog.variants(Tactic::UserAgentRotation).len(), 4);
        let routed = catalog.variants(Tactic::ProxyHeaderRotation);
        assert_eq!(routed.len(), 8);
        assert!(
            routed
                .iter()
                .all(|variant| variant.params.method() == ExecutionMethod::HeaderTweak)
        );
        assert_eq!(routed[0].name, "proxy_header_rotation_direct_lang_1");
        match &routed[4].params {
            StrategyParams::HeaderTweak(params) => {
                assert_eq!(params.headers["Accept-Language"], "en-US,en;q=0.9");
                assert_eq!(params.headers["Referer"], "https://www.google.com/");
            }
            other => panic!("unexpected params {:?}", other),
        }
        let viewports = catalog.variants(Tactic::ViewportVariation);
        assert_eq!(viewports[1].name, "viewport_variation_1366x768");
        assert_eq!(viewports[1].params.method(), ExecutionMethod::BrowserRender);
        let geos = catalog.variants(Tactic::GeolocationEmulation);
        assert_eq!(geos[2].name, "geolocation_emulation_tokyo");
        assert_eq!(
            catalog.variants(Tactic::InteractionSimulation)[0].params.method(),
            ExecutionMethod::Interactive
        );
    }

    #[test]
    fn proxies_cross_user_agents() {
        let catalog = TacticCatalog {
            proxies: vec!["http://a.local:8080".into(), "http://b.local:8080".into()],
            ..TacticCatalog::default()
        };
        let variants = catalog.variants(Tactic::ProxyHeaderRotation);
        // Direct: two header sets. Each proxy: three header sets. Four agents each.
        assert_eq!(variants.len(), 8 + 2 * 12);
        assert_eq!(variants[8].name, "proxy_header_rotation_proxy1_bare_1");
        assert_eq!(variants[21].name, "proxy_header_rotation_proxy2_bare_2");
        match &variants[21].params {
            StrategyParams::Proxy(params) => {
                assert_eq!(params.endpoint, "http://b.local:8080");
                assert!(params.headers.is_empty());
            }
            other => panic!("unexpected params {:?}", other),
        }
        assert!(variants.iter().all(|v| v.params.validate().is_ok()));
    }
}
