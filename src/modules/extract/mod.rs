//! Context feature extraction from fetched pages.
//!
//! Derives the signals prediction and outcome records need (captcha markers,
//! title keywords, region, URL depth) from an executor report, plus a coarse
//! regex classifier for the protection a page shows.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use url::Url;

use crate::modules::ml::features::TITLE_KEYWORDS;
use crate::strategies::core::{ContextFeatures, ExecutionReport, ProtectionType, path_depth};

/// Metadata keys an executor may set to report the egress region.
pub const REGION_METADATA_KEYS: &[&str] = &["ip_region", "region"];

static CAPTCHA_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"captcha|recaptcha|g-recaptcha|h-captcha|cf-turnstile")
        .case_insensitive(true)
        .build()
        .expect("invalid captcha regex")
});

static CLOUDFLARE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"cloudflare|cf-browser-verification|cf-chl-")
        .case_insensitive(true)
        .build()
        .expect("invalid cloudflare regex")
});

static ACCESS_DENIED_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"403 Forbidden|Access Denied")
        .case_insensitive(true)
        .build()
        .expect("invalid access denied regex")
});

static JS_CHALLENGE_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"javascript challenge|js challenge")
        .case_insensitive(true)
        .build()
        .expect("invalid js challenge regex")
});

static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("invalid title selector"));

/// Coarse protection classifier. Checks run in priority order; `None` means
/// no known protection marker was found.
pub fn detect_protection(html: &str) -> Option<ProtectionType> {
    let label = if CAPTCHA_RE.is_match(html) {
        "captcha"
    } else if CLOUDFLARE_RE.is_match(html) {
        "cloudflare"
    } else if ACCESS_DENIED_RE.is_match(html) {
        "access_denied"
    } else if JS_CHALLENGE_RE.is_match(html) {
        "js_challenge"
    } else {
        return None;
    };
    log::debug!("detected protection {}", label);
    Some(ProtectionType::new(label))
}

/// Page `<title>` text, whitespace-collapsed.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let title = document.select(&TITLE_SELECTOR).next()?;
    let text = title.text().collect::<Vec<_>>().join(" ");
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Contract for turning an execution report into context features.
pub trait FeatureExtractor: Send + Sync {
    /// Refine `base` (usually the selection context's features) with what the
    /// report shows.
    fn extract(&self, url: &Url, report: &ExecutionReport, base: ContextFeatures)
    -> ContextFeatures;
}

/// HTML-based extractor.
#[derive(Debug, Clone, Default)]
pub struct HtmlFeatureExtractor;

impl HtmlFeatureExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for HtmlFeatureExtractor {
    fn extract(
        &self,
        url: &Url,
        report: &ExecutionReport,
        mut base: ContextFeatures,
    ) -> ContextFeatures {
        base.url_depth = path_depth(url);
        base.has_captcha = CAPTCHA_RE.is_match(&report.content);

        if let Some(title) = page_title(&report.content) {
            let lowered = title.to_lowercase();
            base.title_keywords = TITLE_KEYWORDS
                .iter()
                .filter(|keyword| lowered.contains(*keyword))
                .map(|keyword| keyword.to_string())
                .collect();
        }

        if let Some(region) = REGION_METADATA_KEYS
            .iter()
            .find_map(|key| report.metadata.get(*key))
            .filter(|region| !region.trim().is_empty())
        {
            base.ip_region = Some(region.trim().to_string());
        }
        base
    }
}
