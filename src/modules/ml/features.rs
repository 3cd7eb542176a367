//! Feature encoding for strategy prediction.
//!
//! Turns [`ContextFeatures`] into a fixed-width numeric vector. Categorical
//! signals go through per-feature encoders with a bounded number of one-hot
//! buckets; bucket 0 is reserved for values the encoder has never seen (or
//! cannot fit), so prediction never fails on a new value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::strategies::core::ContextFeatures;

/// Bucket every unseen or overflowing categorical value maps to.
pub const UNKNOWN_BUCKET: usize = 0;

/// Title keywords tracked as individual bits.
pub const TITLE_KEYWORDS: &[&str] = &[
    "just a moment",
    "attention required",
    "cloudflare",
    "captcha",
    "access denied",
    "forbidden",
    "security check",
    "ddos",
    "verify",
    "blocked",
];

const CATEGORICAL_FEATURES: [&str; 4] =
    ["protection_type", "user_agent", "ip_region", "time_of_day"];

/// Layout description stored with every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub categorical: Vec<String>,
    pub categorical_buckets: usize,
    pub keywords: Vec<String>,
    pub max_url_depth: u32,
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self {
            version: 1,
            categorical: CATEGORICAL_FEATURES.iter().map(|name| name.to_string()).collect(),
            categorical_buckets: 16,
            keywords: TITLE_KEYWORDS.iter().map(|kw| kw.to_string()).collect(),
            max_url_depth: 10,
        }
    }
}

impl FeatureSchema {
    /// One-hot blocks, captcha flag, keyword bits, depth, bias.
    pub fn width(&self) -> usize {
        self.categorical.len() * self.categorical_buckets + 1 + self.keywords.len() + 1 + 1
    }
}

/// Coarse user-agent family.
pub fn user_agent_bucket(user_agent: Option<&str>) -> &'static str {
    let Some(raw) = user_agent.map(str::trim).filter(|ua| !ua.is_empty()) else {
        return "none";
    };
    let ua = raw.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| ua.contains(needle));

    if has(&["bot", "crawler", "spider", "curl", "wget", "python", "headless"]) {
        "bot"
    } else if has(&["mobile", "android", "iphone", "ipad"]) {
        "mobile"
    } else if ua.contains("edg/") {
        "edge"
    } else if ua.contains("firefox") {
        "firefox"
    } else if has(&["chrome", "crios", "chromium"]) {
        "chrome"
    } else if ua.contains("safari") {
        "safari"
    } else {
        "other"
    }
}

pub fn time_of_day_bucket(hour: Option<u32>) -> &'static str {
    match hour {
        Some(0..=5) => "night",
        Some(6..=11) => "morning",
        Some(12..=17) => "afternoon",
        Some(18..=23) => "evening",
        _ => "unknown",
    }
}

/// Label encoder with a fixed bucket budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    buckets: usize,
    classes: Vec<String>,
}

impl CategoryEncoder {
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets: buckets.max(1),
            classes: Vec::new(),
        }
    }

    /// Bucket for a known value, [`UNKNOWN_BUCKET`] otherwise.
    pub fn index(&self, value: &str) -> usize {
        self.classes
            .iter()
            .position(|class| class == value)
            .map(|pos| pos + 1)
            .unwrap_or(UNKNOWN_BUCKET)
    }

    /// Bucket for the value, learning it if there is room left.
    pub fn fit(&mut self, value: &str) -> usize {
        let known = self.index(value);
        if known != UNKNOWN_BUCKET {
            return known;
        }
        if self.classes.len() + 1 < self.buckets {
            self.classes.push(value.to_string());
            self.classes.len()
        } else {
            UNKNOWN_BUCKET
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Schema plus the fitted categorical encoders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEncoder {
    schema: FeatureSchema,
    encoders: BTreeMap<String, CategoryEncoder>,
}

impl FeatureEncoder {
    pub fn new(schema: FeatureSchema) -> Self {
        Self {
            schema,
            encoders: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn encoder(&self, feature: &str) -> Option<&CategoryEncoder> {
        self.encoders.get(feature)
    }

    /// Encode without learning new categories.
    pub fn transform(&self, features: &ContextFeatures) -> Vec<f64> {
        let buckets: Vec<usize> = self
            .schema
            .categorical
            .iter()
            .map(|name| match categorical_value(name, features) {
                Some(value) => self
                    .encoders
                    .get(name)
                    .map(|encoder| encoder.index(&value))
                    .unwrap_or(UNKNOWN_BUCKET),
                None => UNKNOWN_BUCKET,
            })
            .collect();
        self.assemble(&buckets, features)
    }

    /// Encode while learning categories seen for the first time.
    pub fn fit_transform(&mut self, features: &ContextFeatures) -> Vec<f64> {
        let capacity = self.schema.categorical_buckets;
        let mut buckets = Vec::with_capacity(self.schema.categorical.len());
        for name in &self.schema.categorical {
            let bucket = match categorical_value(name, features) {
                Some(value) => self
                    .encoders
                    .entry(name.clone())
                    .or_insert_with(|| CategoryEncoder::new(capacity))
                    .fit(&value),
                None => UNKNOWN_BUCKET,
            };
            buckets.push(bucket);
        }
        self.assemble(&buckets, features)
    }

    fn assemble(&self, buckets: &[usize], features: &ContextFeatures) -> Vec<f64> {
        let schema = &self.schema;
        let block = schema.categorical_buckets;
        let mut vector = vec![0.0; schema.width()];

        for (slot, bucket) in buckets.iter().enumerate() {
            vector[slot * block + (*bucket).min(block - 1)] = 1.0;
        }

        let mut offset = schema.categorical.len() * block;
        vector[offset] = if features.has_captcha { 1.0 } else { 0.0 };
        offset += 1;

        for (index, keyword) in schema.keywords.iter().enumerate() {
            let hit = features
                .title_keywords
                .iter()
                .any(|candidate| candidate.to_lowercase().contains(keyword.as_str()));
            if hit {
                vector[offset + index] = 1.0;
            }
        }
        offset += schema.keywords.len();

        let max_depth = schema.max_url_depth.max(1);
        vector[offset] = f64::from(features.url_depth.min(max_depth)) / f64::from(max_depth);
        vector[offset + 1] = 1.0;
        vector
    }
}

fn categorical_value(feature: &str, features: &ContextFeatures) -> Option<String> {
    match feature {
        "protection_type" => Some(features.protection_type.as_str().to_string()),
        "user_agent" => Some(user_agent_bucket(features.user_agent.as_deref()).to_string()),
        "ip_region" => features
            .ip_region
            .as_deref()
            .map(|region| region.trim().to_ascii_lowercase())
            .filter(|region| !region.is_empty()),
        "time_of_day" => Some(time_of_day_bucket(features.hour_of_day).to_string()),
        _ => None,
    }
}
