//! Arbitration between the predictive and rule-based paths.
//!
//! A seeded uniform draw routes each selection. When the predictive path
//! misses, the rule-based path answers directly; the miss never triggers a
//! second draw. Every choice carries the method that actually produced it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::modules::ml::{PredictionMiss, PredictiveSelector};
use crate::modules::outcome_log::OutcomeRecord;
use crate::strategies::core::{
    ContextFeatures, ProtectionType, SelectionMethod, Strategy, StrategyStats,
};
use crate::strategies::ranking::{Ranking, RankingScorer};
use crate::strategies::rules::RuleBasedSelector;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    /// Probability of trying the predictive path first.
    pub ml_weight: f64,
    /// Fixed seed for reproducible routing.
    pub seed: Option<u64>,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            ml_weight: 0.5,
            seed: None,
        }
    }
}

impl ArbitrationConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.ml_weight) || self.ml_weight.is_nan() {
            return Err(format!("ml_weight must be within [0, 1], got {}", self.ml_weight));
        }
        Ok(())
    }
}

/// Chosen strategy plus how it was chosen.
#[derive(Debug, Clone)]
pub struct Choice {
    pub strategy: Strategy,
    pub method: SelectionMethod,
    /// Set when the draw picked the predictive path but it missed.
    pub prediction_miss: Option<PredictionMiss>,
}

/// Per-method aggregate over the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodStatistics {
    pub count: u64,
    pub success_rate: f64,
    /// Mean over every record of the method, failed attempts included.
    pub avg_duration: Duration,
}

pub struct Arbitrator {
    config: ArbitrationConfig,
    rules: RuleBasedSelector,
    scorer: RankingScorer,
    predictor: PredictiveSelector,
    rng: Mutex<StdRng>,
}

impl Arbitrator {
    pub fn new(
        config: ArbitrationConfig,
        rules: RuleBasedSelector,
        predictor: PredictiveSelector,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rules,
            scorer: RankingScorer::new(),
            predictor,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleBasedSelector {
        &self.rules
    }

    pub fn predictor(&self) -> &PredictiveSelector {
        &self.predictor
    }

    /// The routing coin: `u < ml_weight` selects the predictive path.
    pub fn draw(&self) -> SelectionMethod {
        let u: f64 = match self.rng.lock() {
            Ok(mut rng) => rng.r#gen::<f64>(),
            Err(poisoned) => poisoned.into_inner().r#gen::<f64>(),
        };
        if u < self.config.ml_weight {
            SelectionMethod::Predictive
        } else {
            SelectionMethod::RuleBased
        }
    }

    pub fn rank(&self, candidates: &[(Strategy, StrategyStats)]) -> Ranking {
        self.scorer.rank(candidates.iter().cloned())
    }

    /// Rule-based answer: the ranked leader once anything has succeeded,
    /// otherwise the first untried candidate in rule order.
    pub fn rule_based(
        &self,
        protection_type: &ProtectionType,
        candidates: &[(Strategy, StrategyStats)],
    ) -> Option<Strategy> {
        let ranking = self.rank(candidates);
        if let Some(top) = ranking.top().filter(|top| top.stats.success_count > 0) {
            return Some(top.strategy.clone());
        }
        if let Some(unseen) = self.rules.first_unseen(protection_type, candidates) {
            return Some(unseen.clone());
        }
        ranking
            .top()
            .map(|top| top.strategy.clone())
            .or_else(|| candidates.first().map(|(strategy, _)| strategy.clone()))
    }

    /// Draw a route and resolve it against the candidates.
    pub fn choose(
        &self,
        protection_type: &ProtectionType,
        features: &ContextFeatures,
        candidates: &[(Strategy, StrategyStats)],
    ) -> Option<Choice> {
        let route = self.draw();
        self.choose_with(route, protection_type, features, candidates)
    }

    /// Resolve an already drawn route.
    pub fn choose_with(
        &self,
        route: SelectionMethod,
        protection_type: &ProtectionType,
        features: &ContextFeatures,
        candidates: &[(Strategy, StrategyStats)],
    ) -> Option<Choice> {
        let mut prediction_miss = None;
        if route == SelectionMethod::Predictive {
            let strategies: Vec<Strategy> = candidates.iter().map(|(s, _)| s.clone()).collect();
            match self.predictor.select(features, &strategies) {
                Ok((strategy, _)) => {
                    return Some(Choice {
                        strategy: strategy.clone(),
                        method: SelectionMethod::Predictive,
                        prediction_miss: None,
                    });
                }
                Err(miss) => {
                    log::debug!("predictive path missed for {}: {}", protection_type, miss);
                    prediction_miss = Some(miss);
                }
            }
        }

        self.rule_based(protection_type, candidates).map(|strategy| Choice {
            strategy,
            method: SelectionMethod::RuleBased,
            prediction_miss,
        })
    }
}

impl std::fmt::Debug for Arbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbitrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Group outcome records by the method that selected them.
pub fn method_statistics(records: &[OutcomeRecord]) -> BTreeMap<SelectionMethod, MethodStatistics> {
    let mut buckets: BTreeMap<SelectionMethod, (u64, u64, Duration)> = BTreeMap::new();
    for record in records {
        let entry = buckets
            .entry(record.method)
            .or_insert((0, 0, Duration::ZERO));
        entry.0 += 1;
        if record.success {
            entry.1 += 1;
        }
        entry.2 = entry.2.saturating_add(record.duration);
    }

    buckets
        .into_iter()
        .map(|(method, (count, successes, total))| {
            let avg_nanos = total.as_nanos() / u128::from(count);
            let stats = MethodStatistics {
                count,
                success_rate: successes as f64 / count as f64,
                avg_duration: Duration::from_nanos(avg_nanos.min(u128::from(u64::MAX)) as u64),
            };
            (method, stats)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ml::{CheckpointSlot, FeatureSchema};
    use crate::strategies::core::HeaderTweakParams;
    use chrono::Utc;

    fn arbitrator(ml_weight: f64, seed: u64) -> Arbitrator {
        Arbitrator::new(
            ArbitrationConfig {
                ml_weight,
                seed: Some(seed),
            },
            RuleBasedSelector::standard(),
            PredictiveSelector::new(CheckpointSlot::new(), FeatureSchema::default()),
        )
    }

    fn candidates() -> Vec<(Strategy, StrategyStats)> {
        RuleBasedSelector::standard()
            .materialize(&"cloudflare".into())
            .unwrap()
            .into_iter()
            .map(|strategy| {
                let stats = StrategyStats::empty(strategy.id.clone());
                (strategy, stats)
            })
            .collect()
    }

    #[test]
    fn extreme_weights_are_deterministic() {
        let always = arbitrator(1.0, 7);
        let never = arbitrator(0.0, 7);
        for _ in 0..200 {
            assert_eq!(always.draw(), SelectionMethod::Predictive);
            assert_eq!(never.draw(), SelectionMethod::RuleBased);
        }
    }

    #[test]
    fn same_seed_same_routes() {
        let a = arbitrator(0.5, 42);
        let b = arbitrator(0.5, 42);
        let left: Vec<_> = (0..64).map(|_| a.draw()).collect();
        let right: Vec<_> = (0..64).map(|_| b.draw()).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn predictive_miss_falls_back_without_redraw() {
        let arbitrator = arbitrator(1.0, 1);
        let pool = candidates();
        let choice = arbitrator
            .choose(&"cloudflare".into(), &ContextFeatures::new("cloudflare"), &pool)
            .unwrap();
        assert_eq!(choice.method, SelectionMethod::RuleBased);
        assert_eq!(choice.prediction_miss, Some(PredictionMiss::NoCheckpoint));
        assert_eq!(choice.strategy.name, "browser_render");
    }

    #[test]
    fn rule_path_prefers_proven_strategy() {
        let arbitrator = arbitrator(0.0, 1);
        let mut pool = candidates();
        for (strategy, stats) in pool.iter_mut() {
            if strategy.name == "stealth_headers" {
                stats.apply(true, Duration::from_millis(400), Utc::now());
            }
            if strategy.name == "browser_render" {
                stats.apply(false, Duration::from_millis(900), Utc::now());
            }
        }
        let choice = arbitrator
            .choose(&"cloudflare".into(), &ContextFeatures::new("cloudflare"), &pool)
            .unwrap();
        assert_eq!(choice.strategy.name, "stealth_headers");
        assert!(choice.prediction_miss.is_none());
    }

    #[test]
    fn untried_candidate_beats_failed_leader() {
        let arbitrator = arbitrator(0.0, 1);
        let mut pool = candidates();
        pool[0].1.apply(false, Duration::from_millis(900), Utc::now());
        let choice = arbitrator
            .choose(&"cloudflare".into(), &ContextFeatures::new("cloudflare"), &pool)
            .unwrap();
        assert_eq!(choice.strategy.name, "browser_interactive");
    }

    #[test]
    fn empty_pool_has_no_choice() {
        let arbitrator = arbitrator(0.5, 3);
        assert!(arbitrator
            .choose(&"cloudflare".into(), &ContextFeatures::new("cloudflare"), &[])
            .is_none());
    }

    #[test]
    fn statistics_split_by_method() {
        let strategy =
            Strategy::registered("cloudflare", "h", HeaderTweakParams::new("UA")).unwrap();
        let record = |method, success, millis| {
            OutcomeRecord::new(
                &strategy,
                method,
                success,
                Duration::from_millis(millis),
                ContextFeatures::new("cloudflare"),
                "https://example.com/",
            )
        };
        let records = vec![
            record(SelectionMethod::RuleBased, true, 100),
            record(SelectionMethod::RuleBased, false, 300),
            record(SelectionMethod::Predictive, true, 50),
        ];
        let stats = method_statistics(&records);
        let rule = &stats[&SelectionMethod::RuleBased];
        assert_eq!(rule.count, 2);
        assert!((rule.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(rule.avg_duration, Duration::from_millis(200));
        assert_eq!(stats[&SelectionMethod::Predictive].count, 1);
    }
}
