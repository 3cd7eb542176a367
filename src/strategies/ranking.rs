//! Deterministic stats-based ranking.
//!
//! Order: success rate descending, mean successful duration ascending (no
//! successes sorts last), failure count ascending, id ascending. Rates are
//! compared as exact fractions so identical stats always give identical order.

use std::cmp::Ordering;

use crate::strategies::core::{Strategy, StrategyStats};

/// Strategy with the stats it was ranked on.
#[derive(Debug, Clone)]
pub struct RankedStrategy {
    pub strategy: Strategy,
    pub stats: StrategyStats,
}

/// Ranking result; `ranked` is exposed for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub ranked: Vec<RankedStrategy>,
}

impl Ranking {
    pub fn top(&self) -> Option<&RankedStrategy> {
        self.ranked.first()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.ranked.iter().map(|entry| entry.strategy.id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RankingScorer;

impl RankingScorer {
    pub fn new() -> Self {
        Self
    }

    /// Rank every strategy that has at least one recorded attempt.
    pub fn rank<I>(&self, candidates: I) -> Ranking
    where
        I: IntoIterator<Item = (Strategy, StrategyStats)>,
    {
        let mut ranked: Vec<RankedStrategy> = candidates
            .into_iter()
            .filter(|(_, stats)| stats.attempts() > 0)
            .map(|(strategy, stats)| RankedStrategy { strategy, stats })
            .collect();
        ranked.sort_by(compare);
        Ranking { ranked }
    }
}

fn compare(a: &RankedStrategy, b: &RankedStrategy) -> Ordering {
    compare_success_rate(&b.stats, &a.stats)
        .then_with(|| compare_avg_duration(&a.stats, &b.stats))
        .then_with(|| a.stats.fail_count.cmp(&b.stats.fail_count))
        .then_with(|| a.strategy.id.cmp(&b.strategy.id))
}

/// `a.success / a.attempts` vs `b.success / b.attempts` without floating point.
fn compare_success_rate(a: &StrategyStats, b: &StrategyStats) -> Ordering {
    let lhs = u128::from(a.success_count) * u128::from(b.attempts());
    let rhs = u128::from(b.success_count) * u128::from(a.attempts());
    lhs.cmp(&rhs)
}

fn compare_avg_duration(a: &StrategyStats, b: &StrategyStats) -> Ordering {
    match (a.avg_duration(), b.avg_duration()) {
        (Some(lhs), Some(rhs)) => lhs.cmp(&rhs),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
