//! Consensus engine: fans out to every registered opinion source and folds
//! the surviving opinions into one calibrated decision.
//!
//! The fold is deterministic for a fixed input set: sources are visited in
//! registry order and no wall clock or randomness enters the weighted sum.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::ConsensusConfig;
use crate::domain::{Decision, Direction, Opinion};
use crate::sources::SourceRegistry;

use super::regime::{MarketRegime, RegimeWeights};

/// One source's surviving, weighted contribution to the vote.
struct WeightedOpinion {
    opinion: Opinion,
    weight: f64,
}

pub struct ConsensusEngine {
    registry: Arc<SourceRegistry>,
    config: ConsensusConfig,
    regime_weights: RegimeWeights,
    /// Widest stop distance the active limit profile permits.
    max_stop_pct: Decimal,
}

impl ConsensusEngine {
    pub fn new(
        registry: Arc<SourceRegistry>,
        config: ConsensusConfig,
        max_stop_pct: Decimal,
    ) -> Self {
        let regime_weights = RegimeWeights::new(config.regime_multipliers.clone());
        Self {
            registry,
            config,
            regime_weights,
            max_stop_pct,
        }
    }

    /// Fan out to every enabled source, wait up to the per-request timeout,
    /// and fold the survivors into a decision. Returns `None` when the vote
    /// is empty, all-neutral, or too close to call.
    pub async fn aggregate(
        &self,
        symbol: &str,
        reference_price: Decimal,
        regime: MarketRegime,
    ) -> Option<Decision> {
        let timeout = Duration::from_millis(self.config.fetch_timeout_ms);
        let handles = self.registry.handles();
        if handles.is_empty() {
            warn!("no opinion sources registered");
            return None;
        }

        // Each request is bounded individually; a slow or failing source is
        // excluded from this cycle's vote, never aborting the aggregation.
        let fetches = handles.iter().map(|h| h.fetch(symbol, timeout));
        let results = join_all(fetches).await;

        let regime_multiplier = self.regime_weights.multiplier(regime);
        let now = Utc::now();
        let mut survivors: Vec<WeightedOpinion> = Vec::with_capacity(handles.len());

        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(opinion) => {
                    // Staleness exclusion happens before voting, not after.
                    if opinion.is_stale(self.config.opinion_max_age_secs, now) {
                        debug!(
                            source = handle.id(),
                            %symbol,
                            observed_at = %opinion.observed_at,
                            "opinion excluded as stale"
                        );
                        continue;
                    }
                    let weight = handle.base_weight() * regime_multiplier;
                    if weight > 0.0 {
                        survivors.push(WeightedOpinion { opinion, weight });
                    }
                }
                Err(e) => {
                    debug!(source = handle.id(), %symbol, error = %e, "source excluded from vote");
                }
            }
        }

        if survivors.is_empty() {
            debug!(%symbol, "no surviving opinions");
            return None;
        }
        if survivors
            .iter()
            .all(|w| w.opinion.direction == Direction::Neutral)
        {
            debug!(%symbol, "all surviving opinions are neutral");
            return None;
        }

        self.fold(symbol, reference_price, &survivors)
    }

    /// Fold weighted opinions into a decision. Pure with respect to its
    /// inputs aside from the generated id/timestamp.
    fn fold(
        &self,
        symbol: &str,
        reference_price: Decimal,
        survivors: &[WeightedOpinion],
    ) -> Option<Decision> {
        let mut long_score = 0.0_f64;
        let mut short_score = 0.0_f64;
        let mut active_weight = 0.0_f64;
        let mut contributing = 0_usize;
        let mut directional_total = 0_usize;
        let mut long_voters = 0_usize;
        let mut short_voters = 0_usize;

        for weighted in survivors {
            let opinion = &weighted.opinion;
            let weight = weighted.weight;
            match opinion.direction {
                Direction::Long => {
                    long_score += weight * opinion.confidence;
                    active_weight += weight;
                    contributing += 1;
                    directional_total += 1;
                    long_voters += 1;
                }
                Direction::Short => {
                    short_score += weight * opinion.confidence;
                    active_weight += weight;
                    contributing += 1;
                    directional_total += 1;
                    short_voters += 1;
                }
                Direction::Neutral => {
                    // Strong-but-directionless opinions are split into
                    // half-weight votes on both sides instead of being
                    // silently dropped; weak neutrals are discarded.
                    if opinion.confidence >= self.config.neutral_split_floor {
                        long_score += 0.5 * weight * opinion.confidence;
                        short_score += 0.5 * weight * opinion.confidence;
                        active_weight += weight;
                        contributing += 1;
                    }
                }
            }
        }

        if contributing == 0 || active_weight <= 0.0 {
            return None;
        }

        let direction_score = long_score - short_score;
        if direction_score.abs() <= self.config.direction_epsilon {
            debug!(%symbol, direction_score, "vote too close to call");
            return None;
        }
        let direction = if direction_score > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };

        // Weighted average over the weights that actually voted: a missing
        // source renormalizes instead of mechanically deflating confidence.
        // A lone survivor still gets the same arithmetic but is flagged via
        // contributing_sources and held to the stricter single-source
        // minimum downstream.
        let mut confidence = (long_score + short_score) / active_weight;

        if let Some(bonus) = self.agreement_bonus(
            direction,
            directional_total,
            long_voters,
            short_voters,
        ) {
            confidence += bonus;
        }
        let confidence = confidence.clamp(0.0, 100.0);

        let (target_price, stop_price) = self.bracket_prices(reference_price, direction);

        let decision = Decision::new(
            symbol,
            direction,
            confidence,
            contributing,
            reference_price,
            target_price,
            stop_price,
        );
        info!(
            %symbol,
            direction = %decision.direction,
            confidence = decision.confidence,
            sources = decision.contributing_sources,
            "consensus decision"
        );
        Some(decision)
    }

    /// Bonus confidence when contributing directional sources agree above
    /// the configured fraction, scaled between the min and max bonus and
    /// capped so confidence never exceeds 100.
    fn agreement_bonus(
        &self,
        direction: Direction,
        directional_total: usize,
        long_voters: usize,
        short_voters: usize,
    ) -> Option<f64> {
        if directional_total == 0 {
            return None;
        }
        let agreeing = match direction {
            Direction::Long => long_voters,
            Direction::Short => short_voters,
            Direction::Neutral => return None,
        };
        let fraction = agreeing as f64 / directional_total as f64;
        if fraction < self.config.agreement_threshold {
            return None;
        }

        let span = 1.0 - self.config.agreement_threshold;
        let scale = if span <= f64::EPSILON {
            1.0
        } else {
            ((fraction - self.config.agreement_threshold) / span).clamp(0.0, 1.0)
        };
        let bonus = self.config.agreement_bonus_min
            + scale * (self.config.agreement_bonus_max - self.config.agreement_bonus_min);
        Some(bonus)
    }

    /// Target and stop prices around the reference entry. The stop distance
    /// is capped by the active limit profile.
    fn bracket_prices(&self, entry: Decimal, direction: Direction) -> (Decimal, Decimal) {
        let stop_pct = self.config.stop_pct.min(self.max_stop_pct);
        let target_delta = entry * self.config.target_pct;
        let stop_delta = entry * stop_pct;
        match direction {
            Direction::Short => (entry - target_delta, entry + stop_delta),
            _ => (entry + target_delta, entry - stop_delta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::sources::OpinionSource;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct FixedSource {
        id: String,
        weight: f64,
        reply: Result<(Direction, f64), SourceError>,
    }

    #[async_trait]
    impl OpinionSource for FixedSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn base_weight(&self) -> f64 {
            self.weight
        }

        async fn fetch(&self, symbol: &str) -> Result<Opinion, SourceError> {
            match &self.reply {
                Ok((direction, confidence)) => {
                    Ok(Opinion::new(self.id.clone(), symbol, *direction, *confidence))
                }
                Err(e) => Err(e.clone()),
            }
        }
    }

    fn source(id: &str, direction: Direction, confidence: f64) -> Arc<dyn OpinionSource> {
        Arc::new(FixedSource {
            id: id.to_string(),
            weight: 1.0,
            reply: Ok((direction, confidence)),
        })
    }

    fn failing_source(id: &str) -> Arc<dyn OpinionSource> {
        Arc::new(FixedSource {
            id: id.to_string(),
            weight: 1.0,
            reply: Err(SourceError::Transient("down".into())),
        })
    }

    fn engine(sources: Vec<Arc<dyn OpinionSource>>) -> ConsensusEngine {
        let registry = Arc::new(SourceRegistry::new(sources, 3));
        ConsensusEngine::new(registry, ConsensusConfig::default(), dec!(0.05))
    }

    #[tokio::test]
    async fn test_long_majority_with_neutral_split() {
        // LONG@80, LONG@70, NEUTRAL@90 (floor 55): the neutral splits into
        // half-weight votes on both sides and still counts as contributing.
        let engine = engine(vec![
            source("alpha", Direction::Long, 80.0),
            source("beta", Direction::Long, 70.0),
            source("gamma", Direction::Neutral, 90.0),
        ]);

        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .expect("decision expected");

        assert_eq!(decision.direction, Direction::Long);
        assert_eq!(decision.contributing_sources, 3);
        // Weighted average (80 + 70 + 90) / 3 = 80, plus full agreement
        // bonus (both directional voters agree) = 95.
        assert!((decision.confidence - 95.0).abs() < 1e-6);
        assert!(decision.verify_integrity());
    }

    #[tokio::test]
    async fn test_all_neutral_yields_no_decision() {
        let engine = engine(vec![
            source("alpha", Direction::Neutral, 95.0),
            source("beta", Direction::Neutral, 80.0),
        ]);
        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_failed_source_excluded_and_single_source_flagged() {
        // Two sources, one fails: confidence comes from the survivor alone,
        // renormalized, and the decision is flagged single-source.
        let engine = engine(vec![
            source("alpha", Direction::Long, 85.0),
            failing_source("beta"),
        ]);

        let decision = engine
            .aggregate("ETH/USD", dec!(3000), MarketRegime::Ranging)
            .await
            .expect("decision expected");

        assert_eq!(decision.contributing_sources, 1);
        assert!(decision.is_single_source());
        // Renormalized to the survivor's own confidence plus agreement bonus.
        assert!(decision.confidence >= 85.0);
    }

    #[tokio::test]
    async fn test_balanced_vote_is_no_decision() {
        let engine = engine(vec![
            source("alpha", Direction::Long, 70.0),
            source("beta", Direction::Short, 70.0),
        ]);
        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_confidence_always_bounded() {
        let engine = engine(vec![
            source("a", Direction::Long, 100.0),
            source("b", Direction::Long, 100.0),
            source("c", Direction::Long, 100.0),
        ]);
        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .unwrap();
        // Bonus would push past 100; the cap holds.
        assert_eq!(decision.confidence, 100.0);
    }

    #[tokio::test]
    async fn test_aggregation_is_deterministic() {
        let sources = || {
            vec![
                source("alpha", Direction::Long, 82.0),
                source("beta", Direction::Short, 64.0),
                source("gamma", Direction::Long, 71.0),
            ]
        };
        let first = engine(sources())
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .unwrap();
        let second = engine(sources())
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .unwrap();

        assert_eq!(first.direction, second.direction);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.contributing_sources, second.contributing_sources);
    }

    #[tokio::test]
    async fn test_regime_adjustment_reduces_weight_never_boosts() {
        let mut multipliers = HashMap::new();
        multipliers.insert("high_vol".to_string(), 0.5);
        let mut config = ConsensusConfig::default();
        config.regime_multipliers = multipliers;

        let registry = Arc::new(SourceRegistry::new(
            vec![
                source("alpha", Direction::Long, 80.0),
                source("beta", Direction::Short, 60.0),
            ],
            3,
        ));
        let engine = ConsensusEngine::new(registry, config, dec!(0.05));

        // Same multiplier applies to every source, so the weighted average
        // is unchanged; the decision is still produced.
        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::HighVol)
            .await
            .unwrap();
        assert_eq!(decision.direction, Direction::Long);
    }

    #[tokio::test]
    async fn test_weak_neutral_discarded() {
        // NEUTRAL@40 is below the 55 floor: dropped entirely, leaving two
        // contributors.
        let engine = engine(vec![
            source("alpha", Direction::Long, 75.0),
            source("beta", Direction::Long, 65.0),
            source("gamma", Direction::Neutral, 40.0),
        ]);
        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .unwrap();
        assert_eq!(decision.contributing_sources, 2);
    }

    #[tokio::test]
    async fn test_short_bracket_prices_invert() {
        let engine = engine(vec![
            source("alpha", Direction::Short, 90.0),
            source("beta", Direction::Short, 85.0),
        ]);
        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .unwrap();
        assert_eq!(decision.direction, Direction::Short);
        assert!(decision.target_price < decision.entry_price);
        assert!(decision.stop_price > decision.entry_price);
    }

    #[tokio::test]
    async fn test_stop_distance_capped_by_profile() {
        let registry = Arc::new(SourceRegistry::new(
            vec![source("alpha", Direction::Long, 90.0)],
            3,
        ));
        let mut config = ConsensusConfig::default();
        config.stop_pct = dec!(0.10);
        // Profile cap of 2% beats the configured 10% stop.
        let engine = ConsensusEngine::new(registry, config, dec!(0.02));

        let decision = engine
            .aggregate("BTC/USD", dec!(50000), MarketRegime::Ranging)
            .await
            .unwrap();
        assert_eq!(decision.stop_price, dec!(49000));
    }
}
