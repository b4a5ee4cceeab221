//! Composite score and ranking.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::{require_positive, ConfigError, WEIGHT_TOLERANCE};
use crate::domain::InstrumentId;

use super::metrics::TickMetrics;

/// Sub-score weights. Must sum to 1.0 within [`WEIGHT_TOLERANCE`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerWeights {
    pub amplitude: f64,
    pub volatility: f64,
    pub volume: f64,
    pub flow: f64,
}

impl Default for RefinerWeights {
    fn default() -> Self {
        Self {
            amplitude: 0.25,
            volatility: 0.25,
            volume: 0.30,
            flow: 0.20,
        }
    }
}

impl RefinerWeights {
    pub fn sum(&self) -> f64 {
        self.amplitude + self.volatility + self.volume + self.flow
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, w) in [
            ("refiner.weights.amplitude", self.amplitude),
            ("refiner.weights.volatility", self.volatility),
            ("refiner.weights.volume", self.volume),
            ("refiner.weights.flow", self.flow),
        ] {
            if !(w.is_finite() && w >= 0.0) {
                return Err(ConfigError::Negative { field, value: w });
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightsDoNotSumToOne {
                sum,
                tolerance: WEIGHT_TOLERANCE,
            });
        }
        Ok(())
    }
}

/// Value at which each sub-score saturates at 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubScoreCeilings {
    pub amplitude: f64,
    pub volatility: f64,
    pub volume: f64,
    pub flow: f64,
}

impl Default for SubScoreCeilings {
    fn default() -> Self {
        Self {
            amplitude: 0.08,
            volatility: 3.0,
            volume: 5.0,
            flow: 0.002,
        }
    }
}

impl SubScoreCeilings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("refiner.ceilings.amplitude", self.amplitude)?;
        require_positive("refiner.ceilings.volatility", self.volatility)?;
        require_positive("refiner.ceilings.volume", self.volume)?;
        require_positive("refiner.ceilings.flow", self.flow)
    }
}

/// Normalized sub-scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub amplitude: f64,
    pub volatility: f64,
    pub volume: f64,
    pub flow: f64,
}

fn normalize(value: f64, ceiling: f64) -> f64 {
    if value.is_finite() {
        (value / ceiling).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl SubScores {
    pub fn from_metrics(metrics: &TickMetrics, ceilings: &SubScoreCeilings) -> Self {
        Self {
            amplitude: normalize(metrics.amplitude_ratio, ceilings.amplitude),
            volatility: normalize(metrics.volatility_ratio, ceilings.volatility),
            volume: normalize(metrics.volume_ratio, ceilings.volume),
            flow: normalize(metrics.flow_to_market_cap.unwrap_or(0.0), ceilings.flow),
        }
    }

    pub fn weighted(&self, w: &RefinerWeights) -> f64 {
        self.amplitude * w.amplitude
            + self.volatility * w.volatility
            + self.volume * w.volume
            + self.flow * w.flow
    }
}

/// Composite score with its breakdown. `rank` is 1-based and assigned only
/// after the full list is sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub instrument: InstrumentId,
    pub score: f64,
    pub sub_scores: SubScores,
    pub rank: usize,
    pub metrics: TickMetrics,
}

/// Score every metric set, stable-sort descending (ties by id), assign ranks.
pub fn rank(
    metrics: Vec<TickMetrics>,
    weights: &RefinerWeights,
    ceilings: &SubScoreCeilings,
) -> Vec<CompositeScore> {
    let mut scored: Vec<CompositeScore> = metrics
        .into_iter()
        .map(|m| {
            let sub_scores = SubScores::from_metrics(&m, ceilings);
            CompositeScore {
                instrument: m.instrument.clone(),
                score: sub_scores.weighted(weights),
                sub_scores,
                rank: 0,
                metrics: m,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn metrics(id: &str, amplitude: f64, volume: f64) -> TickMetrics {
        TickMetrics {
            instrument: id.into(),
            reference_close: 10.0,
            open: 10.0,
            high: 10.0,
            low: 10.0,
            last: 10.0,
            tick_count: 1,
            cumulative_volume: 100,
            cumulative_notional: 1.0,
            amplitude_ratio: amplitude,
            volatility_ratio: 1.0,
            volume_ratio: volume,
            flow_buckets: Vec::new(),
            net_flow: 0.0,
            flow_to_market_cap: None,
            synthetic: false,
        }
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!(RefinerWeights::default().validate().is_ok());
    }

    #[test]
    fn off_by_more_than_tolerance_fails() {
        let w = RefinerWeights {
            flow: 0.21,
            ..RefinerWeights::default()
        };
        assert!(matches!(
            w.validate(),
            Err(ConfigError::WeightsDoNotSumToOne { .. })
        ));
    }

    #[test]
    fn sub_scores_are_capped() {
        let m = metrics("a", 10.0, -3.0);
        let s = SubScores::from_metrics(&m, &SubScoreCeilings::default());
        assert_eq!(s.amplitude, 1.0);
        assert_eq!(s.volume, 0.0);
        assert_eq!(s.flow, 0.0);
    }

    #[test]
    fn ranks_are_dense_and_ties_go_to_lower_id() {
        let ranked = rank(
            vec![metrics("b", 0.04, 2.0), metrics("a", 0.04, 2.0), metrics("c", 0.08, 5.0)],
            &RefinerWeights::default(),
            &SubScoreCeilings::default(),
        );
        let order: Vec<(&str, usize)> = ranked
            .iter()
            .map(|s| (s.instrument.as_str(), s.rank))
            .collect();
        assert_eq!(order, vec![("c", 1), ("a", 2), ("b", 3)]);
    }

    proptest! {
        #[test]
        fn weights_validate_iff_sum_is_one(
            a in 0.0f64..1.0, b in 0.0f64..1.0, c in 0.0f64..1.0, d in 0.0f64..1.0,
        ) {
            let w = RefinerWeights { amplitude: a, volatility: b, volume: c, flow: d };
            let ok = (w.sum() - 1.0).abs() <= WEIGHT_TOLERANCE;
            prop_assert_eq!(w.validate().is_ok(), ok);
        }

        #[test]
        fn ranking_is_deterministic_under_input_order(
            values in prop::collection::vec((0.0f64..0.1, 0.0f64..6.0), 1..40),
            rotate in 0usize..40,
        ) {
            let items: Vec<TickMetrics> = values
                .iter()
                .enumerate()
                .map(|(i, (amp, vol))| metrics(&format!("{i:06}"), *amp, *vol))
                .collect();
            let mut rotated = items.clone();
            let k = rotate % rotated.len();
            rotated.rotate_left(k);

            let w = RefinerWeights::default();
            let c = SubScoreCeilings::default();
            let a: Vec<InstrumentId> = rank(items, &w, &c).into_iter().map(|s| s.instrument).collect();
            let b: Vec<InstrumentId> = rank(rotated, &w, &c).into_iter().map(|s| s.instrument).collect();
            prop_assert_eq!(a, b);
        }
    }
}
