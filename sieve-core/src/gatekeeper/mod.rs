//! Trade gatekeeper: the veto/approval layer between a signal and execution.
//!
//! Four rules run in a fixed order for every signal:
//!
//! 1. forbidden scenario (absolute veto)
//! 2. sector resonance (downgrade to watch)
//! 3. capital-flow reversal (absolute veto)
//! 4. decision tag (approve only in the sweet spot)
//!
//! The verdict honours the first absolute veto, but every rule still runs and
//! is recorded in the [`GatekeeperDecision`].

pub mod decision;
pub mod flow;
pub mod resonance;
pub mod rules;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{require_at_least, require_non_negative, require_positive, ConfigError};
use crate::domain::TradeSignal;

pub use decision::{combine, DecisionTag, GatekeeperDecision, RuleEvaluation, RuleOutcome, Verdict};
pub use flow::{FlowHistory, FlowObservation, FlowReversal, FlowThresholds};
pub use resonance::{PeerQuote, ResonanceCache, ResonanceSnapshot};
pub use rules::{
    CapitalFlowReversal, DecisionTagRule, ForbiddenScenario, GateContext, GateRule,
    SectorResonance,
};

/// Gatekeeper thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Sector peers needed at or above `leader_strength_pct`.
    pub min_leaders: usize,
    pub leader_strength_pct: f64,
    /// Fraction of sector peers advancing.
    pub min_breadth: f64,
    pub resonance_ttl_secs: u64,
    pub flow_ttl_secs: u64,
    /// Positive→negative swing that counts as a massive outflow.
    pub outflow_swing_floor: f64,
    /// Relative drop (while positive) that counts as a momentum collapse.
    pub collapse_fraction: f64,
    /// Magnitude of a negative reading that counts toward continuous outflow.
    pub continuous_outflow_floor: f64,
    pub inflow_min: f64,
    pub sweet_spot_low: f64,
    pub sweet_spot_high: f64,
    pub inflow_max: f64,
    /// Risk score at which cautionary labels veto.
    pub risk_ceiling: f64,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            min_leaders: 3,
            leader_strength_pct: 5.0,
            min_breadth: 0.35,
            resonance_ttl_secs: 300,
            flow_ttl_secs: 300,
            outflow_swing_floor: 100.0,
            collapse_fraction: 0.5,
            continuous_outflow_floor: 20.0,
            inflow_min: 0.05,
            sweet_spot_low: 0.10,
            sweet_spot_high: 0.35,
            inflow_max: 0.60,
            risk_ceiling: 0.6,
        }
    }
}

impl GatekeeperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_at_least("gatekeeper.min_leaders", self.min_leaders, 1)?;
        require_non_negative("gatekeeper.min_breadth", self.min_breadth)?;
        require_positive("gatekeeper.resonance_ttl_secs", self.resonance_ttl_secs as f64)?;
        require_positive("gatekeeper.flow_ttl_secs", self.flow_ttl_secs as f64)?;
        require_positive("gatekeeper.outflow_swing_floor", self.outflow_swing_floor)?;
        require_non_negative("gatekeeper.continuous_outflow_floor", self.continuous_outflow_floor)?;
        require_positive("gatekeeper.collapse_fraction", self.collapse_fraction)?;
        if self.collapse_fraction >= 1.0 || self.min_breadth > 1.0 {
            return Err(ConfigError::InflowBand(format!(
                "collapse_fraction {} and min_breadth {} must be fractions",
                self.collapse_fraction, self.min_breadth
            )));
        }
        let band = [
            self.inflow_min,
            self.sweet_spot_low,
            self.sweet_spot_high,
            self.inflow_max,
        ];
        if band.iter().any(|v| !v.is_finite()) || band.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::InflowBand(format!(
                "expected inflow_min <= sweet_spot_low <= sweet_spot_high <= inflow_max, got {band:?}"
            )));
        }
        Ok(())
    }
}

/// Ordered rule chain.
pub struct TradeGatekeeper {
    rules: Vec<Box<dyn GateRule>>,
}

impl TradeGatekeeper {
    /// The standard four-rule chain.
    pub fn new(config: &GatekeeperConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_rules(vec![
            Box::new(ForbiddenScenario),
            Box::new(SectorResonance::new(config)),
            Box::new(CapitalFlowReversal::new(config)),
            Box::new(DecisionTagRule::new(config)),
        ]))
    }

    pub fn with_rules(rules: Vec<Box<dyn GateRule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Evaluate every rule and combine. Borrows the signal; the caller
    /// decides whether it moves on to execution.
    pub fn evaluate(&self, signal: &TradeSignal, peers: &[PeerQuote]) -> GatekeeperDecision {
        let ctx = GateContext { peers };
        let evaluations: Vec<RuleEvaluation> =
            self.rules.iter().map(|r| r.evaluate(signal, &ctx)).collect();
        let (verdict, tag) = combine(&evaluations);
        let decision = GatekeeperDecision {
            signal_id: signal.id,
            instrument: signal.instrument.clone(),
            score: signal.score,
            verdict,
            tag,
            evaluations,
            decided_at: signal.timestamp,
        };
        info!(
            signal = %decision.signal_id,
            instrument = %decision.instrument,
            score = decision.score,
            %verdict,
            %tag,
            objections = decision.objections().len(),
            "gatekeeper decision"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SignalId, SituationLabel, TickEvent, TradeSide};
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, minute, 0)
            .unwrap()
    }

    fn signal(id: u64, minute: u32, net_inflow: f64, inflow_ratio: f64) -> TradeSignal {
        let trigger = TickEvent {
            instrument: "600000".into(),
            price: 10.5,
            volume: 1_000,
            notional: 1.05,
            side: TradeSide::Buy,
            open: 10.0,
            high: 10.6,
            low: 9.9,
            reference_close: 10.0,
            ingested_at: at(minute),
        };
        TradeSignal {
            id: SignalId(id),
            instrument: "600000".into(),
            score: 0.8,
            timestamp: at(minute),
            trigger,
            sector: Some("Banks".into()),
            labels: Vec::new(),
            net_inflow,
            inflow_ratio,
            risk_score: 0.2,
        }
    }

    fn strong_banks() -> Vec<PeerQuote> {
        ["a", "b", "c", "d"]
            .iter()
            .map(|id| PeerQuote {
                instrument: (*id).into(),
                sector: Some("Banks".into()),
                change_pct: 6.0,
            })
            .collect()
    }

    fn gatekeeper() -> TradeGatekeeper {
        TradeGatekeeper::new(&GatekeeperConfig::default()).unwrap()
    }

    #[test]
    fn sweet_spot_with_strong_sector_is_approved() {
        let d = gatekeeper().evaluate(&signal(1, 0, 50.0, 0.2), &strong_banks());
        assert_eq!(d.verdict, Verdict::Approve);
        assert_eq!(d.tag, DecisionTag::SweetSpot);
        assert_eq!(d.evaluations.len(), 4);
    }

    #[test]
    fn forbidden_label_blocks_but_every_rule_is_recorded() {
        let mut s = signal(1, 0, 50.0, 0.2);
        s.labels.push(SituationLabel::LimitLocked);
        let d = gatekeeper().evaluate(&s, &strong_banks());
        assert_eq!(d.verdict, Verdict::Block);
        assert_eq!(
            d.evaluations.iter().map(|e| e.rule.as_str()).collect::<Vec<_>>(),
            vec![
                "forbidden_scenario",
                "sector_resonance",
                "capital_flow_reversal",
                "decision_tag"
            ]
        );
        assert!(d.evaluation("forbidden_scenario").unwrap().is_absolute_veto());
    }

    #[test]
    fn weak_sector_downgrades() {
        let d = gatekeeper().evaluate(&signal(1, 0, 50.0, 0.2), &[]);
        assert_eq!(d.verdict, Verdict::DowngradeToWatch);
    }

    #[test]
    fn massive_outflow_within_ttl_blocks() {
        let g = gatekeeper();
        let first = g.evaluate(&signal(1, 0, 80.0, 0.2), &strong_banks());
        assert_eq!(first.verdict, Verdict::Approve);
        let second = g.evaluate(&signal(2, 3, -60.0, 0.2), &strong_banks());
        assert_eq!(second.verdict, Verdict::Block);
        let flow = second.evaluation("capital_flow_reversal").unwrap();
        assert!(flow.is_absolute_veto());
        assert!(flow.reason.contains("massive outflow"));
    }

    #[test]
    fn inflow_extremes_are_tagged() {
        let g = gatekeeper();
        assert_eq!(
            g.evaluate(&signal(1, 0, 10.0, 0.01), &strong_banks()).tag,
            DecisionTag::StopLossPriority
        );
        let mut hot = signal(2, 0, 10.0, 0.9);
        hot.instrument = "600001".into();
        assert_eq!(g.evaluate(&hot, &strong_banks()).tag, DecisionTag::PumpRisk);
    }

    #[test]
    fn cautionary_labels_with_high_risk_are_flagged() {
        let mut s = signal(1, 0, 10.0, 0.2);
        s.labels.push(SituationLabel::Overextended);
        s.risk_score = 0.8;
        let d = gatekeeper().evaluate(&s, &strong_banks());
        assert_eq!(d.tag, DecisionTag::FlaggedRisk);
        assert_eq!(d.verdict, Verdict::Block);
    }

    #[test]
    fn unordered_inflow_band_is_rejected() {
        let config = GatekeeperConfig {
            sweet_spot_low: 0.5,
            sweet_spot_high: 0.2,
            ..GatekeeperConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InflowBand(_))));
    }
}
