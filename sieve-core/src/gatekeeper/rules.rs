//! The gatekeeper rule chain.
//!
//! Every rule implements [`GateRule`]. Rules are evaluated in a fixed order
//! and all of them run for every signal, so the decision record is complete
//! even when the first rule already vetoed.

use chrono::Duration;

use crate::domain::TradeSignal;

use super::decision::{DecisionTag, RuleEvaluation, RuleOutcome};
use super::flow::{detect, FlowHistory, FlowObservation, FlowThresholds};
use super::resonance::{PeerQuote, ResonanceCache, ResonanceSnapshot};
use super::GatekeeperConfig;

/// Inputs besides the signal.
pub struct GateContext<'a> {
    /// Latest quotes of the current shortlist.
    pub peers: &'a [PeerQuote],
}

/// One link of the chain.
pub trait GateRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, signal: &TradeSignal, ctx: &GateContext<'_>) -> RuleEvaluation;
}

/// Absolute veto on forbidden situational labels, regardless of score.
pub struct ForbiddenScenario;

impl GateRule for ForbiddenScenario {
    fn name(&self) -> &'static str {
        "forbidden_scenario"
    }

    fn evaluate(&self, signal: &TradeSignal, _ctx: &GateContext<'_>) -> RuleEvaluation {
        let forbidden: Vec<String> = signal
            .labels
            .iter()
            .filter(|l| l.is_forbidden())
            .map(|l| format!("{l:?}"))
            .collect();
        if forbidden.is_empty() {
            RuleEvaluation::pass(self.name(), "no forbidden labels")
        } else {
            RuleEvaluation::absolute_veto(
                self.name(),
                format!("forbidden labels: {}", forbidden.join(", ")),
            )
        }
    }
}

/// Downgrades signals whose sector is not moving with them.
pub struct SectorResonance {
    min_leaders: usize,
    min_breadth: f64,
    leader_strength_pct: f64,
    cache: ResonanceCache,
}

impl SectorResonance {
    pub fn new(config: &GatekeeperConfig) -> Self {
        Self {
            min_leaders: config.min_leaders,
            min_breadth: config.min_breadth,
            leader_strength_pct: config.leader_strength_pct,
            cache: ResonanceCache::new(Duration::seconds(config.resonance_ttl_secs as i64)),
        }
    }
}

impl GateRule for SectorResonance {
    fn name(&self) -> &'static str {
        "sector_resonance"
    }

    fn evaluate(&self, signal: &TradeSignal, ctx: &GateContext<'_>) -> RuleEvaluation {
        let Some(sector) = signal.sector.as_deref() else {
            return RuleEvaluation::downgrade(self.name(), "sector unknown");
        };
        let (snapshot, cached) = self.cache.get_or_compute(sector, signal.timestamp, || {
            ResonanceSnapshot::compute(sector, ctx.peers, self.leader_strength_pct, signal.timestamp)
        });
        let detail = format!(
            "{sector}: {} leaders, breadth {:.0}% over {} peers{}",
            snapshot.leaders,
            snapshot.breadth * 100.0,
            snapshot.peers,
            if cached { " (cached)" } else { "" }
        );
        if snapshot.leaders >= self.min_leaders && snapshot.breadth >= self.min_breadth {
            RuleEvaluation::pass(self.name(), detail)
        } else {
            RuleEvaluation::downgrade(self.name(), format!("weak resonance, {detail}"))
        }
    }
}

/// Absolute veto on a reversal in the instrument's net inflow.
pub struct CapitalFlowReversal {
    thresholds: FlowThresholds,
    history: FlowHistory,
}

impl CapitalFlowReversal {
    pub fn new(config: &GatekeeperConfig) -> Self {
        Self {
            thresholds: FlowThresholds {
                swing_floor: config.outflow_swing_floor,
                collapse_fraction: config.collapse_fraction,
                outflow_floor: config.continuous_outflow_floor,
            },
            history: FlowHistory::new(Duration::seconds(config.flow_ttl_secs as i64)),
        }
    }

    pub fn history(&self) -> &FlowHistory {
        &self.history
    }
}

impl GateRule for CapitalFlowReversal {
    fn name(&self) -> &'static str {
        "capital_flow_reversal"
    }

    fn evaluate(&self, signal: &TradeSignal, _ctx: &GateContext<'_>) -> RuleEvaluation {
        let current = signal.net_inflow;
        let prior = self.history.observe(
            &signal.instrument,
            FlowObservation {
                at: signal.timestamp,
                net_inflow: current,
            },
        );
        let Some(prior) = prior else {
            return RuleEvaluation::pass(self.name(), "no recent prior reading");
        };
        match detect(prior.net_inflow, current, &self.thresholds) {
            Some(reversal) => RuleEvaluation::absolute_veto(
                self.name(),
                format!("{reversal}: {:.1} -> {current:.1}", prior.net_inflow),
            ),
            None => RuleEvaluation::pass(
                self.name(),
                format!("flow {:.1} -> {current:.1}", prior.net_inflow),
            ),
        }
    }
}

/// Fixed classification over inflow ratio, risk score, and cautionary labels.
pub struct DecisionTagRule {
    inflow_min: f64,
    sweet_spot_low: f64,
    sweet_spot_high: f64,
    inflow_max: f64,
    risk_ceiling: f64,
}

impl DecisionTagRule {
    pub fn new(config: &GatekeeperConfig) -> Self {
        Self {
            inflow_min: config.inflow_min,
            sweet_spot_low: config.sweet_spot_low,
            sweet_spot_high: config.sweet_spot_high,
            inflow_max: config.inflow_max,
            risk_ceiling: config.risk_ceiling,
        }
    }

    pub fn classify(&self, signal: &TradeSignal) -> (DecisionTag, RuleOutcome) {
        let ratio = signal.inflow_ratio;
        let risky = signal.risk_score >= self.risk_ceiling;
        if ratio < self.inflow_min {
            (DecisionTag::StopLossPriority, RuleOutcome::Veto)
        } else if ratio > self.inflow_max {
            (DecisionTag::PumpRisk, RuleOutcome::Veto)
        } else if risky && signal.cautionary_labels().next().is_some() {
            (DecisionTag::FlaggedRisk, RuleOutcome::Veto)
        } else if !risky && (self.sweet_spot_low..=self.sweet_spot_high).contains(&ratio) {
            (DecisionTag::SweetSpot, RuleOutcome::Pass)
        } else {
            (DecisionTag::DefaultReject, RuleOutcome::Veto)
        }
    }
}

impl GateRule for DecisionTagRule {
    fn name(&self) -> &'static str {
        "decision_tag"
    }

    fn evaluate(&self, signal: &TradeSignal, _ctx: &GateContext<'_>) -> RuleEvaluation {
        let (tag, outcome) = self.classify(signal);
        RuleEvaluation {
            rule: self.name().to_string(),
            outcome,
            absolute: false,
            reason: format!(
                "{tag}: inflow ratio {:.3}, risk {:.2}",
                signal.inflow_ratio, signal.risk_score
            ),
            tag: Some(tag),
        }
    }
}
