//! Gatekeeper verdicts and the audit record of one evaluation.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::{InstrumentId, SignalId};

/// Net verdict for a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Block,
    /// Keep watching, do not trade.
    DowngradeToWatch,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "approve",
            Self::Block => "block",
            Self::DowngradeToWatch => "downgrade_to_watch",
        })
    }
}

/// Fixed label summarizing the inflow/risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTag {
    /// Inflow below the minimum; protecting capital comes first.
    StopLossPriority,
    /// Inflow above the maximum; likely a pump.
    PumpRisk,
    /// Cautionary labels with elevated risk.
    FlaggedRisk,
    SweetSpot,
    DefaultReject,
}

impl fmt::Display for DecisionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StopLossPriority => "stop_loss_priority",
            Self::PumpRisk => "pump_risk",
            Self::FlaggedRisk => "flagged_risk",
            Self::SweetSpot => "sweet_spot",
            Self::DefaultReject => "default_reject",
        })
    }
}

/// What one rule concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Pass,
    Veto,
    Downgrade,
}

/// One rule's evaluation, kept even when an earlier rule already vetoed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule: String,
    pub outcome: RuleOutcome,
    /// A veto from this rule overrides every other rule.
    pub absolute: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<DecisionTag>,
}

impl RuleEvaluation {
    pub fn pass(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            outcome: RuleOutcome::Pass,
            absolute: false,
            reason: reason.into(),
            tag: None,
        }
    }

    pub fn absolute_veto(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            outcome: RuleOutcome::Veto,
            absolute: true,
            reason: reason.into(),
            tag: None,
        }
    }

    pub fn downgrade(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            outcome: RuleOutcome::Downgrade,
            absolute: false,
            reason: reason.into(),
            tag: None,
        }
    }

    pub fn is_absolute_veto(&self) -> bool {
        self.absolute && self.outcome == RuleOutcome::Veto
    }
}

/// Immutable record of one gatekeeper evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperDecision {
    pub signal_id: SignalId,
    pub instrument: InstrumentId,
    pub score: f64,
    pub verdict: Verdict,
    pub tag: DecisionTag,
    /// Every rule, in chain order.
    pub evaluations: Vec<RuleEvaluation>,
    pub decided_at: NaiveDateTime,
}

impl GatekeeperDecision {
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approve
    }

    pub fn evaluation(&self, rule: &str) -> Option<&RuleEvaluation> {
        self.evaluations.iter().find(|e| e.rule == rule)
    }

    /// Reasons from every rule that did not pass.
    pub fn objections(&self) -> Vec<&str> {
        self.evaluations
            .iter()
            .filter(|e| e.outcome != RuleOutcome::Pass)
            .map(|e| e.reason.as_str())
            .collect()
    }
}

/// Combine rule evaluations into a verdict.
///
/// Any absolute veto blocks; otherwise a resonance downgrade downgrades;
/// otherwise the tagged rule decides.
pub fn combine(evaluations: &[RuleEvaluation]) -> (Verdict, DecisionTag) {
    let tag = evaluations
        .iter()
        .find_map(|e| e.tag)
        .unwrap_or(DecisionTag::DefaultReject);

    if evaluations.iter().any(RuleEvaluation::is_absolute_veto) {
        return (Verdict::Block, tag);
    }
    if evaluations
        .iter()
        .any(|e| e.outcome == RuleOutcome::Downgrade)
    {
        return (Verdict::DowngradeToWatch, tag);
    }
    let tagged_outcome = evaluations
        .iter()
        .find(|e| e.tag.is_some())
        .map(|e| e.outcome)
        .unwrap_or(RuleOutcome::Veto);
    let verdict = match tagged_outcome {
        RuleOutcome::Pass => Verdict::Approve,
        RuleOutcome::Downgrade => Verdict::DowngradeToWatch,
        RuleOutcome::Veto => Verdict::Block,
    };
    (verdict, tag)
}
