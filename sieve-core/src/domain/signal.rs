//! Trade signals and the situational labels attached to them.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{InstrumentId, SignalId, TickEvent};

/// Situational label attached to a signal by the scoring engine.
///
/// Forbidden labels veto a signal outright; cautionary labels only matter in
/// combination with an elevated risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SituationLabel {
    /// Sealed at the upper price limit; no realistic fill.
    LimitLocked,
    /// Trading at the lower price limit.
    LimitDown,
    /// Exchange announced a halt that has not taken effect yet.
    HaltPending,
    /// Signal fired in the closing minutes of the session.
    LateSessionChase,
    /// Opened far above the reference close.
    HighOpen,
    /// Price rising on shrinking volume.
    VolumeDivergence,
    /// Extended far beyond the intraday average.
    Overextended,
    /// Reclaimed then lost the session high.
    FailedBreakout,
}

impl SituationLabel {
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            Self::LimitLocked | Self::LimitDown | Self::HaltPending | Self::LateSessionChase
        )
    }

    pub fn is_cautionary(&self) -> bool {
        !self.is_forbidden()
    }
}

/// A score crossing the signal threshold, ready for the gatekeeper.
///
/// Not `Clone`: a signal is consumed exactly once, moving into the executor
/// when approved and dropped otherwise.
#[derive(Debug, Serialize)]
pub struct TradeSignal {
    pub id: SignalId,
    pub instrument: InstrumentId,
    pub score: f64,
    pub timestamp: NaiveDateTime,
    pub trigger: TickEvent,
    pub sector: Option<String>,
    pub labels: Vec<SituationLabel>,
    /// Running net inflow (buy − sell notional) since subscription.
    pub net_inflow: f64,
    /// Net inflow as a fraction of cumulative traded notional, in `[-1, 1]`.
    pub inflow_ratio: f64,
    /// Scoring engine risk estimate in `[0, 1]`.
    pub risk_score: f64,
}

impl TradeSignal {
    pub fn has_forbidden_label(&self) -> bool {
        self.labels.iter().any(|l| l.is_forbidden())
    }

    pub fn cautionary_labels(&self) -> impl Iterator<Item = &SituationLabel> {
        self.labels.iter().filter(|l| l.is_cautionary())
    }
}
