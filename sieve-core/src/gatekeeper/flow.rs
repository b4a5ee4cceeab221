//! Capital-flow history and reversal detection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::domain::InstrumentId;

/// Kind of reversal detected between two net-inflow readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowReversal {
    /// Positive to negative with a swing beyond the floor.
    MassiveOutflow,
    /// Still positive but dropped by more than the collapse fraction.
    MomentumCollapse,
    /// Two consecutive readings below the negative floor.
    ContinuousOutflow,
}

impl fmt::Display for FlowReversal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MassiveOutflow => "massive outflow",
            Self::MomentumCollapse => "momentum collapse",
            Self::ContinuousOutflow => "continuous outflow",
        })
    }
}

/// Thresholds for [`detect`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowThresholds {
    /// Minimum prior − current swing for a massive outflow.
    pub swing_floor: f64,
    /// Relative drop (0..1) that counts as a collapse.
    pub collapse_fraction: f64,
    /// Readings below `-outflow_floor` count as outflow.
    pub outflow_floor: f64,
}

/// Compare a reading with the previous one.
pub fn detect(prior: f64, current: f64, t: &FlowThresholds) -> Option<FlowReversal> {
    if prior > 0.0 && current < 0.0 && prior - current >= t.swing_floor {
        Some(FlowReversal::MassiveOutflow)
    } else if prior > 0.0 && current > 0.0 && current < prior * (1.0 - t.collapse_fraction) {
        Some(FlowReversal::MomentumCollapse)
    } else if prior < -t.outflow_floor && current < -t.outflow_floor {
        Some(FlowReversal::ContinuousOutflow)
    } else {
        None
    }
}

/// One recorded net-inflow reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowObservation {
    pub at: NaiveDateTime,
    pub net_inflow: f64,
}

/// Most recent net-inflow reading per instrument, TTL-checked on read.
pub struct FlowHistory {
    ttl: Duration,
    last: Mutex<HashMap<InstrumentId, FlowObservation>>,
}

impl FlowHistory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Record `observation` and return the previous reading if it is still
    /// within the TTL.
    pub fn observe(
        &self,
        instrument: &InstrumentId,
        observation: FlowObservation,
    ) -> Option<FlowObservation> {
        let mut last = self.last.lock().unwrap();
        let prior = last.insert(instrument.clone(), observation);
        prior.filter(|p| {
            let age = observation.at - p.at;
            age >= Duration::zero() && age <= self.ttl
        })
    }

    pub fn latest(&self, instrument: &InstrumentId) -> Option<FlowObservation> {
        self.last.lock().unwrap().get(instrument).copied()
    }

    pub fn clear(&self) {
        self.last.lock().unwrap().clear();
    }
}
