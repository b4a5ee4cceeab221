//! Circuit breaker for a failing quote source.
//!
//! After a run of consecutive provider failures the breaker opens and the
//! guarded source answers `DataUnavailable` immediately for a cooldown period,
//! so a dead provider costs one fallback per instrument instead of one timeout
//! per instrument. Once the cooldown lapses a single probe call goes through;
//! its outcome closes the breaker or re-opens it for another cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    /// Refusing calls until `since + cooldown`.
    Open { since: Instant },
    /// Cooldown over; one probe call is in flight.
    Probing,
}

#[derive(Debug)]
struct Tally {
    state: BreakerState,
    failures_in_a_row: u32,
    trips: u64,
}

/// Shared by every worker of a stage, and across runs of the same filter.
#[derive(Debug)]
pub struct CircuitBreaker {
    tally: Mutex<Tally>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            tally: Mutex::new(Tally {
                state: BreakerState::Closed,
                failures_in_a_row: 0,
                trips: 0,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Whether a provider call may go out now. The first caller after the
    /// cooldown becomes the probe; everyone else is refused until it reports.
    pub fn is_allowed(&self) -> bool {
        let mut tally = self.tally.lock().unwrap();
        match tally.state {
            BreakerState::Closed => true,
            BreakerState::Probing => false,
            BreakerState::Open { since } if since.elapsed() >= self.cooldown => {
                tally.state = BreakerState::Probing;
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    pub fn record_success(&self) {
        let mut tally = self.tally.lock().unwrap();
        tally.failures_in_a_row = 0;
        tally.state = BreakerState::Closed;
    }

    /// Returns true if this failure opened the breaker.
    pub fn record_failure(&self) -> bool {
        let mut tally = self.tally.lock().unwrap();
        tally.failures_in_a_row += 1;
        let reopen = match tally.state {
            BreakerState::Probing => true,
            BreakerState::Closed => tally.failures_in_a_row >= self.threshold,
            BreakerState::Open { .. } => false,
        };
        if reopen {
            tally.state = BreakerState::Open {
                since: Instant::now(),
            };
            tally.trips += 1;
        }
        reopen
    }

    pub fn state(&self) -> BreakerState {
        self.tally.lock().unwrap().state
    }

    /// Times the breaker has opened since construction.
    pub fn trips(&self) -> u64 {
        self.tally.lock().unwrap().trips
    }
}
