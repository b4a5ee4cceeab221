//! Fire control: the per-tick path from a delivered event to an order.
//!
//! Runs on the bus consumer thread. Each event updates the peer and flow
//! state, goes through the scoring engine, and a threshold crossing outside
//! the instrument's cooldown becomes a [`TradeSignal`] for the gatekeeper.
//! Every decision is logged; approved signals move into the executor.
//!
//! A scoring engine that panics costs only the tick it panicked on: the
//! panic is caught here and reported as a handler failure, and shared state
//! stays usable for every later tick.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sieve_core::domain::{InstrumentId, SignalId, TickEvent, TradeSignal};
use sieve_core::funnel::Candidate;
use sieve_core::gatekeeper::{PeerQuote, TradeGatekeeper};
use sieve_core::refiner::RefinerReport;

use crate::audit::DecisionLog;
use crate::bus::HandlerError;
use crate::connection::SharedConnection;
use crate::executor::OrderExecutor;
use crate::scoring::{ScoringConfig, ScoringEngine};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FireStats {
    pub ticks: u64,
    pub signals: u64,
    pub cooled_down: u64,
    pub approved: u64,
    pub executed: u64,
    pub execution_failures: u64,
    pub scorer_panics: u64,
}

#[derive(Default)]
struct FireCounters {
    ticks: AtomicU64,
    signals: AtomicU64,
    cooled_down: AtomicU64,
    approved: AtomicU64,
    executed: AtomicU64,
    execution_failures: AtomicU64,
    scorer_panics: AtomicU64,
}

/// Lock that survives an earlier holder's panic.
fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, Default)]
struct Flow {
    net: f64,
    gross: f64,
}

impl Flow {
    fn ratio(&self) -> f64 {
        if self.gross > 0.0 {
            (self.net / self.gross).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

#[derive(Default)]
struct FireState {
    peers: BTreeMap<InstrumentId, PeerQuote>,
    flows: HashMap<InstrumentId, Flow>,
    last_signal: HashMap<InstrumentId, NaiveDateTime>,
}

pub struct FireControl {
    scorer: Mutex<Box<dyn ScoringEngine>>,
    gatekeeper: Arc<TradeGatekeeper>,
    connection: Arc<SharedConnection<dyn OrderExecutor>>,
    log: Arc<DecisionLog>,
    threshold: f64,
    cooldown: Duration,
    sectors: HashMap<InstrumentId, Option<String>>,
    state: Mutex<FireState>,
    next_signal: AtomicU64,
    counters: FireCounters,
}

impl FireControl {
    /// Peers start from the refiner's view of the whole watchlist and are
    /// updated by live ticks.
    pub fn new(
        scorer: Box<dyn ScoringEngine>,
        gatekeeper: Arc<TradeGatekeeper>,
        connection: Arc<SharedConnection<dyn OrderExecutor>>,
        log: Arc<DecisionLog>,
        scoring: &ScoringConfig,
        watchlist: &[Candidate],
        report: &RefinerReport,
    ) -> Self {
        let sectors: HashMap<InstrumentId, Option<String>> = watchlist
            .iter()
            .map(|c| (c.id().clone(), c.instrument.sector.clone()))
            .collect();
        let peers = report
            .ranked
            .iter()
            .filter(|s| s.metrics.reference_close > 0.0)
            .map(|s| {
                let quote = PeerQuote {
                    instrument: s.instrument.clone(),
                    sector: sectors.get(&s.instrument).cloned().flatten(),
                    change_pct: (s.metrics.last / s.metrics.reference_close - 1.0) * 100.0,
                };
                (s.instrument.clone(), quote)
            })
            .collect();
        Self {
            scorer: Mutex::new(scorer),
            gatekeeper,
            connection,
            log,
            threshold: scoring.signal_threshold,
            cooldown: Duration::seconds(scoring.cooldown_secs as i64),
            sectors,
            state: Mutex::new(FireState {
                peers,
                ..FireState::default()
            }),
            next_signal: AtomicU64::new(1),
            counters: FireCounters::default(),
        }
    }

    pub fn stats(&self) -> FireStats {
        let c = &self.counters;
        FireStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            signals: c.signals.load(Ordering::Relaxed),
            cooled_down: c.cooled_down.load(Ordering::Relaxed),
            approved: c.approved.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            execution_failures: c.execution_failures.load(Ordering::Relaxed),
            scorer_panics: c.scorer_panics.load(Ordering::Relaxed),
        }
    }

    /// Bus handler entry point.
    pub fn on_tick(&self, event: &TickEvent) -> Result<(), HandlerError> {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let sector = self.sectors.get(&event.instrument).cloned().flatten();

        let flow = {
            let mut state = lock(&self.state);
            state.peers.insert(
                event.instrument.clone(),
                PeerQuote {
                    instrument: event.instrument.clone(),
                    sector: sector.clone(),
                    change_pct: event.change_pct(),
                },
            );
            let flow = state.flows.entry(event.instrument.clone()).or_default();
            flow.net += event.signed_notional();
            flow.gross += event.notional;
            *flow
        };

        let scored = {
            let mut scorer = lock(&self.scorer);
            catch_unwind(AssertUnwindSafe(|| scorer.on_tick(event)))
        };
        let reading = match scored {
            Ok(Some(reading)) => reading,
            Ok(None) => return Ok(()),
            Err(_) => {
                self.counters.scorer_panics.fetch_add(1, Ordering::Relaxed);
                warn!(instrument = %event.instrument, "scoring engine panicked; tick skipped");
                return Err(HandlerError::new(format!(
                    "scoring engine panicked on {}",
                    event.instrument
                )));
            }
        };
        if reading.score < self.threshold {
            return Ok(());
        }

        let peers: Vec<PeerQuote> = {
            let mut state = lock(&self.state);
            if let Some(last) = state.last_signal.get(&event.instrument) {
                if event.ingested_at - *last < self.cooldown {
                    self.counters.cooled_down.fetch_add(1, Ordering::Relaxed);
                    debug!(instrument = %event.instrument, score = reading.score, "signal suppressed by cooldown");
                    return Ok(());
                }
            }
            state.last_signal.insert(event.instrument.clone(), event.ingested_at);
            state.peers.values().cloned().collect()
        };

        let signal = TradeSignal {
            id: SignalId(self.next_signal.fetch_add(1, Ordering::SeqCst)),
            instrument: event.instrument.clone(),
            score: reading.score,
            timestamp: event.ingested_at,
            trigger: event.clone(),
            sector,
            labels: reading.labels,
            net_inflow: flow.net,
            inflow_ratio: flow.ratio(),
            risk_score: reading.risk_score,
        };
        self.counters.signals.fetch_add(1, Ordering::Relaxed);

        let decision = self.gatekeeper.evaluate(&signal, &peers);
        if let Err(err) = self.log.append(&decision) {
            warn!(signal = %decision.signal_id, error = %err, "decision log write failed");
        }
        if !decision.is_approved() {
            return Ok(());
        }
        self.counters.approved.fetch_add(1, Ordering::Relaxed);

        let Some(executor) = self.connection.get() else {
            self.counters.execution_failures.fetch_add(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!(
                "approved {} but no executor is connected",
                decision.signal_id
            )));
        };
        match executor.submit(signal, &decision) {
            Ok(result) => {
                self.counters.executed.fetch_add(1, Ordering::Relaxed);
                info!(
                    signal = %result.signal_id,
                    instrument = %result.instrument,
                    accepted = result.accepted,
                    order_ref = ?result.order_ref,
                    "order submitted"
                );
                Ok(())
            }
            Err(err) => {
                self.counters.execution_failures.fetch_add(1, Ordering::Relaxed);
                Err(HandlerError::new(format!("{}: {err}", decision.signal_id)))
            }
        }
    }
}
