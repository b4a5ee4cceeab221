//! Orchestration engine: the session state machine.
//!
//! ```text
//! PreMarket ──► SnapshotFilter ──► FireControl ──► Closed
//!  stage 1       stage 2 once,      subscribe head,
//!                stage 3 × N        score, gate, execute
//! ```
//!
//! A control thread walks the schedule. Every wait is a crossbeam timer
//! raced against the stop channel, so a stop request is seen immediately.
//! Started after the snapshot offset, the engine runs the funnel once and
//! goes straight to fire control. Stop is idempotent from any phase and tears
//! down in order: unsubscribe feeds, stop the bus, release the executor.

pub mod clock;
pub mod fire_control;
pub mod phase;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use thiserror::Error;
use tracing::{error, info, warn};

use sieve_core::config::ConfigError;
use sieve_core::data::{QuoteSource, TickSink};
use sieve_core::domain::{Instrument, InstrumentId, SessionId, TickEvent, TimeRange};
use sieve_core::funnel::{Candidate, FunnelFilter};
use sieve_core::gatekeeper::TradeGatekeeper;
use sieve_core::refiner::{ProfileSelector, RefinerReport, TickRefiner};
use sieve_core::rng::SeedHierarchy;

use crate::audit::{DecisionLog, PhaseTransition, SessionAudit};
use crate::bus::{BusError, BusStats, EventBus};
use crate::config::SieveConfig;
use crate::connection::{ConnectionError, SharedConnection};
use crate::executor::{ExecutorFactory, OrderExecutor};
use crate::scoring::ScoringEngine;

pub use clock::{LocalClock, SessionClock, ShiftedClock};
pub use fire_control::{FireControl, FireStats};
pub use phase::{SessionConfig, SessionPhase};

/// Bus topic carrying live ticks.
pub const TICK_TOPIC: &str = "tick";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("engine already started")]
    AlreadyStarted,

    #[error("phase cannot move back from {from} to {to}")]
    PhaseRegression { from: SessionPhase, to: SessionPhase },

    #[error("failed to spawn control thread: {0}")]
    Spawn(String),

    #[error("control thread panicked")]
    ControlPanicked,
}

/// Everything the engine needs besides configuration.
pub struct EngineParts {
    pub source: Arc<dyn QuoteSource>,
    pub scorer: Box<dyn ScoringEngine>,
    pub executor: ExecutorFactory,
    pub connection: Arc<SharedConnection<dyn OrderExecutor>>,
    pub clock: Arc<dyn SessionClock>,
    pub trading_date: NaiveDate,
    pub decision_log: Arc<DecisionLog>,
    pub profile_selector: Option<ProfileSelector>,
}

struct Inner {
    config: SieveConfig,
    trading_date: NaiveDate,
    source: Arc<dyn QuoteSource>,
    funnel: FunnelFilter,
    refiner: TickRefiner,
    gatekeeper: Arc<TradeGatekeeper>,
    bus: Arc<EventBus<TickEvent>>,
    connection: Arc<SharedConnection<dyn OrderExecutor>>,
    executor: ExecutorFactory,
    clock: Arc<dyn SessionClock>,
    log: Arc<DecisionLog>,
    tracked: Option<InstrumentId>,
    scorer: Mutex<Option<Box<dyn ScoringEngine>>>,
    phase: Mutex<SessionPhase>,
    audit: Mutex<SessionAudit>,
    subscribed: Mutex<Vec<InstrumentId>>,
    fire: Mutex<Option<Arc<FireControl>>>,
    /// Serializes fire-control setup against teardown.
    lifecycle: Mutex<()>,
    stopping: AtomicBool,
    torn_down: AtomicBool,
}

pub struct OrchestrationEngine {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    control: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
    started: AtomicBool,
}

impl OrchestrationEngine {
    /// Validate the configuration and build every component. Nothing runs
    /// until [`start`](Self::start).
    pub fn new(config: SieveConfig, parts: EngineParts) -> Result<Self, EngineError> {
        config.validate()?;
        let session = SessionId::derive(parts.trading_date, config.seed);
        let seeds = SeedHierarchy::new(config.seed, session.clone());

        let funnel = FunnelFilter::new(
            config.funnel_config(),
            Arc::clone(&parts.source),
            seeds.clone(),
            parts.trading_date,
        )?;
        let mut refiner = TickRefiner::new(
            config.refiner_config(),
            Arc::clone(&parts.source),
            seeds,
            parts.trading_date,
        )?;
        if let Some(selector) = parts.profile_selector {
            refiner = refiner.with_profile_selector(selector);
        }
        let gatekeeper = Arc::new(TradeGatekeeper::new(&config.gatekeeper)?);
        let bus = Arc::new(EventBus::new(config.bus.clone())?);
        let tracked = config.session.tracked.clone().map(InstrumentId::new);
        let (stop_tx, stop_rx) = bounded(1);

        let inner = Inner {
            trading_date: parts.trading_date,
            source: parts.source,
            funnel,
            refiner,
            gatekeeper,
            bus,
            connection: parts.connection,
            executor: parts.executor,
            clock: parts.clock,
            log: parts.decision_log,
            tracked,
            scorer: Mutex::new(Some(parts.scorer)),
            phase: Mutex::new(SessionPhase::PreMarket),
            audit: Mutex::new(SessionAudit::new(session, parts.trading_date)),
            subscribed: Mutex::new(Vec::new()),
            fire: Mutex::new(None),
            lifecycle: Mutex::new(()),
            stopping: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            control: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the control thread. A second call fails.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }
        let inner = Arc::clone(&self.inner);
        let stop = self.stop_rx.clone();
        let handle = thread::Builder::new()
            .name("session-control".into())
            .spawn(move || {
                let result = inner.run_session(&stop);
                if let Err(err) = &result {
                    error!(error = %err, "session control failed");
                    inner.note(format!("control failed: {err}"));
                }
                result
            })
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        *self.control.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Block until the session reaches its scheduled close (or is stopped).
    pub fn wait(&self) -> Result<(), EngineError> {
        let handle = self.control.lock().unwrap().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| EngineError::ControlPanicked)?,
            None => Ok(()),
        }
    }

    /// Stop from any phase. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(phase = %self.phase(), "stopping session");
        self.stop_tx.lock().unwrap().take();
        let handle = self.control.lock().unwrap().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "control thread ended with error"),
                Err(_) => warn!("control thread panicked"),
            }
        }
        self.inner.teardown();
        if let Err(err) = self.inner.advance(SessionPhase::Closed) {
            warn!(error = %err, "close after stop");
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock().unwrap()
    }

    pub fn audit(&self) -> SessionAudit {
        self.inner.audit.lock().unwrap().clone()
    }

    pub fn bus_stats(&self) -> BusStats {
        self.inner.bus.stats()
    }

    pub fn fire_stats(&self) -> Option<FireStats> {
        self.inner.fire.lock().unwrap().as_ref().map(|f| f.stats())
    }

    pub fn decision_log(&self) -> &Arc<DecisionLog> {
        &self.inner.log
    }

    pub fn subscribed(&self) -> Vec<InstrumentId> {
        self.inner.subscribed.lock().unwrap().clone()
    }
}

impl Drop for OrchestrationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn note(&self, note: String) {
        self.audit.lock().unwrap().notes.push(note);
    }

    /// Move forward to `next`. Re-entering the current phase is a no-op.
    fn advance(&self, next: SessionPhase) -> Result<(), EngineError> {
        let mut phase = self.phase.lock().unwrap();
        let from = *phase;
        if next < from {
            return Err(EngineError::PhaseRegression { from, to: next });
        }
        if next == from {
            return Ok(());
        }
        *phase = next;
        let at = self.clock.now();
        info!(%from, to = %next, %at, "session phase transition");
        self.audit
            .lock()
            .unwrap()
            .transitions
            .push(PhaseTransition { from, to: next, at });
        Ok(())
    }

    /// Sleep on a timer until `target`. False if stopped first.
    fn wait_until(&self, stop: &Receiver<()>, target: NaiveDateTime) -> bool {
        if self.stopping() {
            return false;
        }
        let wait = self.clock.wall_until(target);
        select! {
            recv(stop) -> _ => {},
            recv(after(wait)) -> _ => {},
        }
        !self.stopping()
    }

    fn run_session(&self, stop: &Receiver<()>) -> Result<(), EngineError> {
        let schedule = &self.config.session;
        let now = self.clock.now();
        let watchlist = match schedule.entry_phase(now.time()) {
            SessionPhase::Closed => {
                info!(%now, "session already closed");
                return self.advance(SessionPhase::Closed);
            }
            SessionPhase::FireControl => {
                warn!(%now, snapshot_start = %schedule.snapshot_start, "late start, skipping to fire control");
                self.note(format!("late start at {now}"));
                self.late_watchlist()
            }
            _ => {
                let pre_market = self.trading_date.and_time(schedule.pre_market_start);
                if !self.wait_until(stop, pre_market) {
                    return Ok(());
                }
                let coarse = self.pre_market();
                let start = self.trading_date.and_time(schedule.snapshot_start);
                if !self.wait_until(stop, start) {
                    return Ok(());
                }
                match self.snapshot_loop(coarse, stop)? {
                    Some(watchlist) => watchlist,
                    None => return Ok(()),
                }
            }
        };
        if self.stopping() {
            return Ok(());
        }

        let report = self.refine(&watchlist);
        self.fire_control(&watchlist, &report)?;

        let close = self.trading_date.and_time(schedule.close);
        if !self.wait_until(stop, close) {
            return Ok(());
        }
        self.teardown();
        self.advance(SessionPhase::Closed)
    }

    fn pre_market(&self) -> Vec<Instrument> {
        let (result, coarse) = self.funnel.stage1();
        info!(coarse = coarse.len(), "pre-market watchlist built");
        self.audit.lock().unwrap().record_stage(0, result);
        coarse
    }

    /// Stage 3 window for a snapshot taken now: morning start to now,
    /// clamped to the configured morning window.
    fn snapshot_range(&self) -> TimeRange {
        let morning = self.config.funnel.morning_window;
        let now = self.clock.now().time();
        let end = now
            .min(morning.end)
            .max(morning.start + Duration::minutes(1));
        TimeRange::new(morning.start, end)
    }

    fn snapshot_loop(
        &self,
        coarse: Vec<Instrument>,
        stop: &Receiver<()>,
    ) -> Result<Option<Vec<Candidate>>, EngineError> {
        self.advance(SessionPhase::SnapshotFilter)?;
        let schedule = &self.config.session;
        let max_output = self.funnel.config().max_output;
        let mut watchlist: Vec<Candidate> = Vec::new();

        for i in 0..schedule.snapshot_repeats {
            if !self.wait_until(stop, schedule.iteration_at(self.trading_date, i)) {
                return Ok(None);
            }
            let input = if i == 0 {
                if coarse.is_empty() {
                    warn!("pre-market watchlist is empty, nothing to snapshot");
                    self.note("pre-market watchlist empty".into());
                    break;
                }
                let (result, liquid) = self.funnel.stage2(&coarse);
                self.audit.lock().unwrap().record_stage(0, result);
                if liquid.is_empty() {
                    warn!("no instrument passed the liquidity stage");
                    self.note("liquidity stage retained nothing".into());
                    break;
                }
                liquid
            } else {
                watchlist.clone()
            };
            if input.is_empty() || self.stopping() {
                break;
            }

            let cap = schedule.cap_for_iteration(i, max_output);
            let range = self.snapshot_range();
            let (result, shortlist) = self.funnel.stage3_within(&input, range, cap);
            self.audit.lock().unwrap().record_stage(i, result);
            if shortlist.is_empty() {
                warn!(iteration = i, kept = watchlist.len(), "snapshot retained nothing, keeping previous watchlist");
            } else {
                watchlist = shortlist;
            }
            info!(iteration = i, cap, watchlist = watchlist.len(), "snapshot iteration complete");
        }
        Ok(Some(watchlist))
    }

    /// Single funnel pass for a session started after the snapshot offset.
    fn late_watchlist(&self) -> Vec<Candidate> {
        let report = self.funnel.run();
        {
            let mut audit = self.audit.lock().unwrap();
            for stage in &report.stages {
                audit.record_stage(0, stage.clone());
            }
        }
        let mut watchlist = report.outcome.candidates().to_vec();
        watchlist.truncate(self.config.session.target_watchlist);
        watchlist
    }

    fn refine(&self, watchlist: &[Candidate]) -> RefinerReport {
        let report = self.refiner.refine(watchlist, self.tracked.as_ref());
        info!(
            ranked = report.ranked.len(),
            failed = report.failed.len(),
            synthetic = report.synthetic_count,
            head = report.head().len(),
            "watchlist refined"
        );
        self.audit.lock().unwrap().refiner = Some(report.clone());
        report
    }

    fn fire_control(&self, watchlist: &[Candidate], report: &RefinerReport) -> Result<(), EngineError> {
        let _guard = self.lifecycle.lock().unwrap();
        if self.stopping() {
            return Ok(());
        }
        self.advance(SessionPhase::FireControl)?;

        let factory = Arc::clone(&self.executor);
        let executor = self.connection.get_or_init(
            || {
                let executor = factory();
                executor.connect().map_err(|e| e.to_string())?;
                Ok(executor)
            },
            self.config.connection.wait_timeout(),
        )?;
        info!(executor = executor.name(), "executor connected");

        let Some(scorer) = self.scorer.lock().unwrap().take() else {
            warn!("scoring engine already consumed, fire control not armed");
            return Ok(());
        };
        let fire = Arc::new(FireControl::new(
            scorer,
            Arc::clone(&self.gatekeeper),
            Arc::clone(&self.connection),
            Arc::clone(&self.log),
            &self.config.scoring,
            watchlist,
            report,
        ));
        let handler = Arc::clone(&fire);
        self.bus
            .subscribe(TICK_TOPIC, Arc::new(move |event: &TickEvent| handler.on_tick(event)));
        *self.fire.lock().unwrap() = Some(fire);
        self.bus.start()?;

        let head = report.head_ids();
        if head.is_empty() {
            warn!("refiner head is empty, no feeds subscribed");
            self.note("fire control armed with an empty head".into());
            return Ok(());
        }
        let bus = Arc::clone(&self.bus);
        let sink: TickSink = Arc::new(move |event: TickEvent| {
            bus.publish(TICK_TOPIC, event);
        });
        match self.source.subscribe_ticks(&head, sink) {
            Ok(()) => {
                info!(instruments = head.len(), "tick feeds subscribed");
                *self.subscribed.lock().unwrap() = head;
            }
            Err(err) => {
                warn!(error = %err, "tick subscription failed, fire control has no feed");
                self.note(format!("subscription failed: {err}"));
            }
        }
        Ok(())
    }

    /// Unsubscribe, stop the bus, release the executor. Each step runs even
    /// if an earlier one failed. Runs once.
    fn teardown(&self) {
        let _guard = self.lifecycle.lock().unwrap();
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribed = std::mem::take(&mut *self.subscribed.lock().unwrap());
        if !subscribed.is_empty() {
            match self.source.unsubscribe(&subscribed) {
                Ok(()) => info!(instruments = subscribed.len(), "tick feeds unsubscribed"),
                Err(err) => warn!(error = %err, "unsubscribe failed"),
            }
        }
        if let Err(err) = self.bus.stop() {
            warn!(error = %err, "bus stop failed");
        }
        self.bus.unsubscribe(TICK_TOPIC);
        self.audit.lock().unwrap().bus = Some(self.bus.stats());
        if let Some(executor) = self.connection.release() {
            match executor.disconnect() {
                Ok(()) => info!(executor = executor.name(), "executor disconnected"),
                Err(err) => warn!(error = %err, "executor disconnect failed"),
            }
        }
    }
}
