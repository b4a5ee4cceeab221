//! Replayed tick feed over any quote source.
//!
//! [`ReplaySource`] delegates reference data and history to an inner source
//! and serves subscriptions itself: subscribed instruments get a seeded
//! synthetic tick stream from the subscription time to the configured end,
//! paced by the session clock on a background thread.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{NaiveDate, NaiveTime, Timelike};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use sieve_core::data::synthetic::{synthetic_daily_bars, synthetic_live_ticks};
use sieve_core::data::{
    DataError, HistorySource, QuoteSource, ReferenceSource, TickFeed, TickProfile, TickSink,
};
use sieve_core::domain::{
    Bar, Granularity, Instrument, InstrumentId, Tick, TickEvent, TimeRange, TradeSide,
};
use sieve_core::rng::SeedHierarchy;

use crate::engine::SessionClock;

#[derive(Debug, Clone, Copy)]
pub struct ReplaySettings {
    /// Replay stops at this session time.
    pub until: NaiveTime,
    pub profile: TickProfile,
    /// Daily window used to derive a synthetic reference close.
    pub daily_window: usize,
}

struct Feed {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ReplaySource {
    inner: Arc<dyn QuoteSource>,
    seeds: SeedHierarchy,
    trading_date: NaiveDate,
    clock: Arc<dyn SessionClock>,
    settings: ReplaySettings,
    active: Arc<Mutex<HashSet<InstrumentId>>>,
    feed: Mutex<Option<Feed>>,
    emitted: Arc<AtomicU64>,
    name: String,
}

impl ReplaySource {
    pub fn new(
        inner: Arc<dyn QuoteSource>,
        seeds: SeedHierarchy,
        trading_date: NaiveDate,
        clock: Arc<dyn SessionClock>,
        settings: ReplaySettings,
    ) -> Self {
        let name = format!("replay({})", inner.name());
        Self {
            inner,
            seeds,
            trading_date,
            clock,
            settings,
            active: Arc::new(Mutex::new(HashSet::new())),
            feed: Mutex::new(None),
            emitted: Arc::new(AtomicU64::new(0)),
            name,
        }
    }

    /// Ticks delivered to the sink so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn is_replaying(&self) -> bool {
        self.feed.lock().unwrap().is_some()
    }

    fn reference_close(&self, id: &InstrumentId) -> Option<f64> {
        let window = self.settings.daily_window.max(1);
        let bars = match self.inner.daily_bars(id, window) {
            Ok(bars) if !bars.is_empty() => bars,
            _ => synthetic_daily_bars(&self.seeds, id, self.trading_date, window),
        };
        bars.last().map(|b| b.close)
    }

    /// Merged, time-ordered replay tape for `instruments` from `start`.
    fn tape(
        &self,
        instruments: &[InstrumentId],
        start: NaiveTime,
    ) -> (Vec<(InstrumentId, Tick)>, HashMap<InstrumentId, f64>) {
        let range = TimeRange::new(start, self.settings.until);
        let mut tape = Vec::new();
        let mut closes = HashMap::new();
        for id in instruments {
            let Some(close) = self.reference_close(id) else {
                warn!(instrument = %id, "no reference close, not replayed");
                continue;
            };
            match synthetic_live_ticks(
                &self.seeds,
                id,
                self.trading_date,
                range,
                close,
                self.settings.profile,
            ) {
                Ok(ticks) => {
                    closes.insert(id.clone(), close);
                    tape.extend(ticks.into_iter().map(|t| (id.clone(), t)));
                }
                Err(err) => warn!(instrument = %id, error = %err, "replay tape unavailable"),
            }
        }
        tape.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then_with(|| a.0.cmp(&b.0)));
        (tape, closes)
    }

    fn stop_feed(&self) {
        let feed = self.feed.lock().unwrap().take();
        if let Some(feed) = feed {
            drop(feed.stop);
            if feed.handle.join().is_err() {
                warn!("replay thread panicked");
            }
            info!(emitted = self.emitted(), "replay stopped");
        }
    }
}

impl Drop for ReplaySource {
    fn drop(&mut self) {
        self.stop_feed();
    }
}

impl ReferenceSource for ReplaySource {
    fn static_reference(&self) -> Result<Vec<Instrument>, DataError> {
        self.inner.static_reference()
    }
}

impl HistorySource for ReplaySource {
    fn daily_bars(&self, instrument: &InstrumentId, window: usize) -> Result<Vec<Bar>, DataError> {
        self.inner.daily_bars(instrument, window)
    }

    fn intraday_bars(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<Bar>, DataError> {
        self.inner.intraday_bars(instrument, range, granularity)
    }

    fn tick_window(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
    ) -> Result<Vec<Tick>, DataError> {
        self.inner.tick_window(instrument, range)
    }
}

impl TickFeed for ReplaySource {
    fn subscribe_ticks(&self, instruments: &[InstrumentId], sink: TickSink) -> Result<(), DataError> {
        let mut feed = self.feed.lock().unwrap();
        if feed.is_some() {
            return Err(DataError::Subscription("replay already running".into()));
        }
        let now = self.clock.now().time();
        let start = now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now);
        if start >= self.settings.until {
            return Err(DataError::Subscription(format!(
                "replay window already over at {now}"
            )));
        }
        let (tape, closes) = self.tape(instruments, start);
        if tape.is_empty() {
            return Err(DataError::Empty {
                what: "replay ticks".into(),
            });
        }
        self.active.lock().unwrap().extend(instruments.iter().cloned());

        let (stop_tx, stop_rx) = bounded(1);
        let pacing = Pacing {
            clock: Arc::clone(&self.clock),
            trading_date: self.trading_date,
            active: Arc::clone(&self.active),
            emitted: Arc::clone(&self.emitted),
        };
        info!(instruments = closes.len(), ticks = tape.len(), %start, "replay starting");
        let handle = thread::Builder::new()
            .name("tick-replay".into())
            .spawn(move || pacing.run(tape, closes, sink, stop_rx))
            .map_err(|e| DataError::Subscription(e.to_string()))?;
        *feed = Some(Feed {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    fn unsubscribe(&self, instruments: &[InstrumentId]) -> Result<(), DataError> {
        let now_empty = {
            let mut active = self.active.lock().unwrap();
            for id in instruments {
                active.remove(id);
            }
            active.is_empty()
        };
        if now_empty {
            self.stop_feed();
        }
        Ok(())
    }
}

impl QuoteSource for ReplaySource {
    fn name(&self) -> &str {
        &self.name
    }
}

struct Pacing {
    clock: Arc<dyn SessionClock>,
    trading_date: NaiveDate,
    active: Arc<Mutex<HashSet<InstrumentId>>>,
    emitted: Arc<AtomicU64>,
}

#[derive(Clone, Copy)]
struct SessionBar {
    open: f64,
    high: f64,
    low: f64,
}

impl Pacing {
    fn run(
        self,
        tape: Vec<(InstrumentId, Tick)>,
        closes: HashMap<InstrumentId, f64>,
        sink: TickSink,
        stop: Receiver<()>,
    ) {
        let mut bars: HashMap<InstrumentId, SessionBar> = HashMap::new();
        let mut last_price: HashMap<InstrumentId, (f64, TradeSide)> = HashMap::new();
        for (id, tick) in tape {
            let wait = self.clock.wall_until(tick.timestamp);
            let stopped = if wait.is_zero() {
                !matches!(stop.try_recv(), Err(crossbeam_channel::TryRecvError::Empty))
            } else {
                select! {
                    recv(stop) -> _ => true,
                    recv(after(wait)) -> _ => false,
                }
            };
            if stopped {
                debug!("replay interrupted");
                return;
            }
            if !self.active.lock().unwrap().contains(&id) {
                continue;
            }

            let bar = bars.entry(id.clone()).or_insert(SessionBar {
                open: tick.price,
                high: tick.price,
                low: tick.price,
            });
            bar.high = bar.high.max(tick.price);
            bar.low = bar.low.min(tick.price);
            let prev = last_price.get(&id).copied();
            let side = tick.resolve_side(prev.map(|p| p.0), prev.map_or(TradeSide::Buy, |p| p.1));
            last_price.insert(id.clone(), (tick.price, side));

            let event = TickEvent {
                reference_close: closes.get(&id).copied().unwrap_or(bar.open),
                instrument: id,
                price: tick.price,
                volume: tick.volume,
                notional: tick.notional,
                side,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                ingested_at: tick.timestamp,
            };
            sink(event);
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
        debug!(date = %self.trading_date, "replay tape exhausted");
    }
}
