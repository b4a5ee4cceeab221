//! In-memory quote source.
//!
//! Backs tests and the CLI's offline mode. Each capability can be made to fail
//! on demand, and subscribed ticks are pushed with [`MemorySource::push`].

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::provider::{
    Capability, DataError, HistorySource, QuoteSource, ReferenceSource, TickFeed, TickSink,
};
use crate::domain::{Bar, Granularity, Instrument, InstrumentId, Tick, TickEvent, TimeRange};

/// In-memory quote source with per-capability failure injection.
#[derive(Default)]
pub struct MemorySource {
    name: String,
    reference: Option<Vec<Instrument>>,
    daily: HashMap<InstrumentId, Vec<Bar>>,
    intraday: HashMap<InstrumentId, Vec<Bar>>,
    ticks: HashMap<InstrumentId, Vec<Tick>>,
    failing: HashSet<Capability>,
    subscriptions: Mutex<HashMap<InstrumentId, TickSink>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A source with no data at all: every history call fails.
    pub fn empty() -> Self {
        Self::new("empty")
    }

    pub fn with_reference(mut self, instruments: Vec<Instrument>) -> Self {
        self.reference = Some(instruments);
        self
    }

    pub fn with_daily_bars(mut self, instrument: InstrumentId, bars: Vec<Bar>) -> Self {
        self.daily.insert(instrument, bars);
        self
    }

    pub fn with_intraday_bars(mut self, instrument: InstrumentId, bars: Vec<Bar>) -> Self {
        self.intraday.insert(instrument, bars);
        self
    }

    pub fn with_ticks(mut self, instrument: InstrumentId, ticks: Vec<Tick>) -> Self {
        self.ticks.insert(instrument, ticks);
        self
    }

    /// Make every call of `capability` fail with a provider error.
    pub fn failing(mut self, capability: Capability) -> Self {
        self.failing.insert(capability);
        self
    }

    /// Deliver a live tick to its subscriber. Returns false when the
    /// instrument is not subscribed.
    pub fn push(&self, event: TickEvent) -> bool {
        let sink = self
            .subscriptions
            .lock()
            .unwrap()
            .get(&event.instrument)
            .cloned();
        match sink {
            Some(sink) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    pub fn subscribed(&self) -> Vec<InstrumentId> {
        let mut ids: Vec<InstrumentId> =
            self.subscriptions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn check(&self, capability: Capability) -> Result<(), DataError> {
        if self.failing.contains(&capability) {
            return Err(DataError::NetworkUnreachable(format!(
                "{} ({capability}) injected failure",
                self.name
            )));
        }
        Ok(())
    }
}

impl ReferenceSource for MemorySource {
    fn static_reference(&self) -> Result<Vec<Instrument>, DataError> {
        self.check(Capability::StaticReference)?;
        self.reference.clone().ok_or_else(|| DataError::Empty {
            what: "reference data".into(),
        })
    }
}

impl HistorySource for MemorySource {
    fn daily_bars(&self, instrument: &InstrumentId, window: usize) -> Result<Vec<Bar>, DataError> {
        self.check(Capability::DailyBars)?;
        let bars = self.daily.get(instrument).ok_or_else(|| DataError::NotFound {
            instrument: instrument.clone(),
        })?;
        let skip = bars.len().saturating_sub(window);
        Ok(bars[skip..].to_vec())
    }

    fn intraday_bars(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
        _granularity: Granularity,
    ) -> Result<Vec<Bar>, DataError> {
        self.check(Capability::IntradayBars)?;
        let bars = self.intraday.get(instrument).ok_or_else(|| DataError::NotFound {
            instrument: instrument.clone(),
        })?;
        Ok(bars
            .iter()
            .filter(|b| range.contains(b.timestamp.time()))
            .cloned()
            .collect())
    }

    fn tick_window(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
    ) -> Result<Vec<Tick>, DataError> {
        self.check(Capability::TickWindow)?;
        let ticks = self.ticks.get(instrument).ok_or_else(|| DataError::NotFound {
            instrument: instrument.clone(),
        })?;
        Ok(ticks
            .iter()
            .filter(|t| range.contains(t.timestamp.time()))
            .cloned()
            .collect())
    }
}

impl TickFeed for MemorySource {
    fn subscribe_ticks(
        &self,
        instruments: &[InstrumentId],
        sink: TickSink,
    ) -> Result<(), DataError> {
        self.check(Capability::Subscription)?;
        let mut subs = self.subscriptions.lock().unwrap();
        for id in instruments {
            subs.insert(id.clone(), sink.clone());
        }
        Ok(())
    }

    fn unsubscribe(&self, instruments: &[InstrumentId]) -> Result<(), DataError> {
        let mut subs = self.subscriptions.lock().unwrap();
        for id in instruments {
            subs.remove(id);
        }
        Ok(())
    }
}

impl QuoteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }
}
