//! Provider boundary.
//!
//! Every provider call made by the funnel and the refiner goes through
//! [`GuardedSource`], which converts any provider error (and an empty answer
//! where data is mandatory) into [`DataUnavailable`] and feeds the circuit
//! breaker.

use tracing::warn;

use super::circuit_breaker::CircuitBreaker;
use super::provider::{Capability, DataError, DataUnavailable, QuoteSource};
use crate::domain::{Bar, Granularity, Instrument, InstrumentId, Tick, TimeRange};

/// Quote source behind a circuit breaker with errors normalized.
pub struct GuardedSource<'a> {
    source: &'a dyn QuoteSource,
    breaker: &'a CircuitBreaker,
}

impl<'a> GuardedSource<'a> {
    pub fn new(source: &'a dyn QuoteSource, breaker: &'a CircuitBreaker) -> Self {
        Self { source, breaker }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Static reference universe. An empty universe counts as unavailable.
    pub fn static_reference(&self) -> Result<Vec<Instrument>, DataUnavailable> {
        let instruments = self.call(Capability::StaticReference, None, || {
            self.source.static_reference()
        })?;
        if instruments.is_empty() {
            return Err(DataUnavailable {
                capability: Capability::StaticReference,
                instrument: None,
                reason: "provider returned an empty universe".into(),
            });
        }
        Ok(instruments)
    }

    /// Daily bars. An empty answer is passed through: zero-bar instruments
    /// are a legitimate exclusion, not a provider failure.
    pub fn daily_bars(
        &self,
        instrument: &InstrumentId,
        window: usize,
    ) -> Result<Vec<Bar>, DataUnavailable> {
        self.call(Capability::DailyBars, Some(instrument), || {
            self.source.daily_bars(instrument, window)
        })
    }

    pub fn intraday_bars(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<Bar>, DataUnavailable> {
        self.call(Capability::IntradayBars, Some(instrument), || {
            self.source.intraday_bars(instrument, range, granularity)
        })
    }

    /// Tick window. An empty window counts as unavailable so the refiner
    /// falls back to the synthetic series.
    pub fn tick_window(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
    ) -> Result<Vec<Tick>, DataUnavailable> {
        let ticks = self.call(Capability::TickWindow, Some(instrument), || {
            self.source.tick_window(instrument, range)
        })?;
        if ticks.is_empty() {
            return Err(DataUnavailable {
                capability: Capability::TickWindow,
                instrument: Some(instrument.clone()),
                reason: "no ticks in window".into(),
            });
        }
        Ok(ticks)
    }

    fn call<T>(
        &self,
        capability: Capability,
        instrument: Option<&InstrumentId>,
        f: impl FnOnce() -> Result<T, DataError>,
    ) -> Result<T, DataUnavailable> {
        if !self.breaker.is_allowed() {
            return Err(DataUnavailable {
                capability,
                instrument: instrument.cloned(),
                reason: "circuit breaker open".into(),
            });
        }
        match f() {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                if self.breaker.record_failure() {
                    warn!(
                        source = self.source.name(),
                        %capability,
                        trips = self.breaker.trips(),
                        "provider circuit breaker tripped"
                    );
                }
                Err(DataUnavailable {
                    capability,
                    instrument: instrument.cloned(),
                    reason: err.to_string(),
                })
            }
        }
    }
}
