//! Quote source traits and structured error types.
//!
//! A quote source is split into three capabilities (reference data, history,
//! live ticks) so a provider that only offers history can still be mocked
//! or wrapped without faking a tick feed. `QuoteSource` bundles all three.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Bar, Granularity, Instrument, InstrumentId, Tick, TickEvent, TimeRange};

/// Errors a provider may return. Never leaves the provider boundary: the
/// guarded source converts every variant to [`DataUnavailable`].
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider has no {what}")]
    Empty { what: String },

    #[error("instrument not found: {instrument}")]
    NotFound { instrument: InstrumentId },

    #[error("provider timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("subscription rejected: {0}")]
    Subscription(String),

    #[error("data error: {0}")]
    Other(String),
}

/// Which provider capability a call used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    StaticReference,
    DailyBars,
    IntradayBars,
    TickWindow,
    Subscription,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StaticReference => "static reference",
            Self::DailyBars => "daily bars",
            Self::IntradayBars => "intraday bars",
            Self::TickWindow => "tick window",
            Self::Subscription => "tick subscription",
        };
        f.write_str(s)
    }
}

/// A provider call could not deliver data.
///
/// Triggers the synthetic fallback; never a hard pipeline failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{capability} unavailable{}: {reason}", for_instrument(.instrument))]
pub struct DataUnavailable {
    pub capability: Capability,
    pub instrument: Option<InstrumentId>,
    pub reason: String,
}

fn for_instrument(instrument: &Option<InstrumentId>) -> String {
    instrument
        .as_ref()
        .map(|i| format!(" for {i}"))
        .unwrap_or_default()
}

/// Callback receiving live ticks for subscribed instruments.
pub type TickSink = Arc<dyn Fn(TickEvent) + Send + Sync>;

/// Reference data capability.
pub trait ReferenceSource: Send + Sync {
    /// Full static reference universe for today.
    fn static_reference(&self) -> Result<Vec<Instrument>, DataError>;
}

/// Historical bar and tick capability.
pub trait HistorySource: Send + Sync {
    /// Trailing `window` daily bars, oldest first.
    fn daily_bars(&self, instrument: &InstrumentId, window: usize) -> Result<Vec<Bar>, DataError>;

    /// Intraday bars for today's session within `range`.
    fn intraday_bars(
        &self,
        instrument: &InstrumentId,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<Bar>, DataError>;

    /// Trade prints for today's session within `range`, in time order.
    fn tick_window(&self, instrument: &InstrumentId, range: TimeRange)
        -> Result<Vec<Tick>, DataError>;
}

/// Live tick capability.
pub trait TickFeed: Send + Sync {
    /// Start delivering ticks for `instruments` to `sink`.
    fn subscribe_ticks(&self, instruments: &[InstrumentId], sink: TickSink)
        -> Result<(), DataError>;

    /// Stop delivering ticks for `instruments`. Unknown ids are ignored.
    fn unsubscribe(&self, instruments: &[InstrumentId]) -> Result<(), DataError>;
}

/// A complete quote source: reference data, history, and live ticks.
pub trait QuoteSource: ReferenceSource + HistorySource + TickFeed {
    /// Human-readable name of this source.
    fn name(&self) -> &str;
}
