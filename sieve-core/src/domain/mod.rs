//! Domain types: instruments, bars, ticks, signals.

pub mod bar;
pub mod ids;
pub mod instrument;
pub mod signal;
pub mod tick;

pub use bar::{average_true_range, Bar, Granularity};
pub use ids::{InstrumentId, SessionId, SignalId};
pub use instrument::{ClassificationFlags, FlagCategory, Instrument, ListingStatus, Venue};
pub use signal::{SituationLabel, TradeSignal};
pub use tick::{Tick, TickEvent, TimeRange, TradeSide};
