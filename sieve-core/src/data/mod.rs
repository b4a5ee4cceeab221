//! Quote source boundary, synthetic fallback, and in-memory source.

pub mod circuit_breaker;
pub mod guard;
pub mod memory;
pub mod provider;
pub mod synthetic;

pub use circuit_breaker::CircuitBreaker;
pub use guard::GuardedSource;
pub use memory::MemorySource;
pub use provider::{
    Capability, DataError, DataUnavailable, HistorySource, QuoteSource, ReferenceSource,
    TickFeed, TickSink,
};
pub use synthetic::{SyntheticError, TickProfile};
