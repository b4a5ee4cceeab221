//! Sieve Runner — the live session around `sieve-core`.
//!
//! This crate builds on `sieve-core` to provide:
//! - Bounded event bus with isolated handlers and throughput reporting
//! - Orchestration engine driving the session phase machine
//! - Shared once-initialized executor connection
//! - Momentum scoring and paper execution for fire control
//! - Decision log (in memory plus JSONL mirror) and session audit
//! - Replayed tick feed, TOML configuration, CSV/JSON export

pub mod audit;
pub mod bus;
pub mod config;
pub mod connection;
pub mod engine;
pub mod executor;
pub mod export;
pub mod replay;
pub mod scoring;

pub use audit::{read_decisions, AuditError, DecisionLog, PhaseTransition, SessionAudit};
pub use bus::{BusConfig, BusError, BusStats, EventBus, Handler, HandlerError};
pub use config::{SieveConfig, SieveConfigError};
pub use connection::{ConnectionConfig, ConnectionError, SharedConnection};
pub use engine::{
    EngineError, EngineParts, FireControl, FireStats, LocalClock, OrchestrationEngine,
    SessionClock, SessionConfig, SessionPhase, ShiftedClock, TICK_TOPIC,
};
pub use executor::{
    ExecutionError, ExecutionResult, ExecutorFactory, OrderExecutor, PaperExecutor,
};
pub use export::{export_audit_json, export_exclusions_csv, export_ranking_csv, write_ranking_csv};
pub use replay::{ReplaySettings, ReplaySource};
pub use scoring::{MomentumScorer, ScoreReading, ScoringConfig, ScoringEngine};

#[cfg(test)]
mod send_sync_checks {
    use super::*;
    use sieve_core::domain::TickEvent;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn event_bus_is_send_sync() {
        assert_send::<EventBus<TickEvent>>();
        assert_sync::<EventBus<TickEvent>>();
    }

    #[test]
    fn shared_connection_is_send_sync() {
        assert_send::<SharedConnection<dyn OrderExecutor>>();
        assert_sync::<SharedConnection<dyn OrderExecutor>>();
    }

    #[test]
    fn decision_log_is_send_sync() {
        assert_send::<DecisionLog>();
        assert_sync::<DecisionLog>();
    }

    #[test]
    fn fire_control_is_send_sync() {
        assert_send::<FireControl>();
        assert_sync::<FireControl>();
    }

    #[test]
    fn engine_is_send_sync() {
        assert_send::<OrchestrationEngine>();
        assert_sync::<OrchestrationEngine>();
    }

    #[test]
    fn replay_source_is_send_sync() {
        assert_send::<ReplaySource>();
        assert_sync::<ReplaySource>();
    }

    #[test]
    fn config_is_send_sync() {
        assert_send::<SieveConfig>();
        assert_sync::<SieveConfig>();
    }
}
