//! Order execution boundary.
//!
//! Only approved signals reach an executor, and the signal moves into
//! [`OrderExecutor::submit`]: it cannot be submitted twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use sieve_core::domain::{InstrumentId, SignalId, TradeSignal};
use sieve_core::gatekeeper::{GatekeeperDecision, Verdict};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("executor is not connected")]
    NotConnected,

    #[error("signal {signal} was not approved (verdict {verdict})")]
    NotApproved { signal: SignalId, verdict: Verdict },

    #[error("decision {decision} does not belong to signal {signal}")]
    DecisionMismatch { signal: SignalId, decision: SignalId },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("order rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub signal_id: SignalId,
    pub instrument: InstrumentId,
    pub accepted: bool,
    pub order_ref: Option<String>,
    pub price: f64,
    pub message: String,
}

/// Broker-facing executor.
pub trait OrderExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self) -> Result<(), ExecutionError>;

    fn disconnect(&self) -> Result<(), ExecutionError>;

    fn submit(
        &self,
        signal: TradeSignal,
        decision: &GatekeeperDecision,
    ) -> Result<ExecutionResult, ExecutionError>;
}

/// Builds the session's executor. Called at most once per connection.
pub type ExecutorFactory = Arc<dyn Fn() -> Arc<dyn OrderExecutor> + Send + Sync>;

/// Reject a submission that does not carry its own approved decision.
pub fn check_submission(
    signal: &TradeSignal,
    decision: &GatekeeperDecision,
) -> Result<(), ExecutionError> {
    if decision.signal_id != signal.id {
        return Err(ExecutionError::DecisionMismatch {
            signal: signal.id,
            decision: decision.signal_id,
        });
    }
    if !decision.is_approved() {
        return Err(ExecutionError::NotApproved {
            signal: signal.id,
            verdict: decision.verdict,
        });
    }
    Ok(())
}

/// Paper executor: fills every approved signal at the trigger price.
#[derive(Default)]
pub struct PaperExecutor {
    connected: AtomicBool,
    next_ref: AtomicU64,
    fills: Mutex<Vec<ExecutionResult>>,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn fills(&self) -> Vec<ExecutionResult> {
        self.fills.lock().unwrap().clone()
    }
}

impl OrderExecutor for PaperExecutor {
    fn name(&self) -> &str {
        "paper"
    }

    fn connect(&self) -> Result<(), ExecutionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ExecutionError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn submit(
        &self,
        signal: TradeSignal,
        decision: &GatekeeperDecision,
    ) -> Result<ExecutionResult, ExecutionError> {
        if !self.is_connected() {
            return Err(ExecutionError::NotConnected);
        }
        check_submission(&signal, decision)?;
        let order_ref = format!("paper-{}", self.next_ref.fetch_add(1, Ordering::SeqCst) + 1);
        let result = ExecutionResult {
            signal_id: signal.id,
            instrument: signal.instrument,
            accepted: true,
            order_ref: Some(order_ref),
            price: signal.trigger.price,
            message: format!("filled ({})", decision.tag),
        };
        info!(
            signal = %result.signal_id,
            instrument = %result.instrument,
            price = result.price,
            "paper fill"
        );
        self.fills.lock().unwrap().push(result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sieve_core::domain::{TickEvent, TradeSide};
    use sieve_core::gatekeeper::DecisionTag;

    fn signal(id: u64) -> TradeSignal {
        let at = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(10, 5, 0)
            .unwrap();
        TradeSignal {
            id: SignalId(id),
            instrument: "600000".into(),
            score: 0.8,
            timestamp: at,
            trigger: TickEvent {
                instrument: "600000".into(),
                price: 10.4,
                volume: 500,
                notional: 0.52,
                side: TradeSide::Buy,
                open: 10.0,
                high: 10.4,
                low: 9.9,
                reference_close: 10.0,
                ingested_at: at,
            },
            sector: Some("Banks".into()),
            labels: vec![],
            net_inflow: 40.0,
            inflow_ratio: 0.2,
            risk_score: 0.1,
        }
    }

    fn decision(id: u64, verdict: Verdict) -> GatekeeperDecision {
        let s = signal(id);
        GatekeeperDecision {
            signal_id: s.id,
            instrument: s.instrument,
            score: s.score,
            verdict,
            tag: DecisionTag::SweetSpot,
            evaluations: vec![],
            decided_at: s.timestamp,
        }
    }

    #[test]
    fn fills_approved_signal_at_trigger_price() {
        let exec = PaperExecutor::new();
        exec.connect().unwrap();
        let result = exec.submit(signal(1), &decision(1, Verdict::Approve)).unwrap();
        assert!(result.accepted);
        assert_eq!(result.price, 10.4);
        assert_eq!(result.order_ref.as_deref(), Some("paper-1"));
        assert_eq!(exec.fills().len(), 1);
    }

    #[test]
    fn rejects_when_disconnected() {
        let exec = PaperExecutor::new();
        let err = exec.submit(signal(1), &decision(1, Verdict::Approve)).unwrap_err();
        assert_eq!(err, ExecutionError::NotConnected);
    }

    #[test]
    fn rejects_unapproved_or_mismatched_decision() {
        let exec = PaperExecutor::new();
        exec.connect().unwrap();
        assert!(matches!(
            exec.submit(signal(1), &decision(1, Verdict::DowngradeToWatch)),
            Err(ExecutionError::NotApproved { .. })
        ));
        assert!(matches!(
            exec.submit(signal(1), &decision(2, Verdict::Approve)),
            Err(ExecutionError::DecisionMismatch { .. })
        ));
        assert!(exec.fills().is_empty());
    }
}
