//! Session audit surfaces.
//!
//! - [`DecisionLog`]: append-only record of every gatekeeper decision, kept in
//!   memory and optionally mirrored to a JSONL file (one decision per line).
//! - [`SessionAudit`]: phase transitions, every funnel stage result, the
//!   refiner report, and the final bus counters for one session.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use sieve_core::domain::{InstrumentId, SessionId};
use sieve_core::funnel::{FilterStageResult, InstrumentTrace, StageKind};
use sieve_core::gatekeeper::{GatekeeperDecision, Verdict};
use sieve_core::refiner::RefinerReport;

use crate::bus::BusStats;
use crate::engine::SessionPhase;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only gatekeeper decision log.
pub struct DecisionLog {
    entries: Mutex<Vec<GatekeeperDecision>>,
    mirror: Option<PathBuf>,
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl DecisionLog {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            mirror: None,
        }
    }

    /// Also append every decision to `path` as JSONL.
    pub fn with_jsonl(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            mirror: Some(path.into()),
        }
    }

    pub fn mirror_path(&self) -> Option<&Path> {
        self.mirror.as_deref()
    }

    /// Record a decision. The in-memory entry is kept even if the mirror
    /// write fails.
    pub fn append(&self, decision: &GatekeeperDecision) -> Result<(), AuditError> {
        self.entries.lock().unwrap().push(decision.clone());
        if let Some(path) = &self.mirror {
            append_jsonl(path, decision)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<GatekeeperDecision> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count_by_verdict(&self, verdict: Verdict) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.verdict == verdict)
            .count()
    }
}

fn append_jsonl(path: &Path, decision: &GatekeeperDecision) -> Result<(), AuditError> {
    let json = serde_json::to_string(decision)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{json}")?;
    file.flush()?;
    Ok(())
}

/// Read a JSONL decision log. Malformed lines are skipped.
pub fn read_decisions(path: &Path) -> Result<Vec<GatekeeperDecision>, AuditError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = io::BufReader::new(fs::File::open(path)?);
    let mut decisions = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<GatekeeperDecision>(&line) {
            Ok(decision) => decisions.push(decision),
            Err(err) => warn!(line = lineno + 1, error = %err, "skipping malformed decision record"),
        }
    }
    Ok(decisions)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub at: NaiveDateTime,
}

/// One funnel stage run within the session. Snapshot iterations repeat
/// stage 3, so `iteration` distinguishes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub iteration: usize,
    pub result: FilterStageResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAudit {
    pub session: SessionId,
    pub trading_date: NaiveDate,
    pub transitions: Vec<PhaseTransition>,
    pub stages: Vec<StageRecord>,
    pub refiner: Option<RefinerReport>,
    pub bus: Option<BusStats>,
    pub notes: Vec<String>,
}

impl SessionAudit {
    pub fn new(session: SessionId, trading_date: NaiveDate) -> Self {
        Self {
            session,
            trading_date,
            transitions: Vec::new(),
            stages: Vec::new(),
            refiner: None,
            bus: None,
            notes: Vec::new(),
        }
    }

    pub fn record_stage(&mut self, iteration: usize, result: FilterStageResult) {
        self.stages.push(StageRecord { iteration, result });
    }

    /// Latest result for each stage kind, in funnel order.
    pub fn latest_stages(&self) -> Vec<FilterStageResult> {
        StageKind::ALL
            .iter()
            .filter_map(|kind| {
                self.stages
                    .iter()
                    .rev()
                    .find(|r| r.result.stage == *kind)
                    .map(|r| r.result.clone())
            })
            .collect()
    }

    /// Path of one instrument through the latest run of each stage.
    pub fn trace(&self, instrument: &InstrumentId) -> InstrumentTrace {
        InstrumentTrace::reconstruct(instrument, &self.latest_stages())
    }

    pub fn phases(&self) -> Vec<SessionPhase> {
        let mut phases: Vec<SessionPhase> = self.transitions.first().map(|t| t.from).into_iter().collect();
        phases.extend(self.transitions.iter().map(|t| t.to));
        phases
    }
}
