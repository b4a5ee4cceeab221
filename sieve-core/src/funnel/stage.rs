//! Stage results, exclusion reasons, and per-instrument tracing.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::Capability;
use crate::domain::{FlagCategory, InstrumentId};

/// Funnel stage identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
    StaticAttributes,
    Liquidity,
    VolumeRatio,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [
        StageKind::StaticAttributes,
        StageKind::Liquidity,
        StageKind::VolumeRatio,
    ];

    pub fn ordinal(&self) -> u8 {
        match self {
            Self::StaticAttributes => 1,
            Self::Liquidity => 2,
            Self::VolumeRatio => 3,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StaticAttributes => "stage1_static",
            Self::Liquidity => "stage2_liquidity",
            Self::VolumeRatio => "stage3_volume_ratio",
        };
        f.write_str(s)
    }
}

/// Why an instrument left the funnel. A threshold miss is a legitimate
/// exclusion, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    /// A static classification flag is set.
    Flagged { category: FlagCategory },
    /// The provider returned zero daily bars.
    NoDailyBars,
    /// Mean daily notional below the liquidity floor.
    BelowLiquidityFloor { mean_notional: f64, floor: f64 },
    /// Zero intraday bars in the morning window.
    NoIntradayBars,
    /// No usable volume baseline from stage 2.
    NoBaseline,
    /// Early-session volume ratio below the floor.
    BelowVolumeRatio { ratio: f64, floor: f64 },
    /// Qualified but ranked past the output cap.
    OverOutputCap { rank: usize, cap: usize },
    /// Provider failed and the synthetic fallback is disabled or failed.
    DataUnavailable { capability: Capability, detail: String },
}

impl ExclusionReason {
    /// Stable short code used as a diagnostics counter key.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Flagged { category } => match category {
                FlagCategory::SpecialTreatment => "flag_special_treatment",
                FlagCategory::Delisted => "flag_delisted",
                FlagCategory::Suspended => "flag_suspended",
                FlagCategory::RestrictedVenue => "flag_restricted_venue",
            },
            Self::NoDailyBars => "zero_daily_bars",
            Self::BelowLiquidityFloor { .. } => "below_liquidity_floor",
            Self::NoIntradayBars => "zero_intraday_bars",
            Self::NoBaseline => "no_baseline",
            Self::BelowVolumeRatio { .. } => "below_volume_ratio",
            Self::OverOutputCap { .. } => "over_output_cap",
            Self::DataUnavailable { .. } => "data_unavailable",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flagged { category } => write!(f, "flagged {}", category.as_str()),
            Self::NoDailyBars => write!(f, "no daily bars"),
            Self::BelowLiquidityFloor {
                mean_notional,
                floor,
            } => write!(f, "mean daily notional {mean_notional:.1} < floor {floor:.1}"),
            Self::NoIntradayBars => write!(f, "no intraday bars"),
            Self::NoBaseline => write!(f, "no volume baseline"),
            Self::BelowVolumeRatio { ratio, floor } => {
                write!(f, "volume ratio {ratio:.2} < floor {floor:.2}")
            }
            Self::OverOutputCap { rank, cap } => write!(f, "rank {rank} beyond cap {cap}"),
            Self::DataUnavailable { capability, detail } => {
                write!(f, "{capability} unavailable: {detail}")
            }
        }
    }
}

/// An excluded instrument and its reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub instrument: InstrumentId,
    pub reason: ExclusionReason,
}

/// Counts and flags describing how a stage ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Any input was replaced by synthetic data.
    pub synthetic_mode: bool,
    /// Instruments (or datasets) served from the synthetic fallback.
    pub synthetic_substitutions: usize,
    /// Provider calls that came back unavailable.
    pub provider_unavailable: usize,
    /// First unavailable reason seen, for the log.
    pub first_unavailable: Option<String>,
    /// Per flag category, how many instruments lacked the category.
    pub data_gaps: BTreeMap<FlagCategory, usize>,
    /// Exclusion counts keyed by [`ExclusionReason::code`].
    pub exclusion_counts: BTreeMap<String, usize>,
    pub notes: Vec<String>,
}

impl StageDiagnostics {
    pub fn record_unavailable(&mut self, reason: impl fmt::Display) {
        self.provider_unavailable += 1;
        if self.first_unavailable.is_none() {
            self.first_unavailable = Some(reason.to_string());
        }
    }

    pub fn record_substitution(&mut self) {
        self.synthetic_mode = true;
        self.synthetic_substitutions += 1;
    }
}

/// Output of one funnel stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStageResult {
    pub stage: StageKind,
    pub input_count: usize,
    pub output_count: usize,
    pub filtered_count: usize,
    /// Retained instruments, in stage output order.
    pub retained: Vec<InstrumentId>,
    pub excluded: Vec<Exclusion>,
    pub elapsed_ms: u64,
    pub diagnostics: StageDiagnostics,
}

impl FilterStageResult {
    /// `input_count == output_count + filtered_count`.
    pub fn counts_balance(&self) -> bool {
        self.input_count == self.output_count + self.filtered_count
            && self.output_count == self.retained.len()
            && self.filtered_count == self.excluded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.retained.is_empty()
    }

    pub fn position_of(&self, id: &InstrumentId) -> Option<usize> {
        self.retained.iter().position(|r| r == id)
    }

    pub fn reason_for(&self, id: &InstrumentId) -> Option<&ExclusionReason> {
        self.excluded
            .iter()
            .find(|e| &e.instrument == id)
            .map(|e| &e.reason)
    }

    /// Count of exclusions with the given reason code.
    pub fn excluded_with(&self, code: &str) -> usize {
        self.diagnostics
            .exclusion_counts
            .get(code)
            .copied()
            .unwrap_or(0)
    }
}

/// Collects one stage's decisions; `finish` stamps counts and elapsed time.
pub(crate) struct StageRecorder {
    stage: StageKind,
    started: Instant,
    input: Vec<InstrumentId>,
    retained: Vec<InstrumentId>,
    excluded: Vec<Exclusion>,
    pub(crate) diagnostics: StageDiagnostics,
}

impl StageRecorder {
    pub(crate) fn new(stage: StageKind, input: Vec<InstrumentId>) -> Self {
        Self {
            stage,
            started: Instant::now(),
            retained: Vec::with_capacity(input.len()),
            excluded: Vec::new(),
            input,
            diagnostics: StageDiagnostics::default(),
        }
    }

    pub(crate) fn retain(&mut self, id: InstrumentId) {
        self.retained.push(id);
    }

    pub(crate) fn exclude(&mut self, id: InstrumentId, reason: ExclusionReason) {
        *self
            .diagnostics
            .exclusion_counts
            .entry(reason.code().to_string())
            .or_insert(0) += 1;
        self.excluded.push(Exclusion {
            instrument: id,
            reason,
        });
    }

    pub(crate) fn finish(self) -> FilterStageResult {
        let elapsed: Duration = self.started.elapsed();
        debug_assert!(
            {
                let input: HashSet<&InstrumentId> = self.input.iter().collect();
                self.retained.iter().all(|id| input.contains(id))
            },
            "stage output must be a subset of its input"
        );
        debug_assert_eq!(
            self.input.len(),
            self.retained.len() + self.excluded.len(),
            "every input instrument is either retained or excluded"
        );

        let result = FilterStageResult {
            stage: self.stage,
            input_count: self.input.len(),
            output_count: self.retained.len(),
            filtered_count: self.excluded.len(),
            retained: self.retained,
            excluded: self.excluded,
            elapsed_ms: elapsed.as_millis() as u64,
            diagnostics: self.diagnostics,
        };
        info!(
            stage = %result.stage,
            input = result.input_count,
            output = result.output_count,
            filtered = result.filtered_count,
            elapsed_ms = result.elapsed_ms,
            synthetic = result.diagnostics.synthetic_mode,
            "funnel stage complete"
        );
        result
    }
}

/// Where one instrument stood after a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceStatus {
    /// Retained at this output position (0-based).
    Retained { position: usize },
    Excluded { reason: ExclusionReason },
    /// Earlier stage excluded it, or the funnel short-circuited.
    NotReached,
    /// Not part of the universe at all.
    NotInUniverse,
}

/// Path of one instrument through the funnel, for "why wasn't X selected".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentTrace {
    pub instrument: InstrumentId,
    pub steps: Vec<(StageKind, TraceStatus)>,
}

impl InstrumentTrace {
    /// Reconstruct the path from a sequence of stage results.
    pub fn reconstruct(instrument: &InstrumentId, stages: &[FilterStageResult]) -> Self {
        let mut steps = Vec::with_capacity(StageKind::ALL.len());
        let mut still_in = true;
        for kind in StageKind::ALL {
            let status = match stages.iter().find(|s| s.stage == kind) {
                Some(_) if !still_in => TraceStatus::NotReached,
                None => {
                    still_in = false;
                    TraceStatus::NotReached
                }
                Some(stage) => {
                    if let Some(position) = stage.position_of(instrument) {
                        TraceStatus::Retained { position }
                    } else if let Some(reason) = stage.reason_for(instrument) {
                        still_in = false;
                        TraceStatus::Excluded {
                            reason: reason.clone(),
                        }
                    } else {
                        still_in = false;
                        if kind == StageKind::StaticAttributes {
                            TraceStatus::NotInUniverse
                        } else {
                            TraceStatus::NotReached
                        }
                    }
                }
            };
            steps.push((kind, status));
        }
        Self {
            instrument: instrument.clone(),
            steps,
        }
    }

    /// True if the instrument survived every stage.
    pub fn survived(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, s)| matches!(s, TraceStatus::Retained { .. }))
    }

    /// The stage and reason that removed the instrument, if any.
    pub fn exclusion(&self) -> Option<(StageKind, &ExclusionReason)> {
        self.steps.iter().find_map(|(kind, status)| match status {
            TraceStatus::Excluded { reason } => Some((*kind, reason)),
            _ => None,
        })
    }
}
