//! Three-stage funnel filter.
//!
//! Stage 1 screens static attributes, stage 2 applies a daily liquidity floor
//! and derives the volume baseline, stage 3 ranks the early-session volume
//! ratio and caps the shortlist. Each stage consumes the previous stage's
//! retained set and records a [`FilterStageResult`]. A stage that retains
//! nothing ends the run with [`FunnelOutcome::NoCandidates`].
//!
//! Provider failures never fail a run: with `synthetic_fallback` enabled the
//! stage substitutes seeded synthetic data and flags the substitution in its
//! diagnostics.

pub mod liquidity;
pub mod stage;
pub mod static_attrs;
pub mod volume_ratio;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{build_pool, require_at_least, require_non_negative, require_positive, ConfigError};
use crate::data::synthetic::synthetic_universe;
use crate::data::{CircuitBreaker, GuardedSource, QuoteSource};
use crate::domain::{Granularity, Instrument, InstrumentId, TimeRange};
use crate::rng::SeedHierarchy;

pub use liquidity::LiquidityProfile;
pub use stage::{
    Exclusion, ExclusionReason, FilterStageResult, InstrumentTrace, StageDiagnostics, StageKind,
    TraceStatus,
};

/// Funnel thresholds and fetch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelConfig {
    /// Trailing daily-bar window for stage 2.
    pub daily_window: usize,
    /// Minimum mean daily notional for stage 2.
    pub liquidity_floor: f64,
    /// Minimum early-session volume ratio for stage 3.
    pub volume_ratio_floor: f64,
    /// Maximum stage-3 output.
    pub max_output: usize,
    /// Morning window scanned by stage 3.
    pub morning_window: TimeRange,
    pub granularity: Granularity,
    /// Length of a full trading session in minutes.
    pub session_minutes: u32,
    /// Size of the synthetic universe when reference data is unavailable.
    pub synthetic_universe_size: usize,
    /// Substitute synthetic data when the provider fails.
    pub synthetic_fallback: bool,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    /// Worker threads for per-instrument fetches.
    pub workers: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            daily_window: 5,
            liquidity_floor: 3_000.0,
            volume_ratio_floor: 3.0,
            max_output: 200,
            morning_window: TimeRange::new(
                NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
            ),
            granularity: Granularity::Minute,
            session_minutes: 240,
            synthetic_universe_size: 5_000,
            synthetic_fallback: true,
            breaker_threshold: 3,
            breaker_cooldown_secs: 60,
            workers: 8,
        }
    }
}

impl FunnelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_at_least("funnel.daily_window", self.daily_window, 1)?;
        require_non_negative("funnel.liquidity_floor", self.liquidity_floor)?;
        require_non_negative("funnel.volume_ratio_floor", self.volume_ratio_floor)?;
        require_at_least("funnel.max_output", self.max_output, 1)?;
        require_at_least("funnel.workers", self.workers, 1)?;
        require_at_least("funnel.breaker_threshold", self.breaker_threshold as usize, 1)?;
        require_positive("funnel.session_minutes", f64::from(self.session_minutes))?;
        if self.morning_window.minutes() < self.granularity.minutes() {
            return Err(ConfigError::EmptyWindow {
                field: "funnel.morning_window",
            });
        }
        Ok(())
    }
}

/// An instrument that survived stage 2, with its baseline and (after stage 3)
/// its volume ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub instrument: Instrument,
    pub profile: LiquidityProfile,
    pub volume_ratio: Option<f64>,
}

impl Candidate {
    pub fn id(&self) -> &InstrumentId {
        &self.instrument.id
    }
}

/// Terminal result of a funnel run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FunnelOutcome {
    /// Ranked stage-3 shortlist.
    Shortlist { candidates: Vec<Candidate> },
    /// A stage retained nothing; later stages did not run.
    NoCandidates { stage: StageKind, reason: String },
}

impl FunnelOutcome {
    pub fn candidates(&self) -> &[Candidate] {
        match self {
            Self::Shortlist { candidates } => candidates,
            Self::NoCandidates { .. } => &[],
        }
    }
}

/// Every stage result of one run plus the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelReport {
    pub stages: Vec<FilterStageResult>,
    pub outcome: FunnelOutcome,
}

impl FunnelReport {
    /// True if any stage substituted synthetic data.
    pub fn synthetic_mode(&self) -> bool {
        self.stages.iter().any(|s| s.diagnostics.synthetic_mode)
    }

    pub fn stage(&self, kind: StageKind) -> Option<&FilterStageResult> {
        self.stages.iter().find(|s| s.stage == kind)
    }

    /// Path of one instrument through the run.
    pub fn trace(&self, instrument: &InstrumentId) -> InstrumentTrace {
        InstrumentTrace::reconstruct(instrument, &self.stages)
    }
}

/// Explain an empty stage from its exclusion counts.
pub(crate) fn no_candidates_reason(result: &FilterStageResult) -> String {
    if result.input_count == 0 {
        return "stage received no instruments".to_string();
    }
    let counts: Vec<String> = result
        .diagnostics
        .exclusion_counts
        .iter()
        .map(|(code, n)| format!("{code}: {n}"))
        .collect();
    format!(
        "all {} instruments excluded ({})",
        result.input_count,
        counts.join(", ")
    )
}

/// Shared per-run state handed to each stage.
pub(crate) struct StageContext<'a> {
    pub(crate) source: GuardedSource<'a>,
    pub(crate) seeds: &'a SeedHierarchy,
    pub(crate) trading_date: NaiveDate,
    pub(crate) config: &'a FunnelConfig,
    pub(crate) pool: &'a rayon::ThreadPool,
}

/// Funnel filter bound to one quote source and one trading date.
///
/// Stateless per run apart from the provider circuit breaker, which persists
/// across runs so a dead provider is not hammered by every snapshot iteration.
pub struct FunnelFilter {
    config: FunnelConfig,
    source: Arc<dyn QuoteSource>,
    breaker: CircuitBreaker,
    seeds: SeedHierarchy,
    trading_date: NaiveDate,
    pool: rayon::ThreadPool,
}

impl FunnelFilter {
    /// Validates the configuration and builds the worker pool.
    pub fn new(
        config: FunnelConfig,
        source: Arc<dyn QuoteSource>,
        seeds: SeedHierarchy,
        trading_date: NaiveDate,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = build_pool(config.workers, "funnel")?;
        let breaker = CircuitBreaker::new(
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        );
        Ok(Self {
            config,
            source,
            breaker,
            seeds,
            trading_date,
            pool,
        })
    }

    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    pub fn trading_date(&self) -> NaiveDate {
        self.trading_date
    }

    fn context(&self) -> StageContext<'_> {
        StageContext {
            source: GuardedSource::new(self.source.as_ref(), &self.breaker),
            seeds: &self.seeds,
            trading_date: self.trading_date,
            config: &self.config,
            pool: &self.pool,
        }
    }

    /// Fetch the reference universe and run stage 1.
    pub fn stage1(&self) -> (FilterStageResult, Vec<Instrument>) {
        let ctx = self.context();
        let mut substituted = None;
        let mut unavailable = None;
        let universe = match ctx.source.static_reference() {
            Ok(universe) => universe,
            Err(err) if self.config.synthetic_fallback => {
                let universe = synthetic_universe(&self.seeds, self.config.synthetic_universe_size);
                warn!(
                    source = ctx.source.name(),
                    error = %err,
                    substituted = universe.len(),
                    "reference data unavailable; synthetic mode"
                );
                substituted = Some(universe.len());
                unavailable = Some(err);
                universe
            }
            Err(err) => {
                warn!(source = ctx.source.name(), error = %err, "reference data unavailable");
                unavailable = Some(err);
                Vec::new()
            }
        };

        let (mut result, retained) = static_attrs::run(&universe);
        if let Some(err) = unavailable {
            result.diagnostics.record_unavailable(&err);
        }
        if let Some(count) = substituted {
            result.diagnostics.synthetic_mode = true;
            result.diagnostics.synthetic_substitutions = count;
        }
        (result, retained)
    }

    /// Stage 2 over a stage-1 retained set.
    pub fn stage2(&self, input: &[Instrument]) -> (FilterStageResult, Vec<Candidate>) {
        liquidity::run(&self.context(), input)
    }

    /// Stage 3 over `input` for the configured morning window and output cap.
    pub fn stage3(&self, input: &[Candidate]) -> (FilterStageResult, Vec<Candidate>) {
        self.stage3_within(input, self.config.morning_window, self.config.max_output)
    }

    /// Stage 3 with an explicit window and cap. The snapshot loop uses this to
    /// shrink the watchlist toward a target size as the morning progresses.
    pub fn stage3_within(
        &self,
        input: &[Candidate],
        range: TimeRange,
        cap: usize,
    ) -> (FilterStageResult, Vec<Candidate>) {
        volume_ratio::run(&self.context(), input, range, cap)
    }

    /// Run all three stages, short-circuiting on the first empty stage.
    pub fn run(&self) -> FunnelReport {
        let mut stages = Vec::with_capacity(3);

        let (s1, universe) = self.stage1();
        let empty = s1.is_empty();
        stages.push(s1);
        if empty {
            return self.short_circuit(stages);
        }

        let (s2, liquid) = self.stage2(&universe);
        let empty = s2.is_empty();
        stages.push(s2);
        if empty {
            return self.short_circuit(stages);
        }

        let (s3, shortlist) = self.stage3(&liquid);
        let empty = s3.is_empty();
        stages.push(s3);
        if empty {
            return self.short_circuit(stages);
        }

        info!(
            shortlist = shortlist.len(),
            trading_date = %self.trading_date,
            "funnel complete"
        );
        FunnelReport {
            stages,
            outcome: FunnelOutcome::Shortlist {
                candidates: shortlist,
            },
        }
    }

    fn short_circuit(&self, stages: Vec<FilterStageResult>) -> FunnelReport {
        let last = stages.last().map(|s| (s.stage, no_candidates_reason(s)));
        let (stage, reason) =
            last.unwrap_or((StageKind::StaticAttributes, "no stage ran".to_string()));
        warn!(%stage, %reason, "funnel produced no candidates");
        FunnelReport {
            stages,
            outcome: FunnelOutcome::NoCandidates { stage, reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Capability, MemorySource};
    use crate::domain::{Bar, FlagCategory, SessionId};
    use chrono::Duration as ChronoDuration;

    fn seeds() -> SeedHierarchy {
        SeedHierarchy::new(42, SessionId("funnel-test".into()))
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn small_config() -> FunnelConfig {
        FunnelConfig {
            synthetic_universe_size: 400,
            workers: 2,
            ..FunnelConfig::default()
        }
    }

    fn daily(notional: f64, volume: u64) -> Vec<Bar> {
        (1..=5)
            .map(|back| Bar {
                timestamp: (date() - ChronoDuration::days(back)).and_hms_opt(0, 0, 0).unwrap(),
                open: 10.0,
                high: 10.2,
                low: 9.8,
                close: 10.0,
                volume,
                notional,
            })
            .collect()
    }

    fn morning(volume: u64) -> Vec<Bar> {
        let start = date().and_hms_opt(9, 30, 0).unwrap();
        (0..30)
            .map(|i| Bar {
                timestamp: start + ChronoDuration::minutes(i),
                open: 10.0,
                high: 10.1,
                low: 9.9,
                close: 10.0,
                volume,
                notional: volume as f64 * 10.0 / 10_000.0,
            })
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        assert!(FunnelConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_morning_window_is_rejected() {
        let mut config = FunnelConfig::default();
        config.morning_window = TimeRange::new(
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
        );
        assert!(matches!(config.validate(), Err(ConfigError::EmptyWindow { .. })));
    }

    #[test]
    fn empty_provider_runs_every_stage_in_synthetic_mode() {
        let filter = FunnelFilter::new(
            small_config(),
            Arc::new(MemorySource::empty()),
            seeds(),
            date(),
        )
        .unwrap();
        let report = filter.run();
        assert_eq!(report.stages.len(), 3);
        assert!(report.synthetic_mode());
        for stage in &report.stages {
            assert!(stage.counts_balance());
            assert!(stage.diagnostics.synthetic_mode);
        }
        assert!(report.outcome.candidates().len() <= 200);
    }

    #[test]
    fn synthetic_run_is_deterministic() {
        let run = || {
            FunnelFilter::new(small_config(), Arc::new(MemorySource::empty()), seeds(), date())
                .unwrap()
                .run()
        };
        let a = run();
        let b = run();
        assert_eq!(a.outcome, b.outcome);
    }

    #[test]
    fn disabled_fallback_short_circuits_with_reason() {
        let config = FunnelConfig {
            synthetic_fallback: false,
            ..small_config()
        };
        let filter =
            FunnelFilter::new(config, Arc::new(MemorySource::empty()), seeds(), date()).unwrap();
        let report = filter.run();
        assert_eq!(report.stages.len(), 1);
        match report.outcome {
            FunnelOutcome::NoCandidates { stage, .. } => {
                assert_eq!(stage, StageKind::StaticAttributes)
            }
            other => panic!("expected no candidates, got {other:?}"),
        }
    }

    #[test]
    fn provider_data_flows_through_all_stages() {
        let source = MemorySource::new("mem")
            .with_reference(vec![
                Instrument::new("600001", Some("Banks")),
                Instrument::new("600002", Some("Banks")),
                Instrument::new("600003", Some("Banks"))
                    .with_flag(FlagCategory::SpecialTreatment, Some(true)),
            ])
            .with_daily_bars("600001".into(), daily(8_000.0, 240_000))
            .with_daily_bars("600002".into(), daily(1_000.0, 240_000))
            .with_intraday_bars("600001".into(), morning(5_000));
        let filter = FunnelFilter::new(small_config(), Arc::new(source), seeds(), date()).unwrap();
        let report = filter.run();

        let s2 = report.stage(StageKind::Liquidity).unwrap();
        assert!(!s2.diagnostics.synthetic_mode);
        assert_eq!(s2.output_count, 1);

        let shortlist = report.outcome.candidates();
        assert_eq!(shortlist.len(), 1);
        assert!((shortlist[0].volume_ratio.unwrap() - 5.0).abs() < 1e-9);

        let trace = report.trace(&"600003".into());
        assert_eq!(
            trace.exclusion(),
            Some((
                StageKind::StaticAttributes,
                &ExclusionReason::Flagged {
                    category: FlagCategory::SpecialTreatment
                }
            ))
        );
    }

    #[test]
    fn stage3_floor_is_strict() {
        let source = MemorySource::new("mem")
            .with_intraday_bars("600001".into(), morning(3_000))
            .with_intraday_bars("600002".into(), morning(3_001));
        let filter = FunnelFilter::new(small_config(), Arc::new(source), seeds(), date()).unwrap();
        let input: Vec<Candidate> = ["600001", "600002"]
            .into_iter()
            .map(|id| Candidate {
                instrument: Instrument::new(id, None),
                profile: LiquidityProfile {
                    mean_notional: 10_000.0,
                    mean_volume: 240_000.0,
                    atr: Some(0.3),
                    reference_close: 10.0,
                },
                volume_ratio: None,
            })
            .collect();
        let range = filter.config().morning_window;
        let (result, kept) = filter.stage3_within(&input, range, 200);
        // 600001 sits exactly on the 3.0 floor
        assert_eq!(result.excluded_with("below_volume_ratio"), 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].instrument.id.as_str(), "600002");
        assert!(!result.diagnostics.synthetic_mode);
    }

    #[test]
    fn stage3_cap_excludes_with_rank() {
        let config = FunnelConfig {
            volume_ratio_floor: 0.0,
            ..small_config()
        };
        let filter = FunnelFilter::new(
            config,
            Arc::new(MemorySource::new("mem").failing(Capability::IntradayBars)),
            seeds(),
            date(),
        )
        .unwrap();
        let input: Vec<Candidate> = (0..50)
            .map(|i| Candidate {
                instrument: Instrument::new(format!("{:06}", 300_000 + i), None),
                profile: LiquidityProfile {
                    mean_notional: 10_000.0,
                    mean_volume: 1_000_000.0,
                    atr: Some(0.3),
                    reference_close: 10.0,
                },
                volume_ratio: None,
            })
            .collect();
        let range = filter.config().morning_window;
        let (result, kept) = filter.stage3_within(&input, range, 10);
        assert_eq!(kept.len(), 10);
        assert!(result.counts_balance());
        assert!(result.diagnostics.synthetic_mode);
        assert_eq!(result.excluded_with("over_output_cap"), 40);
        assert!(kept
            .windows(2)
            .all(|w| w[0].volume_ratio >= w[1].volume_ratio));
    }
}
