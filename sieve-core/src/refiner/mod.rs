//! Tick-level refiner.
//!
//! Ranks the funnel shortlist by a weighted composite of tick metrics. The
//! full ranking is returned along with a fixed-size head, and one optionally
//! tracked instrument is always reported with its exact rank and breakdown so
//! "why wasn't X selected" has an answer.
//!
//! An instrument whose tick fetch fails falls back to a seeded synthetic
//! series; if that also fails it is reported as failed, never scored zero.

pub mod metrics;
pub mod score;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{build_pool, require_at_least, ConfigError};
use crate::data::synthetic::{synthetic_ticks, NOTIONAL_UNIT};
use crate::data::{CircuitBreaker, GuardedSource, QuoteSource, TickProfile};
use crate::domain::{InstrumentId, TimeRange};
use crate::funnel::Candidate;
use crate::rng::SeedHierarchy;

pub use metrics::{FlowBucket, MetricInputs, TickMetrics};
pub use score::{rank, CompositeScore, RefinerWeights, SubScoreCeilings, SubScores};

/// Refiner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinerConfig {
    pub weights: RefinerWeights,
    pub ceilings: SubScoreCeilings,
    /// Size of the head handed to the live engine.
    pub head_size: usize,
    /// Width of one money-flow bucket.
    pub bucket_minutes: i64,
    /// Tick window fetched per instrument.
    pub tick_window: TimeRange,
    pub session_minutes: u32,
    pub synthetic_fallback: bool,
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
    pub workers: usize,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            weights: RefinerWeights::default(),
            ceilings: SubScoreCeilings::default(),
            head_size: 10,
            bucket_minutes: 5,
            tick_window: TimeRange::new(
                NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap_or_default(),
            ),
            session_minutes: 240,
            synthetic_fallback: true,
            breaker_threshold: 3,
            breaker_cooldown_secs: 60,
            workers: 8,
        }
    }
}

impl RefinerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        self.ceilings.validate()?;
        require_at_least("refiner.head_size", self.head_size, 1)?;
        require_at_least("refiner.bucket_minutes", self.bucket_minutes.max(0) as usize, 1)?;
        require_at_least("refiner.session_minutes", self.session_minutes as usize, 1)?;
        require_at_least("refiner.breaker_threshold", self.breaker_threshold as usize, 1)?;
        require_at_least("refiner.workers", self.workers, 1)?;
        if self.tick_window.minutes() == 0 {
            return Err(ConfigError::EmptyWindow {
                field: "refiner.tick_window",
            });
        }
        Ok(())
    }
}

/// Picks the synthetic tick profile for a candidate.
pub type ProfileSelector = Arc<dyn Fn(&Candidate) -> TickProfile + Send + Sync>;

/// An instrument the refiner could not score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineFailure {
    pub instrument: InstrumentId,
    pub reason: String,
}

/// Status of the tracked instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrackedStatus {
    Ranked {
        rank: usize,
        in_head: bool,
        score: Box<CompositeScore>,
    },
    Failed {
        reason: String,
    },
    NotInInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedReport {
    pub instrument: InstrumentId,
    pub status: TrackedStatus,
}

/// One refiner pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinerReport {
    /// Every scored instrument, rank order.
    pub ranked: Vec<CompositeScore>,
    pub head_size: usize,
    pub failed: Vec<RefineFailure>,
    pub tracked: Option<TrackedReport>,
    /// Instruments scored from synthetic ticks.
    pub synthetic_count: usize,
    pub elapsed_ms: u64,
}

impl RefinerReport {
    pub fn head(&self) -> &[CompositeScore] {
        &self.ranked[..self.head_size.min(self.ranked.len())]
    }

    pub fn head_ids(&self) -> Vec<InstrumentId> {
        self.head().iter().map(|s| s.instrument.clone()).collect()
    }

    pub fn input_count(&self) -> usize {
        self.ranked.len() + self.failed.len()
    }
}

enum Refined {
    Scored(TickMetrics),
    Failed(String),
}

/// Tick refiner bound to one quote source and one trading date.
pub struct TickRefiner {
    config: RefinerConfig,
    source: Arc<dyn QuoteSource>,
    breaker: CircuitBreaker,
    seeds: SeedHierarchy,
    trading_date: NaiveDate,
    selector: ProfileSelector,
    pool: rayon::ThreadPool,
}

impl TickRefiner {
    pub fn new(
        config: RefinerConfig,
        source: Arc<dyn QuoteSource>,
        seeds: SeedHierarchy,
        trading_date: NaiveDate,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = build_pool(config.workers, "refiner")?;
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
            selector: Arc::new(|_| TickProfile::Calm),
            pool,
        })
    }

    /// Replace the synthetic profile selector (default: every instrument calm).
    pub fn with_profile_selector(mut self, selector: ProfileSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &RefinerConfig {
        &self.config
    }

    fn refine_one(&self, source: &GuardedSource<'_>, candidate: &Candidate) -> Refined {
        let id = candidate.id();
        let window = self.config.tick_window;
        let (ticks, synthetic) = match source.tick_window(id, window) {
            Ok(ticks) => (ticks, false),
            Err(unavailable) if self.config.synthetic_fallback => {
                let profile = (self.selector)(candidate);
                match synthetic_ticks(
                    &self.seeds,
                    id,
                    self.trading_date,
                    window,
                    candidate.profile.reference_close,
                    profile,
                ) {
                    Ok(ticks) => (ticks, true),
                    Err(err) => {
                        return Refined::Failed(format!(
                            "{}; synthetic fallback failed: {err}",
                            unavailable.reason
                        ))
                    }
                }
            }
            Err(unavailable) => return Refined::Failed(unavailable.to_string()),
        };

        let inputs = MetricInputs {
            reference_close: candidate.profile.reference_close,
            atr_fraction: candidate.profile.atr_fraction(),
            historical_window_volume: candidate.profile.mean_volume * window.minutes() as f64
                / f64::from(self.config.session_minutes),
            market_cap: candidate.instrument.market_cap.map(|cap| cap / NOTIONAL_UNIT),
            window,
            bucket_minutes: self.config.bucket_minutes,
        };
        match metrics::compute(id, &ticks, &inputs, synthetic) {
            Some(m) => Refined::Scored(m),
            None => Refined::Failed(format!(
                "no usable ticks (reference close {})",
                candidate.profile.reference_close
            )),
        }
    }

    /// Score and rank the shortlist.
    pub fn refine(&self, shortlist: &[Candidate], tracked: Option<&InstrumentId>) -> RefinerReport {
        let started = Instant::now();
        let source = GuardedSource::new(self.source.as_ref(), &self.breaker);

        let refined: Vec<Refined> = self.pool.install(|| {
            shortlist
                .par_iter()
                .map(|c| self.refine_one(&source, c))
                .collect()
        });

        let mut scored = Vec::with_capacity(shortlist.len());
        let mut failed = Vec::new();
        for (candidate, outcome) in shortlist.iter().zip(refined) {
            match outcome {
                Refined::Scored(m) => scored.push(m),
                Refined::Failed(reason) => {
                    debug!(instrument = %candidate.id(), %reason, "refiner failed instrument");
                    failed.push(RefineFailure {
                        instrument: candidate.id().clone(),
                        reason,
                    });
                }
            }
        }
        let synthetic_count = scored.iter().filter(|m| m.synthetic).count();
        let ranked = rank(scored, &self.config.weights, &self.config.ceilings);

        let tracked = tracked.map(|id| {
            let status = if let Some(score) = ranked.iter().find(|s| &s.instrument == id) {
                TrackedStatus::Ranked {
                    rank: score.rank,
                    in_head: score.rank <= self.config.head_size,
                    score: Box::new(score.clone()),
                }
            } else if let Some(f) = failed.iter().find(|f| &f.instrument == id) {
                TrackedStatus::Failed {
                    reason: f.reason.clone(),
                }
            } else {
                TrackedStatus::NotInInput
            };
            TrackedReport {
                instrument: id.clone(),
                status,
            }
        });

        if !failed.is_empty() {
            warn!(failed = failed.len(), "refiner could not score some instruments");
        }
        let report = RefinerReport {
            ranked,
            head_size: self.config.head_size,
            failed,
            tracked,
            synthetic_count,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            input = shortlist.len(),
            ranked = report.ranked.len(),
            failed = report.failed.len(),
            synthetic = report.synthetic_count,
            elapsed_ms = report.elapsed_ms,
            "refiner pass complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySource;
    use crate::domain::{Instrument, SessionId};
    use crate::funnel::LiquidityProfile;

    fn candidate(i: usize, reference_close: f64) -> Candidate {
        Candidate {
            instrument: Instrument::new(format!("{:06}", 200_000 + i), Some("Banks"))
                .with_market_cap(5e9),
            profile: LiquidityProfile {
                mean_notional: 8_000.0,
                mean_volume: 2_000_000.0,
                atr: Some(0.4),
                reference_close,
            },
            volume_ratio: Some(4.0),
        }
    }

    fn refiner(config: RefinerConfig) -> TickRefiner {
        TickRefiner::new(
            config,
            Arc::new(MemorySource::empty()),
            SeedHierarchy::new(9, SessionId("refiner-test".into())),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn invalid_weights_fail_construction() {
        let mut config = RefinerConfig::default();
        config.weights.volume = 0.9;
        let result = TickRefiner::new(
            config,
            Arc::new(MemorySource::empty()),
            SeedHierarchy::new(9, SessionId("x".into())),
            NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        );
        assert!(matches!(result, Err(ConfigError::WeightsDoNotSumToOne { .. })));
    }

    #[test]
    fn bad_reference_close_is_failed_not_zero() {
        let shortlist = vec![candidate(0, 10.0), candidate(1, f64::NAN)];
        let report = refiner(RefinerConfig::default()).refine(&shortlist, Some(&"200001".into()));
        assert_eq!(report.ranked.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.tracked.unwrap().status,
            TrackedStatus::Failed { .. }
        ));
    }

    #[test]
    fn disabled_fallback_fails_everything() {
        let config = RefinerConfig {
            synthetic_fallback: false,
            ..RefinerConfig::default()
        };
        let report = refiner(config).refine(&[candidate(0, 10.0)], None);
        assert!(report.ranked.is_empty());
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn surging_selector_lifts_selected_instruments() {
        let shortlist: Vec<Candidate> = (0..20).map(|i| candidate(i, 10.0)).collect();
        let surging: InstrumentId = "200007".into();
        let target = surging.clone();
        let r = refiner(RefinerConfig::default()).with_profile_selector(Arc::new(move |c| {
            if c.id() == &target {
                TickProfile::Surging
            } else {
                TickProfile::Calm
            }
        }));
        let report = r.refine(&shortlist, Some(&surging));
        assert_eq!(report.head().len(), 10);
        assert_eq!(report.synthetic_count, 20);
        match report.tracked.unwrap().status {
            TrackedStatus::Ranked { rank, in_head, .. } => {
                assert_eq!(rank, 1);
                assert!(in_head);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn zero_breaker_threshold_is_rejected() {
        let config = RefinerConfig {
            breaker_threshold: 0,
            ..RefinerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn breaker_threshold_comes_from_config() {
        let shortlist: Vec<Candidate> = (0..4).map(|i| candidate(i, 10.0)).collect();
        let open_count = |threshold: u32| {
            let config = RefinerConfig {
                synthetic_fallback: false,
                breaker_threshold: threshold,
                workers: 1,
                ..RefinerConfig::default()
            };
            refiner(config)
                .refine(&shortlist, None)
                .failed
                .iter()
                .filter(|f| f.reason.contains("circuit breaker open"))
                .count()
        };
        assert_eq!(open_count(1), 3);
        assert_eq!(open_count(4), 0);
    }

    #[test]
    fn untracked_instrument_reports_not_in_input() {
        let report =
            refiner(RefinerConfig::default()).refine(&[candidate(0, 10.0)], Some(&"999999".into()));
        assert_eq!(report.tracked.unwrap().status, TrackedStatus::NotInInput);
    }
}
