//! Stage 2: short-window liquidity.
//!
//! Fetches a trailing daily-bar window per instrument, drops instruments whose
//! mean daily notional is below the floor, and derives the [`LiquidityProfile`]
//! that stage 3 and the refiner use as their baseline.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::synthetic::synthetic_daily_bars;
use crate::data::{Capability, DataUnavailable};
use crate::domain::{average_true_range, Bar, Instrument};

use super::stage::{ExclusionReason, FilterStageResult, StageKind, StageRecorder};
use super::{Candidate, StageContext};

/// Trailing-window liquidity baseline for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidityProfile {
    /// Mean daily notional over the window.
    pub mean_notional: f64,
    /// Mean daily share volume over the window.
    pub mean_volume: f64,
    /// Average true range over the window, if at least one bar is sane.
    pub atr: Option<f64>,
    /// Last close in the window; the reference close for today.
    pub reference_close: f64,
}

impl LiquidityProfile {
    /// Build a profile from a non-empty daily window.
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        let sane: Vec<&Bar> = bars.iter().filter(|b| b.is_sane()).collect();
        let last = sane.last()?;
        let n = sane.len() as f64;
        Some(Self {
            mean_notional: sane.iter().map(|b| b.notional).sum::<f64>() / n,
            mean_volume: sane.iter().map(|b| b.volume as f64).sum::<f64>() / n,
            atr: average_true_range(bars),
            reference_close: last.close,
        })
    }

    /// ATR as a fraction of the reference close.
    pub fn atr_fraction(&self) -> Option<f64> {
        match self.atr {
            Some(atr) if self.reference_close > 0.0 => Some(atr / self.reference_close),
            _ => None,
        }
    }
}

enum Evaluated {
    Pass(LiquidityProfile),
    Fail(ExclusionReason),
}

struct Fetched {
    evaluated: Evaluated,
    synthetic: bool,
    unavailable: Option<DataUnavailable>,
}

fn evaluate(bars: &[Bar], floor: f64) -> Evaluated {
    if bars.is_empty() {
        return Evaluated::Fail(ExclusionReason::NoDailyBars);
    }
    match LiquidityProfile::from_bars(bars) {
        None => Evaluated::Fail(ExclusionReason::NoDailyBars),
        Some(profile) if profile.mean_notional < floor => {
            Evaluated::Fail(ExclusionReason::BelowLiquidityFloor {
                mean_notional: profile.mean_notional,
                floor,
            })
        }
        Some(profile) => Evaluated::Pass(profile),
    }
}

fn fetch_one(ctx: &StageContext<'_>, instrument: &Instrument) -> Fetched {
    let window = ctx.config.daily_window;
    match ctx.source.daily_bars(&instrument.id, window) {
        Ok(bars) => Fetched {
            evaluated: evaluate(&bars, ctx.config.liquidity_floor),
            synthetic: false,
            unavailable: None,
        },
        Err(unavailable) if ctx.config.synthetic_fallback => {
            let bars = synthetic_daily_bars(ctx.seeds, &instrument.id, ctx.trading_date, window);
            Fetched {
                evaluated: evaluate(&bars, ctx.config.liquidity_floor),
                synthetic: true,
                unavailable: Some(unavailable),
            }
        }
        Err(unavailable) => Fetched {
            evaluated: Evaluated::Fail(ExclusionReason::DataUnavailable {
                capability: Capability::DailyBars,
                detail: unavailable.reason.clone(),
            }),
            synthetic: false,
            unavailable: Some(unavailable),
        },
    }
}

/// Run stage 2. Output keeps stage-1 order.
pub(super) fn run(
    ctx: &StageContext<'_>,
    input: &[Instrument],
) -> (FilterStageResult, Vec<Candidate>) {
    let mut recorder = StageRecorder::new(
        StageKind::Liquidity,
        input.iter().map(|i| i.id.clone()).collect(),
    );

    let fetched: Vec<Fetched> = ctx
        .pool
        .install(|| input.par_iter().map(|inst| fetch_one(ctx, inst)).collect());

    let mut retained = Vec::with_capacity(input.len());
    for (instrument, fetched) in input.iter().zip(fetched) {
        if let Some(unavailable) = &fetched.unavailable {
            recorder.diagnostics.record_unavailable(unavailable);
        }
        if fetched.synthetic {
            recorder.diagnostics.record_substitution();
        }
        match fetched.evaluated {
            Evaluated::Pass(profile) => {
                recorder.retain(instrument.id.clone());
                retained.push(Candidate {
                    instrument: instrument.clone(),
                    profile,
                    volume_ratio: None,
                });
            }
            Evaluated::Fail(reason) => recorder.exclude(instrument.id.clone(), reason),
        }
    }

    if recorder.diagnostics.synthetic_mode {
        tracing::warn!(
            substituted = recorder.diagnostics.synthetic_substitutions,
            first_failure = recorder.diagnostics.first_unavailable.as_deref().unwrap_or(""),
            "daily bars unavailable; synthetic mode"
        );
    }
    (recorder.finish(), retained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(day: u32, close: f64, volume: u64, notional: f64) -> Bar {
        Bar {
            timestamp: NaiveDate::from_ymd_opt(2024, 3, day)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            open: close,
            high: close * 1.02,
            low: close * 0.98,
            close,
            volume,
            notional,
        }
    }

    #[test]
    fn profile_uses_last_close_and_means() {
        let bars = vec![bar(11, 10.0, 1_000, 2_000.0), bar(12, 11.0, 3_000, 4_000.0)];
        let profile = LiquidityProfile::from_bars(&bars).unwrap();
        assert_eq!(profile.reference_close, 11.0);
        assert!((profile.mean_notional - 3_000.0).abs() < 1e-9);
        assert!((profile.mean_volume - 2_000.0).abs() < 1e-9);
        assert!(profile.atr_fraction().unwrap() > 0.0);
    }

    #[test]
    fn empty_window_is_its_own_reason() {
        assert!(matches!(
            evaluate(&[], 3_000.0),
            Evaluated::Fail(ExclusionReason::NoDailyBars)
        ));
    }

    #[test]
    fn below_floor_reports_the_mean() {
        let bars = vec![bar(11, 10.0, 1_000, 1_000.0), bar(12, 10.0, 1_000, 2_000.0)];
        match evaluate(&bars, 3_000.0) {
            Evaluated::Fail(ExclusionReason::BelowLiquidityFloor {
                mean_notional,
                floor,
            }) => {
                assert!((mean_notional - 1_500.0).abs() < 1e-9);
                assert_eq!(floor, 3_000.0);
            }
            _ => panic!("expected below-floor exclusion"),
        }
    }

    #[test]
    fn floor_is_inclusive() {
        let bars = vec![bar(11, 10.0, 1_000, 3_000.0)];
        assert!(matches!(evaluate(&bars, 3_000.0), Evaluated::Pass(_)));
    }
}
