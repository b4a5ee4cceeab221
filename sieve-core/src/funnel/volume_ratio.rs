//! Stage 3: early-session volume ratio.
//!
//! The ratio compares the per-minute volume traded so far in the morning window
//! with the per-minute rate implied by the stage-2 mean daily volume. Survivors
//! are sorted by ratio descending (ties by id ascending) and capped.

use std::cmp::Ordering;

use rayon::prelude::*;

use crate::data::synthetic::synthetic_intraday_bars;
use crate::data::{Capability, DataUnavailable};
use crate::domain::{Bar, TimeRange};

use super::liquidity::LiquidityProfile;
use super::stage::{ExclusionReason, FilterStageResult, StageKind, StageRecorder};
use super::{Candidate, StageContext};

/// Early-session volume ratio, or `None` when the baseline is unusable.
///
/// Window minutes are the minutes covered by the bars received, bounded by the
/// window length, so a window still in progress is not diluted.
pub fn volume_ratio(
    bars: &[Bar],
    profile: &LiquidityProfile,
    step_minutes: i64,
    window_minutes: i64,
    session_minutes: u32,
) -> Option<f64> {
    if !(profile.mean_volume.is_finite() && profile.mean_volume > 0.0) || session_minutes == 0 {
        return None;
    }
    let covered = (bars.len() as i64 * step_minutes)
        .min(window_minutes)
        .max(step_minutes.max(1));
    let window_volume: f64 = bars.iter().map(|b| b.volume as f64).sum();
    let observed_rate = window_volume / covered as f64;
    let baseline_rate = profile.mean_volume / f64::from(session_minutes);
    Some(observed_rate / baseline_rate)
}

/// Ranking order: ratio descending, instrument id ascending.
pub fn by_ratio_desc(a: &Candidate, b: &Candidate) -> Ordering {
    let ra = a.volume_ratio.unwrap_or(f64::NEG_INFINITY);
    let rb = b.volume_ratio.unwrap_or(f64::NEG_INFINITY);
    rb.partial_cmp(&ra)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.instrument.id.cmp(&b.instrument.id))
}

enum Evaluated {
    Pass(f64),
    Fail(ExclusionReason),
}

struct Fetched {
    evaluated: Evaluated,
    synthetic: bool,
    unavailable: Option<DataUnavailable>,
}

fn evaluate(ctx: &StageContext<'_>, bars: &[Bar], profile: &LiquidityProfile, range: TimeRange) -> Evaluated {
    if bars.is_empty() {
        return Evaluated::Fail(ExclusionReason::NoIntradayBars);
    }
    let config = ctx.config;
    match volume_ratio(
        bars,
        profile,
        config.granularity.minutes(),
        range.minutes(),
        config.session_minutes,
    ) {
        None => Evaluated::Fail(ExclusionReason::NoBaseline),
        Some(ratio) if ratio <= config.volume_ratio_floor => {
            Evaluated::Fail(ExclusionReason::BelowVolumeRatio {
                ratio,
                floor: config.volume_ratio_floor,
            })
        }
        Some(ratio) => Evaluated::Pass(ratio),
    }
}

fn fetch_one(ctx: &StageContext<'_>, candidate: &Candidate, range: TimeRange) -> Fetched {
    let id = &candidate.instrument.id;
    let config = ctx.config;
    let unavailable = match ctx.source.intraday_bars(id, range, config.granularity) {
        Ok(bars) => {
            return Fetched {
                evaluated: evaluate(ctx, &bars, &candidate.profile, range),
                synthetic: false,
                unavailable: None,
            }
        }
        Err(unavailable) => unavailable,
    };

    if !config.synthetic_fallback {
        return Fetched {
            evaluated: Evaluated::Fail(ExclusionReason::DataUnavailable {
                capability: Capability::IntradayBars,
                detail: unavailable.reason.clone(),
            }),
            synthetic: false,
            unavailable: Some(unavailable),
        };
    }

    match synthetic_intraday_bars(
        ctx.seeds,
        id,
        ctx.trading_date,
        range,
        config.granularity,
        candidate.profile.reference_close,
        candidate.profile.mean_volume,
        config.session_minutes,
    ) {
        Ok(bars) => Fetched {
            evaluated: evaluate(ctx, &bars, &candidate.profile, range),
            synthetic: true,
            unavailable: Some(unavailable),
        },
        Err(err) => Fetched {
            evaluated: Evaluated::Fail(ExclusionReason::DataUnavailable {
                capability: Capability::IntradayBars,
                detail: format!("{}; synthetic fallback failed: {err}", unavailable.reason),
            }),
            synthetic: false,
            unavailable: Some(unavailable),
        },
    }
}

/// Run stage 3 over `input`, keeping at most `cap` instruments.
pub(super) fn run(
    ctx: &StageContext<'_>,
    input: &[Candidate],
    range: TimeRange,
    cap: usize,
) -> (FilterStageResult, Vec<Candidate>) {
    let mut recorder = StageRecorder::new(
        StageKind::VolumeRatio,
        input.iter().map(|c| c.instrument.id.clone()).collect(),
    );

    let fetched: Vec<Fetched> = ctx
        .pool
        .install(|| input.par_iter().map(|c| fetch_one(ctx, c, range)).collect());

    let mut qualified = Vec::with_capacity(input.len());
    for (candidate, fetched) in input.iter().zip(fetched) {
        if let Some(unavailable) = &fetched.unavailable {
            recorder.diagnostics.record_unavailable(unavailable);
        }
        if fetched.synthetic {
            recorder.diagnostics.record_substitution();
        }
        match fetched.evaluated {
            Evaluated::Pass(ratio) => qualified.push(Candidate {
                volume_ratio: Some(ratio),
                ..candidate.clone()
            }),
            Evaluated::Fail(reason) => recorder.exclude(candidate.instrument.id.clone(), reason),
        }
    }

    qualified.sort_by(by_ratio_desc);
    let over_cap = qualified.split_off(cap.min(qualified.len()));
    for (offset, candidate) in over_cap.into_iter().enumerate() {
        recorder.exclude(
            candidate.instrument.id,
            ExclusionReason::OverOutputCap {
                rank: cap + offset + 1,
                cap,
            },
        );
    }
    for candidate in &qualified {
        recorder.retain(candidate.instrument.id.clone());
    }

    if recorder.diagnostics.synthetic_mode {
        tracing::warn!(
            substituted = recorder.diagnostics.synthetic_substitutions,
            first_failure = recorder.diagnostics.first_unavailable.as_deref().unwrap_or(""),
            "intraday bars unavailable; synthetic mode"
        );
    }
    (recorder.finish(), qualified)
}
