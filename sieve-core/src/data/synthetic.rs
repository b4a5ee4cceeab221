//! Deterministic synthetic market data.
//!
//! Used whenever a provider call comes back `DataUnavailable`, so every stage
//! runs even against an empty provider. Every generator here is a pure
//! function of its inputs plus a seed drawn from the [`SeedHierarchy`]; the
//! same seed always yields the same data, regardless of thread count.
//!
//! Results produced from synthetic data are always tagged as such in stage
//! diagnostics.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    Bar, FlagCategory, Granularity, Instrument, InstrumentId, Tick, TimeRange, TradeSide, Venue,
};
use crate::rng::{SeedHierarchy, SeedStream};

/// Sector pool for synthetic instruments.
pub const SYNTHETIC_SECTORS: [&str; 12] = [
    "Banks",
    "Semiconductors",
    "Software",
    "Pharma",
    "Autos",
    "Batteries",
    "Solar",
    "Liquor",
    "Real Estate",
    "Steel",
    "Media",
    "Defense",
];

/// Notional unit: synthetic `Bar::notional` is expressed in ten-thousands of
/// currency units.
pub const NOTIONAL_UNIT: f64 = 10_000.0;

/// Synthetic generator failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyntheticError {
    #[error("reference close {0} is not a positive finite price")]
    InvalidReferenceClose(f64),

    #[error("empty time range {0:?}")]
    EmptyRange(TimeRange),
}

/// Named volatility/volume profile for synthetic tick series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickProfile {
    /// Quiet tape: few prints, symmetric flow, low volatility.
    Calm,
    /// Active tape: dense prints, buyer-dominated flow, upward drift.
    Surging,
}

impl TickProfile {
    fn prints_per_minute(&self) -> u32 {
        match self {
            Self::Calm => 6,
            Self::Surging => 24,
        }
    }

    fn step_vol(&self) -> f64 {
        match self {
            Self::Calm => 0.0006,
            Self::Surging => 0.0025,
        }
    }

    fn drift(&self) -> f64 {
        match self {
            Self::Calm => 0.0,
            Self::Surging => 0.0003,
        }
    }

    fn buy_probability(&self) -> f64 {
        match self {
            Self::Calm => 0.5,
            Self::Surging => 0.62,
        }
    }

    fn lots(&self) -> std::ops::Range<u64> {
        match self {
            Self::Calm => 1..20,
            Self::Surging => 5..80,
        }
    }
}

/// Standard normal draw (Box–Muller).
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

/// Synthetic reference universe of `count` instruments.
///
/// Roughly 8% special-treatment, 2% suspended, 1% delisting, and 5% on a
/// restricted venue. Ids are zero-padded six-digit codes.
pub fn synthetic_universe(seeds: &SeedHierarchy, count: usize) -> Vec<Instrument> {
    let mut rng = seeds.rng_for(SeedStream::Reference, "universe");
    (0..count)
        .map(|i| {
            let id = format!("{:06}", 100_000 + i);
            let sector = SYNTHETIC_SECTORS[rng.gen_range(0..SYNTHETIC_SECTORS.len())];
            let market_cap = (standard_normal(&mut rng) * 0.9 + 23.0).exp();
            let roll: f64 = rng.gen();
            let mut inst = Instrument::new(id.as_str(), Some(sector)).with_market_cap(market_cap);
            if roll < 0.08 {
                inst = inst.with_flag(FlagCategory::SpecialTreatment, Some(true));
            } else if roll < 0.10 {
                inst = inst.with_flag(FlagCategory::Suspended, Some(true));
            } else if roll < 0.11 {
                inst = inst.with_flag(FlagCategory::Delisted, Some(true));
            } else if roll < 0.16 {
                inst = inst
                    .with_venue(Venue::TechBoard)
                    .with_flag(FlagCategory::RestrictedVenue, Some(true));
            }
            inst
        })
        .collect()
}

/// Synthetic trailing daily bars ending the day before `trading_date`.
///
/// Mean daily notional is log-normal around 6,000 units so a default
/// liquidity floor of 3,000 removes a realistic share of the universe.
pub fn synthetic_daily_bars(
    seeds: &SeedHierarchy,
    instrument: &InstrumentId,
    trading_date: NaiveDate,
    window: usize,
) -> Vec<Bar> {
    let mut rng = seeds.rng_for(SeedStream::DailyBars, instrument.as_str());
    let mut price: f64 = rng.gen_range(4.0..80.0);
    let typical_notional = (standard_normal(&mut rng) * 0.8 + 6_000f64.ln()).exp();

    let mut bars = Vec::with_capacity(window);
    for back in (1..=window as i64).rev() {
        let daily_return = standard_normal(&mut rng) * 0.02;
        let open = price;
        let close = (price * (1.0 + daily_return)).max(0.5);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.02));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.02));
        let notional = typical_notional * rng.gen_range(0.6..1.4);
        let volume = (notional * NOTIONAL_UNIT / close).round() as u64;
        bars.push(Bar {
            timestamp: midnight(trading_date - Duration::days(back)),
            open,
            high,
            low,
            close,
            volume,
            notional,
        });
        price = close;
    }
    bars
}

/// Synthetic morning minute bars for today's session.
///
/// The per-minute volume is the baseline rate (`mean_daily_volume /
/// session_minutes`) scaled by a per-instrument multiplier: most instruments
/// trade near baseline, a tail trades at several times baseline.
#[allow(clippy::too_many_arguments)]
pub fn synthetic_intraday_bars(
    seeds: &SeedHierarchy,
    instrument: &InstrumentId,
    trading_date: NaiveDate,
    range: TimeRange,
    granularity: Granularity,
    reference_close: f64,
    mean_daily_volume: f64,
    session_minutes: u32,
) -> Result<Vec<Bar>, SyntheticError> {
    if !(reference_close.is_finite() && reference_close > 0.0) {
        return Err(SyntheticError::InvalidReferenceClose(reference_close));
    }
    let step = granularity.minutes();
    let count = range.minutes() / step;
    if count == 0 {
        return Err(SyntheticError::EmptyRange(range));
    }

    let mut rng = seeds.rng_for(SeedStream::IntradayBars, instrument.as_str());
    let tier: f64 = rng.gen();
    let multiplier = if tier < 0.75 {
        rng.gen_range(0.3..2.0)
    } else if tier < 0.92 {
        rng.gen_range(2.0..4.5)
    } else {
        rng.gen_range(4.5..12.0)
    };
    let baseline_per_bar =
        mean_daily_volume.max(0.0) / f64::from(session_minutes.max(1)) * step as f64;

    let mut price = reference_close * (1.0 + standard_normal(&mut rng) * 0.01);
    let mut bars = Vec::with_capacity(count as usize);
    for i in 0..count {
        let open = price;
        let close = (price * (1.0 + standard_normal(&mut rng) * 0.003)).max(0.01);
        let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.002));
        let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.002));
        let volume = (baseline_per_bar * multiplier * rng.gen_range(0.5..1.5)).round() as u64;
        bars.push(Bar {
            timestamp: trading_date.and_time(range.start) + Duration::minutes(i * step),
            open,
            high,
            low,
            close,
            volume,
            notional: volume as f64 * close / NOTIONAL_UNIT,
        });
        price = close;
    }
    Ok(bars)
}

/// Synthetic tick series over `range` following a named profile.
pub fn synthetic_ticks(
    seeds: &SeedHierarchy,
    instrument: &InstrumentId,
    trading_date: NaiveDate,
    range: TimeRange,
    reference_close: f64,
    profile: TickProfile,
) -> Result<Vec<Tick>, SyntheticError> {
    check_series(range, reference_close)?;
    let rng = seeds.rng_for(SeedStream::Ticks, instrument.as_str());
    Ok(tick_series(rng, trading_date, range, reference_close, profile))
}

/// Synthetic live tick stream for replayed subscriptions.
///
/// Same generator as [`synthetic_ticks`] on an independent seed stream, so a
/// replayed session does not echo the refiner's synthetic morning.
pub fn synthetic_live_ticks(
    seeds: &SeedHierarchy,
    instrument: &InstrumentId,
    trading_date: NaiveDate,
    range: TimeRange,
    reference_close: f64,
    profile: TickProfile,
) -> Result<Vec<Tick>, SyntheticError> {
    check_series(range, reference_close)?;
    let rng = seeds.rng_for(SeedStream::Live, instrument.as_str());
    Ok(tick_series(rng, trading_date, range, reference_close, profile))
}

fn check_series(range: TimeRange, reference_close: f64) -> Result<(), SyntheticError> {
    if !(reference_close.is_finite() && reference_close > 0.0) {
        return Err(SyntheticError::InvalidReferenceClose(reference_close));
    }
    if range.minutes() == 0 {
        return Err(SyntheticError::EmptyRange(range));
    }
    Ok(())
}

fn tick_series(
    mut rng: StdRng,
    trading_date: NaiveDate,
    range: TimeRange,
    reference_close: f64,
    profile: TickProfile,
) -> Vec<Tick> {
    let minutes = range.minutes();
    let per_minute = profile.prints_per_minute();
    let spacing_ms = 60_000 / i64::from(per_minute);
    let start = trading_date.and_time(range.start);
    let mut price = reference_close * (1.0 + standard_normal(&mut rng) * 0.005);
    let mut ticks = Vec::with_capacity((minutes as usize) * per_minute as usize);

    for minute in 0..minutes {
        for k in 0..i64::from(per_minute) {
            let step = profile.drift() + standard_normal(&mut rng) * profile.step_vol();
            price = (price * (1.0 + step)).max(0.01);
            let side = if rng.gen_bool(profile.buy_probability()) {
                TradeSide::Buy
            } else {
                TradeSide::Sell
            };
            let volume = rng.gen_range(profile.lots()) * 100;
            ticks.push(Tick {
                timestamp: start + Duration::minutes(minute) + Duration::milliseconds(k * spacing_ms),
                price,
                volume,
                notional: volume as f64 * price / NOTIONAL_UNIT,
                side,
            });
        }
    }
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionId;
    use chrono::NaiveTime;

    fn seeds() -> SeedHierarchy {
        SeedHierarchy::new(7, SessionId("synthetic-test".into()))
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn morning() -> TimeRange {
        TimeRange::new(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn universe_is_deterministic() {
        let a = synthetic_universe(&seeds(), 500);
        let b = synthetic_universe(&seeds(), 500);
        assert_eq!(a, b);
        assert_eq!(a.len(), 500);
    }

    #[test]
    fn universe_contains_flagged_instruments() {
        let universe = synthetic_universe(&seeds(), 2_000);
        let flagged = universe
            .iter()
            .filter(|i| FlagCategory::ALL.iter().any(|c| i.flags.get(*c) == Some(true)))
            .count();
        assert!(flagged > 100 && flagged < 600, "flagged = {flagged}");
    }

    #[test]
    fn daily_bars_are_sane_and_sized() {
        let id = InstrumentId::from("600000");
        let bars = synthetic_daily_bars(&seeds(), &id, date(), 5);
        assert_eq!(bars.len(), 5);
        assert!(bars.iter().all(|b| b.is_sane()));
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn intraday_rejects_bad_reference_close() {
        let id = InstrumentId::from("600000");
        let err = synthetic_intraday_bars(
            &seeds(),
            &id,
            date(),
            morning(),
            Granularity::Minute,
            f64::NAN,
            1e6,
            240,
        );
        assert!(matches!(err, Err(SyntheticError::InvalidReferenceClose(_))));
    }

    #[test]
    fn intraday_has_one_bar_per_step() {
        let id = InstrumentId::from("600000");
        let bars = synthetic_intraday_bars(
            &seeds(),
            &id,
            date(),
            morning(),
            Granularity::Minute,
            10.0,
            1e6,
            240,
        )
        .unwrap();
        assert_eq!(bars.len(), 30);
    }

    #[test]
    fn surging_profile_is_denser_and_buyer_heavy() {
        let id = InstrumentId::from("600000");
        let calm = synthetic_ticks(&seeds(), &id, date(), morning(), 10.0, TickProfile::Calm).unwrap();
        let surging =
            synthetic_ticks(&seeds(), &id, date(), morning(), 10.0, TickProfile::Surging).unwrap();
        assert!(surging.len() > calm.len());

        let buy_share = |ticks: &[Tick]| {
            ticks.iter().filter(|t| t.side == TradeSide::Buy).count() as f64 / ticks.len() as f64
        };
        assert!(buy_share(&surging) > buy_share(&calm));
    }

    #[test]
    fn ticks_are_time_ordered_and_deterministic() {
        let id = InstrumentId::from("000001");
        let a = synthetic_ticks(&seeds(), &id, date(), morning(), 12.5, TickProfile::Calm).unwrap();
        let b = synthetic_ticks(&seeds(), &id, date(), morning(), 12.5, TickProfile::Calm).unwrap();
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn live_ticks_use_an_independent_stream() {
        let id = InstrumentId::from("000001");
        let refined = synthetic_ticks(&seeds(), &id, date(), morning(), 12.5, TickProfile::Calm).unwrap();
        let live =
            synthetic_live_ticks(&seeds(), &id, date(), morning(), 12.5, TickProfile::Calm).unwrap();
        assert_eq!(refined.len(), live.len());
        assert_ne!(refined, live);
        assert!(synthetic_live_ticks(&seeds(), &id, date(), morning(), 0.0, TickProfile::Calm).is_err());
    }
}
