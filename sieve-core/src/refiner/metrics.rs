//! Per-instrument tick metrics.
//!
//! Computed once per refiner pass from a complete tick series; never updated
//! incrementally.

use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::domain::{InstrumentId, Tick, TimeRange, TradeSide};

/// Net flow within one fixed-width time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowBucket {
    pub start: NaiveTime,
    /// Buy notional minus sell notional.
    pub net_notional: f64,
}

/// Tick metrics for one instrument over the morning window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMetrics {
    pub instrument: InstrumentId,
    pub reference_close: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub tick_count: usize,
    pub cumulative_volume: u64,
    pub cumulative_notional: f64,
    /// (high − low) / reference close.
    pub amplitude_ratio: f64,
    /// Amplitude over the trailing ATR fraction; zero when no ATR is known.
    pub volatility_ratio: f64,
    /// Window volume over the historical same-window average.
    pub volume_ratio: f64,
    /// Ordered, gap-free buckets covering the window.
    pub flow_buckets: Vec<FlowBucket>,
    pub net_flow: f64,
    /// Net flow over market capitalisation; `None` without a market cap.
    pub flow_to_market_cap: Option<f64>,
    /// Ticks came from the synthetic fallback.
    pub synthetic: bool,
}

/// Inputs besides the ticks themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricInputs {
    pub reference_close: f64,
    /// Trailing ATR as a fraction of the reference close.
    pub atr_fraction: Option<f64>,
    /// Average volume historically traded in the same window.
    pub historical_window_volume: f64,
    /// Market capitalisation in the same unit as tick notional.
    pub market_cap: Option<f64>,
    pub window: TimeRange,
    pub bucket_minutes: i64,
}

/// Compute metrics from a tick series. Returns `None` for an empty series
/// or a non-positive reference close.
pub fn compute(
    instrument: &InstrumentId,
    ticks: &[Tick],
    inputs: &MetricInputs,
    synthetic: bool,
) -> Option<TickMetrics> {
    let first = ticks.first()?;
    let last = ticks.last()?;
    let reference_close = inputs.reference_close;
    if !(reference_close.is_finite() && reference_close > 0.0) {
        return None;
    }

    let bucket_minutes = inputs.bucket_minutes.max(1);
    let bucket_count = (inputs.window.minutes() + bucket_minutes - 1) / bucket_minutes;
    let mut flow_buckets: Vec<FlowBucket> = (0..bucket_count.max(1))
        .map(|i| FlowBucket {
            start: inputs.window.start + Duration::minutes(i * bucket_minutes),
            net_notional: 0.0,
        })
        .collect();

    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0u64;
    let mut notional = 0.0;
    let mut prev_price = None;
    let mut prev_side = TradeSide::Unknown;

    for tick in ticks {
        high = high.max(tick.price);
        low = low.min(tick.price);
        volume += tick.volume;
        notional += tick.notional;

        let side = tick.resolve_side(prev_price, prev_side);
        let signed = match side {
            TradeSide::Buy => tick.notional,
            TradeSide::Sell => -tick.notional,
            TradeSide::Unknown => 0.0,
        };
        let offset = (tick.timestamp.time() - inputs.window.start).num_minutes();
        let index = (offset / bucket_minutes).clamp(0, flow_buckets.len() as i64 - 1) as usize;
        flow_buckets[index].net_notional += signed;

        prev_price = Some(tick.price);
        prev_side = side;
    }

    let amplitude_ratio = (high - low) / reference_close;
    let volatility_ratio = match inputs.atr_fraction {
        Some(atr) if atr > 0.0 => amplitude_ratio / atr,
        _ => 0.0,
    };
    let volume_ratio = if inputs.historical_window_volume > 0.0 {
        volume as f64 / inputs.historical_window_volume
    } else {
        0.0
    };
    let net_flow: f64 = flow_buckets.iter().map(|b| b.net_notional).sum();
    let flow_to_market_cap = inputs
        .market_cap
        .filter(|cap| *cap > 0.0)
        .map(|cap| net_flow / cap);

    Some(TickMetrics {
        instrument: instrument.clone(),
        reference_close,
        open: first.price,
        high,
        low,
        last: last.price,
        tick_count: ticks.len(),
        cumulative_volume: volume,
        cumulative_notional: notional,
        amplitude_ratio,
        volatility_ratio,
        volume_ratio,
        flow_buckets,
        net_flow,
        flow_to_market_cap,
        synthetic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn tick(h: u32, m: u32, price: f64, side: TradeSide) -> Tick {
        Tick {
            timestamp: at(h, m),
            price,
            volume: 100,
            notional: 10.0,
            side,
        }
    }

    fn inputs() -> MetricInputs {
        MetricInputs {
            reference_close: 10.0,
            atr_fraction: Some(0.02),
            historical_window_volume: 200.0,
            market_cap: Some(1_000.0),
            window: TimeRange::new(
                NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ),
            bucket_minutes: 5,
        }
    }

    #[test]
    fn empty_series_has_no_metrics() {
        assert!(compute(&"x".into(), &[], &inputs(), false).is_none());
    }

    #[test]
    fn amplitude_volatility_and_volume_ratios() {
        let ticks = vec![
            tick(9, 30, 10.0, TradeSide::Buy),
            tick(9, 31, 10.4, TradeSide::Buy),
            tick(9, 40, 10.2, TradeSide::Sell),
        ];
        let m = compute(&"x".into(), &ticks, &inputs(), false).unwrap();
        assert!((m.amplitude_ratio - 0.04).abs() < 1e-9);
        assert!((m.volatility_ratio - 2.0).abs() < 1e-9);
        assert!((m.volume_ratio - 1.5).abs() < 1e-9);
        assert_eq!(m.high, 10.4);
        assert_eq!(m.last, 10.2);
    }

    #[test]
    fn flow_is_bucketed_and_summed() {
        let ticks = vec![
            tick(9, 30, 10.0, TradeSide::Buy),
            tick(9, 34, 10.1, TradeSide::Buy),
            tick(9, 36, 10.0, TradeSide::Sell),
            tick(9, 59, 10.0, TradeSide::Buy),
        ];
        let m = compute(&"x".into(), &ticks, &inputs(), false).unwrap();
        assert_eq!(m.flow_buckets.len(), 6);
        assert_eq!(m.flow_buckets[0].net_notional, 20.0);
        assert_eq!(m.flow_buckets[1].net_notional, -10.0);
        assert_eq!(m.flow_buckets[5].net_notional, 10.0);
        assert_eq!(m.net_flow, 20.0);
        assert!((m.flow_to_market_cap.unwrap() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn unknown_side_uses_tick_rule() {
        let ticks = vec![
            tick(9, 30, 10.0, TradeSide::Buy),
            tick(9, 31, 9.9, TradeSide::Unknown),
            tick(9, 32, 9.9, TradeSide::Unknown),
        ];
        let m = compute(&"x".into(), &ticks, &inputs(), false).unwrap();
        assert_eq!(m.net_flow, -10.0);
    }
}
