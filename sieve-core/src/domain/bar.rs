//! Bar — daily or intraday OHLCV aggregate.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Bar granularity requested from a quote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Granularity {
    Minute,
    FiveMinute,
    Daily,
}

impl Granularity {
    pub fn minutes(&self) -> i64 {
        match self {
            Self::Minute => 1,
            Self::FiveMinute => 5,
            Self::Daily => 240,
        }
    }
}

/// OHLCV bar with traded notional.
///
/// `timestamp` is the bar open time; for daily bars it is midnight of the
/// trading date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    /// Traded value in currency units.
    pub notional: f64,
}

impl Bar {
    /// Returns true if any price field is NaN (void bar).
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic sanity check: high bounds open/close from above, low from below.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.notional >= 0.0
    }

    /// True range against the previous bar's close (Wilder).
    pub fn true_range(&self, prev_close: Option<f64>) -> f64 {
        let hl = self.high - self.low;
        match prev_close {
            Some(pc) => hl.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => hl,
        }
    }
}

/// Average true range over a bar window (simple mean, not smoothed).
///
/// Returns `None` for an empty window.
pub fn average_true_range(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }
    let mut prev_close = None;
    let mut sum = 0.0;
    for bar in bars {
        sum += bar.true_range(prev_close);
        prev_close = Some(bar.close);
    }
    Some(sum / bars.len() as f64)
}
