//! Ticks and the live tick event delivered over the bus.

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use super::InstrumentId;

/// Aggressor side of a trade print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
    /// Provider did not report a side; classified by the tick rule.
    Unknown,
}

/// A single trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub volume: u64,
    pub notional: f64,
    pub side: TradeSide,
}

impl Tick {
    /// Resolve the aggressor side, falling back to the tick rule
    /// (uptick = buy, downtick = sell, unchanged = previous resolved side).
    pub fn resolve_side(&self, prev_price: Option<f64>, prev_side: TradeSide) -> TradeSide {
        match self.side {
            TradeSide::Unknown => match prev_price {
                Some(p) if self.price > p => TradeSide::Buy,
                Some(p) if self.price < p => TradeSide::Sell,
                _ => prev_side,
            },
            side => side,
        }
    }
}

/// Intraday time range, inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        t >= self.start && t < self.end
    }

    /// Length of the range in whole minutes (zero if inverted).
    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes().max(0)
    }
}

/// Live tick as published on the event bus.
///
/// Carries the session OHLC and reference close so the scoring engine does not
/// need to look anything up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub instrument: InstrumentId,
    pub price: f64,
    pub volume: u64,
    pub notional: f64,
    pub side: TradeSide,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub reference_close: f64,
    pub ingested_at: NaiveDateTime,
}

impl TickEvent {
    /// Percentage change against the reference close.
    pub fn change_pct(&self) -> f64 {
        if self.reference_close > 0.0 {
            (self.price / self.reference_close - 1.0) * 100.0
        } else {
            0.0
        }
    }

    /// Signed notional: positive for buyer-initiated prints.
    pub fn signed_notional(&self) -> f64 {
        match self.side {
            TradeSide::Buy => self.notional,
            TradeSide::Sell => -self.notional,
            TradeSide::Unknown => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(9, 31, 0)
            .unwrap()
    }

    #[test]
    fn tick_rule_classifies_unknown_side() {
        let tick = Tick {
            timestamp: ts(),
            price: 10.02,
            volume: 100,
            notional: 1002.0,
            side: TradeSide::Unknown,
        };
        assert_eq!(tick.resolve_side(Some(10.0), TradeSide::Sell), TradeSide::Buy);
        assert_eq!(tick.resolve_side(Some(10.05), TradeSide::Buy), TradeSide::Sell);
        assert_eq!(tick.resolve_side(Some(10.02), TradeSide::Sell), TradeSide::Sell);
    }

    #[test]
    fn reported_side_wins_over_tick_rule() {
        let tick = Tick {
            timestamp: ts(),
            price: 9.0,
            volume: 100,
            notional: 900.0,
            side: TradeSide::Buy,
        };
        assert_eq!(tick.resolve_side(Some(10.0), TradeSide::Sell), TradeSide::Buy);
    }

    #[test]
    fn time_range_contains_is_half_open() {
        let range = TimeRange::new(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        );
        assert!(range.contains(NaiveTime::from_hms_opt(9, 30, 0).unwrap()));
        assert!(!range.contains(NaiveTime::from_hms_opt(10, 0, 0).unwrap()));
        assert_eq!(range.minutes(), 30);
    }
}
