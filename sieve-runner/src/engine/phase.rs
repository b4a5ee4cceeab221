//! Session phases and the daily schedule.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use sieve_core::config::{require_at_least, ConfigError};

/// Session phase. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    PreMarket,
    SnapshotFilter,
    FireControl,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreMarket => "pre_market",
            Self::SnapshotFilter => "snapshot_filter",
            Self::FireControl => "fire_control",
            Self::Closed => "closed",
        })
    }
}

/// Daily schedule and snapshot loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// When the pre-market watchlist is built.
    pub pre_market_start: NaiveTime,
    /// Wall-clock offset at which the snapshot loop starts.
    pub snapshot_start: NaiveTime,
    pub snapshot_interval_secs: u64,
    pub snapshot_repeats: usize,
    /// Watchlist size the snapshot loop shrinks toward.
    pub target_watchlist: usize,
    pub close: NaiveTime,
    /// Instrument whose rank and trace are always reported.
    pub tracked: Option<String>,
    /// Optional JSONL mirror of the decision log.
    pub decision_log: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
        Self {
            pre_market_start: t(9, 15),
            snapshot_start: t(9, 35),
            snapshot_interval_secs: 60,
            snapshot_repeats: 5,
            target_watchlist: 50,
            close: t(15, 0),
            tracked: None,
            decision_log: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pre_market_start > self.snapshot_start {
            return Err(ConfigError::Schedule(format!(
                "pre_market_start {} after snapshot_start {}",
                self.pre_market_start, self.snapshot_start
            )));
        }
        require_at_least("session.snapshot_repeats", self.snapshot_repeats, 1)?;
        match self.snapshot_loop_end() {
            Some(end) if end <= self.close => {}
            Some(end) => {
                return Err(ConfigError::Schedule(format!(
                    "snapshot loop ends at {end} after close {}",
                    self.close
                )))
            }
            None => {
                return Err(ConfigError::Schedule(format!(
                    "snapshot loop of {} x {}s runs past midnight",
                    self.snapshot_repeats, self.snapshot_interval_secs
                )))
            }
        }
        require_at_least("session.target_watchlist", self.target_watchlist, 1)?;
        if self.snapshot_interval_secs == 0 {
            return Err(ConfigError::NotPositive {
                field: "session.snapshot_interval_secs",
                value: 0.0,
            });
        }
        Ok(())
    }

    /// Start of the last snapshot iteration, or `None` if it falls on a
    /// later day.
    fn snapshot_loop_end(&self) -> Option<NaiveTime> {
        let span = u32::try_from(self.snapshot_interval_secs)
            .ok()?
            .checked_mul(u32::try_from(self.snapshot_repeats.saturating_sub(1)).ok()?)?;
        let end = self.snapshot_start.num_seconds_from_midnight().checked_add(span)?;
        NaiveTime::from_num_seconds_from_midnight_opt(end, self.snapshot_start.nanosecond())
    }

    /// Scheduled start of snapshot iteration `i`.
    pub fn iteration_at(&self, date: NaiveDate, i: usize) -> NaiveDateTime {
        date.and_time(self.snapshot_start)
            + chrono::Duration::seconds(self.snapshot_interval_secs as i64 * i as i64)
    }

    /// Stage 3 cap for snapshot iteration `i`: linear from `max_output`
    /// down to the target, reaching it on the last iteration.
    pub fn cap_for_iteration(&self, i: usize, max_output: usize) -> usize {
        let target = self.target_watchlist.min(max_output);
        let span = (max_output - target) as f64;
        let progress = (i + 1) as f64 / self.snapshot_repeats.max(1) as f64;
        let cap = max_output as f64 - span * progress.min(1.0);
        (cap.round() as usize).max(target)
    }

    /// Phase the session should start in at wall time `now`.
    pub fn entry_phase(&self, now: NaiveTime) -> SessionPhase {
        if now >= self.close {
            SessionPhase::Closed
        } else if now > self.snapshot_start {
            SessionPhase::FireControl
        } else {
            SessionPhase::PreMarket
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn phases_are_ordered() {
        assert!(SessionPhase::PreMarket < SessionPhase::SnapshotFilter);
        assert!(SessionPhase::SnapshotFilter < SessionPhase::FireControl);
        assert!(SessionPhase::FireControl < SessionPhase::Closed);
    }

    #[test]
    fn cap_shrinks_to_target() {
        let config = SessionConfig::default();
        let caps: Vec<usize> = (0..5).map(|i| config.cap_for_iteration(i, 200)).collect();
        assert_eq!(caps, vec![170, 140, 110, 80, 50]);
    }

    #[test]
    fn cap_never_exceeds_max_output() {
        let config = SessionConfig {
            target_watchlist: 500,
            ..SessionConfig::default()
        };
        assert_eq!(config.cap_for_iteration(0, 200), 200);
    }

    #[test]
    fn entry_phase_by_time() {
        let config = SessionConfig::default();
        assert_eq!(config.entry_phase(t(8, 0)), SessionPhase::PreMarket);
        assert_eq!(config.entry_phase(t(9, 35)), SessionPhase::PreMarket);
        assert_eq!(config.entry_phase(t(11, 0)), SessionPhase::FireControl);
        assert_eq!(config.entry_phase(t(15, 0)), SessionPhase::Closed);
    }

    #[test]
    fn rejects_snapshot_loop_past_close() {
        let config = SessionConfig {
            close: t(9, 37),
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_snapshot_loop_wrapping_past_midnight() {
        // 9:35 + 24h lands back on 9:35, before close
        let config = SessionConfig {
            snapshot_interval_secs: 86_400,
            snapshot_repeats: 2,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Schedule(_))));

        let huge = SessionConfig {
            snapshot_interval_secs: u64::MAX,
            ..SessionConfig::default()
        };
        assert!(matches!(huge.validate(), Err(ConfigError::Schedule(_))));
    }
}
