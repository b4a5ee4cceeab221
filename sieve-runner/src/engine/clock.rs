//! Session clocks.
//!
//! The engine reads session time from a [`SessionClock`] and converts
//! session-time deadlines to wall-clock waits through it, so the same
//! schedule runs against local time or a shifted, sped-up clock.

use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};

pub trait SessionClock: Send + Sync {
    /// Current session time.
    fn now(&self) -> NaiveDateTime;

    /// Wall-clock time until `target` is reached; zero if already past.
    fn wall_until(&self, target: NaiveDateTime) -> Duration;
}

/// Local wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl SessionClock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn wall_until(&self, target: NaiveDateTime) -> Duration {
        (target - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Session time starting at `origin` when created and advancing `speed`
/// times faster than the wall clock.
#[derive(Debug, Clone)]
pub struct ShiftedClock {
    origin: NaiveDateTime,
    started: Instant,
    speed: f64,
}

impl ShiftedClock {
    pub fn new(origin: NaiveDateTime, speed: f64) -> Self {
        Self {
            origin,
            started: Instant::now(),
            speed: if speed.is_finite() && speed > 0.0 { speed } else { 1.0 },
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl SessionClock for ShiftedClock {
    fn now(&self) -> NaiveDateTime {
        let session_ms = self.started.elapsed().as_secs_f64() * self.speed * 1_000.0;
        self.origin + chrono::Duration::milliseconds(session_ms as i64)
    }

    fn wall_until(&self, target: NaiveDateTime) -> Duration {
        match (target - self.now()).to_std() {
            Ok(session) => session.div_f64(self.speed),
            Err(_) => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn origin() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    #[test]
    fn shifted_clock_scales_waits() {
        let clock = ShiftedClock::new(origin(), 600.0);
        let wait = clock.wall_until(origin() + chrono::Duration::minutes(10));
        assert!(wait <= Duration::from_secs(1));
        assert!(wait > Duration::from_millis(900));
    }

    #[test]
    fn past_target_waits_zero() {
        let clock = ShiftedClock::new(origin(), 1.0);
        assert_eq!(clock.wall_until(origin() - chrono::Duration::minutes(1)), Duration::ZERO);
    }

    #[test]
    fn non_positive_speed_falls_back_to_real_time() {
        assert_eq!(ShiftedClock::new(origin(), 0.0).speed(), 1.0);
    }
}
