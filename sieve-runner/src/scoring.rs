//! Live per-instrument scoring over the tick stream.
//!
//! A [`ScoringEngine`] folds each delivered [`TickEvent`] into per-instrument
//! state and returns a reading once enough ticks have been seen. The
//! momentum scorer's bonus, decay, and penalty terms are all configuration.

use std::collections::HashMap;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use sieve_core::config::{require_non_negative, require_positive, ConfigError};
use sieve_core::domain::{InstrumentId, SituationLabel, TickEvent};

/// One scoring engine output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReading {
    /// Signal strength in `[0, 1]`.
    pub score: f64,
    pub labels: Vec<SituationLabel>,
    /// Risk estimate in `[0, 1]`.
    pub risk_score: f64,
}

/// Scoring engine driven by the live tick stream.
///
/// Events for one instrument arrive in delivery order; there is no ordering
/// across instruments.
pub trait ScoringEngine: Send {
    fn on_tick(&mut self, event: &TickEvent) -> Option<ScoreReading>;

    /// Forget all accumulated state.
    fn reset(&mut self);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Score at or above which a signal is raised.
    pub signal_threshold: f64,
    /// Percentage change mapping to a full base score.
    pub momentum_scale_pct: f64,
    /// Bonus per consecutive uptick.
    pub consecutive_bonus: f64,
    pub max_consecutive_bonus: f64,
    /// Score lost per minute since the session high was set.
    pub decay_per_minute: f64,
    pub max_decay: f64,
    /// Score lost per percent of pullback from the session high.
    pub drawdown_penalty: f64,
    /// Daily price limit, percent of reference close.
    pub limit_pct: f64,
    pub high_open_pct: f64,
    /// Percent above the session open counted as overextended.
    pub overextended_pct: f64,
    /// Pullback from a strong session high counted as a failed breakout.
    pub failed_breakout_pct: f64,
    pub late_session_cutoff: NaiveTime,
    /// Ticks required before the first reading.
    pub min_ticks: usize,
    /// Per-instrument quiet period after a signal.
    pub cooldown_secs: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            signal_threshold: 0.7,
            momentum_scale_pct: 5.0,
            consecutive_bonus: 0.05,
            max_consecutive_bonus: 0.15,
            decay_per_minute: 0.01,
            max_decay: 0.2,
            drawdown_penalty: 0.1,
            limit_pct: 9.9,
            high_open_pct: 5.0,
            overextended_pct: 7.0,
            failed_breakout_pct: 2.0,
            late_session_cutoff: NaiveTime::from_hms_opt(14, 30, 0).unwrap_or_default(),
            min_ticks: 3,
            cooldown_secs: 120,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("scoring.signal_threshold", self.signal_threshold)?;
        if self.signal_threshold > 1.0 {
            return Err(ConfigError::NotPositive {
                field: "scoring.signal_threshold (at most 1.0)",
                value: self.signal_threshold,
            });
        }
        require_positive("scoring.momentum_scale_pct", self.momentum_scale_pct)?;
        require_non_negative("scoring.consecutive_bonus", self.consecutive_bonus)?;
        require_non_negative("scoring.max_consecutive_bonus", self.max_consecutive_bonus)?;
        require_non_negative("scoring.decay_per_minute", self.decay_per_minute)?;
        require_non_negative("scoring.max_decay", self.max_decay)?;
        require_non_negative("scoring.drawdown_penalty", self.drawdown_penalty)?;
        require_positive("scoring.limit_pct", self.limit_pct)?;
        require_positive("scoring.high_open_pct", self.high_open_pct)?;
        require_positive("scoring.overextended_pct", self.overextended_pct)?;
        require_positive("scoring.failed_breakout_pct", self.failed_breakout_pct)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct InstrumentState {
    ticks: usize,
    last_price: f64,
    consecutive_up: usize,
    session_high: f64,
    high_at: NaiveDateTime,
    total_volume: u64,
}

/// Momentum scorer: percent change against the reference close, adjusted
/// for uptick runs, staleness of the high, and pullback.
pub struct MomentumScorer {
    config: ScoringConfig,
    state: HashMap<InstrumentId, InstrumentState>,
}

impl MomentumScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            state: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    fn labels(&self, event: &TickEvent, state: &InstrumentState) -> Vec<SituationLabel> {
        let c = &self.config;
        let mut labels = Vec::new();
        let reference = event.reference_close;
        if reference > 0.0 {
            let up_limit = reference * (1.0 + c.limit_pct / 100.0);
            let down_limit = reference * (1.0 - c.limit_pct / 100.0);
            if event.price >= up_limit && event.price >= event.high {
                labels.push(SituationLabel::LimitLocked);
            }
            if event.price <= down_limit {
                labels.push(SituationLabel::LimitDown);
            }
            if (event.open / reference - 1.0) * 100.0 >= c.high_open_pct {
                labels.push(SituationLabel::HighOpen);
            }
        }
        if event.ingested_at.time() >= c.late_session_cutoff {
            labels.push(SituationLabel::LateSessionChase);
        }
        if event.open > 0.0 && (event.price / event.open - 1.0) * 100.0 >= c.overextended_pct {
            labels.push(SituationLabel::Overextended);
        }
        let avg_volume = state.total_volume as f64 / state.ticks as f64;
        if event.price > state.last_price && (event.volume as f64) < 0.5 * avg_volume {
            labels.push(SituationLabel::VolumeDivergence);
        }
        if reference > 0.0 && state.session_high > 0.0 {
            let high_change = (state.session_high / reference - 1.0) * 100.0;
            let pullback = (1.0 - event.price / state.session_high) * 100.0;
            if high_change >= c.momentum_scale_pct / 2.0 && pullback >= c.failed_breakout_pct {
                labels.push(SituationLabel::FailedBreakout);
            }
        }
        labels
    }
}

impl ScoringEngine for MomentumScorer {
    fn on_tick(&mut self, event: &TickEvent) -> Option<ScoreReading> {
        let state = self
            .state
            .entry(event.instrument.clone())
            .or_insert_with(|| InstrumentState {
                ticks: 0,
                last_price: event.price,
                consecutive_up: 0,
                session_high: event.price,
                high_at: event.ingested_at,
                total_volume: 0,
            });

        let prev = state.clone();
        state.ticks += 1;
        state.total_volume += event.volume;
        if state.ticks > 1 && event.price > state.last_price {
            state.consecutive_up += 1;
        } else if event.price < state.last_price {
            state.consecutive_up = 0;
        }
        if event.price > state.session_high {
            state.session_high = event.price;
            state.high_at = event.ingested_at;
        }
        state.last_price = event.price;
        let current = state.clone();

        if current.ticks < self.config.min_ticks {
            return None;
        }

        let c = &self.config;
        let base = (event.change_pct() / c.momentum_scale_pct).clamp(0.0, 1.0);
        let bonus = (current.consecutive_up as f64 * c.consecutive_bonus).min(c.max_consecutive_bonus);
        let stale_minutes = (event.ingested_at - current.high_at).num_seconds().max(0) as f64 / 60.0;
        let decay = (stale_minutes * c.decay_per_minute).min(c.max_decay);
        let drawdown_pct = if current.session_high > 0.0 {
            (1.0 - event.price / current.session_high).max(0.0) * 100.0
        } else {
            0.0
        };
        let penalty = drawdown_pct * c.drawdown_penalty;
        let score = (base + bonus - decay - penalty).clamp(0.0, 1.0);

        let labels = self.labels(event, &InstrumentState { last_price: prev.last_price, ..current });
        let cautionary = labels.iter().filter(|l| l.is_cautionary()).count();
        let risk_score = (0.4 * (event.change_pct().abs() / c.limit_pct)
            + 0.2 * cautionary as f64
            + 0.4 * (drawdown_pct / c.failed_breakout_pct).min(1.0))
        .clamp(0.0, 1.0);

        Some(ScoreReading {
            score,
            labels,
            risk_score,
        })
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}
