//! Configuration validation errors shared by the core components.

use thiserror::Error;

/// A configuration value is out of range. Raised before any stage runs.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("refiner weights sum to {sum:.9}, expected 1.0 ± {tolerance}")]
    WeightsDoNotSumToOne { sum: f64, tolerance: f64 },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be a finite, non-negative number, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        value: usize,
        min: usize,
    },

    #[error("inflow band out of order: {0}")]
    InflowBand(String),

    #[error("time window {field} is empty or inverted")]
    EmptyWindow { field: &'static str },

    #[error("session schedule out of order: {0}")]
    Schedule(String),

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

/// Tolerance on the refiner weight sum.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

pub fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

pub fn require_non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative { field, value })
    }
}

pub fn require_at_least(
    field: &'static str,
    value: usize,
    min: usize,
) -> Result<(), ConfigError> {
    if value >= min {
        Ok(())
    } else {
        Err(ConfigError::TooSmall { field, value, min })
    }
}

/// Build a bounded rayon pool for per-instrument fetches.
pub(crate) fn build_pool(workers: usize, name: &'static str) -> Result<rayon::ThreadPool, ConfigError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(move |i| format!("{name}-{i}"))
        .build()
        .map_err(|e| ConfigError::WorkerPool(e.to_string()))
}
