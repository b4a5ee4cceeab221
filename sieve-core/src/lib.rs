//! Sieve Core — session watchlist funnel, tick refiner, and trade gatekeeper.
//!
//! This crate contains the stateless heart of the session pipeline:
//! - Domain types (instruments, bars, ticks, signals)
//! - Quote source traits, provider guard, and seeded synthetic fallback
//! - Three-stage funnel filter with per-instrument tracing
//! - Tick-level refiner with composite ranking
//! - Rule-chain trade gatekeeper

pub mod config;
pub mod data;
pub mod domain;
pub mod funnel;
pub mod gatekeeper;
pub mod refiner;
pub mod rng;

pub use config::ConfigError;
