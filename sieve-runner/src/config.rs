//! Session configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Validation runs on load and fails before any stage runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sieve_core::config::ConfigError;
use sieve_core::funnel::FunnelConfig;
use sieve_core::gatekeeper::GatekeeperConfig;
use sieve_core::refiner::RefinerConfig;

use crate::bus::BusConfig;
use crate::connection::ConnectionConfig;
use crate::engine::SessionConfig;
use crate::scoring::ScoringConfig;

#[derive(Debug, Error)]
pub enum SieveConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SieveConfig {
    /// Master seed for every synthetic substitute.
    pub seed: u64,
    /// Overrides the funnel and refiner worker counts when set.
    pub workers: Option<usize>,
    pub funnel: FunnelConfig,
    pub refiner: RefinerConfig,
    pub gatekeeper: GatekeeperConfig,
    pub bus: BusConfig,
    pub session: SessionConfig,
    pub scoring: ScoringConfig,
    pub connection: ConnectionConfig,
}

impl Default for SieveConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            workers: None,
            funnel: FunnelConfig::default(),
            refiner: RefinerConfig::default(),
            gatekeeper: GatekeeperConfig::default(),
            bus: BusConfig::default(),
            session: SessionConfig::default(),
            scoring: ScoringConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl SieveConfig {
    pub fn from_file(path: &Path) -> Result<Self, SieveConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SieveConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, SieveConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(workers) = self.workers {
            sieve_core::config::require_at_least("workers", workers, 1)?;
        }
        self.funnel_config().validate()?;
        self.refiner_config().validate()?;
        self.gatekeeper.validate()?;
        self.bus.validate()?;
        self.session.validate()?;
        self.scoring.validate()?;
        self.connection.validate()?;
        if self.session.snapshot_start < self.funnel.morning_window.start {
            return Err(ConfigError::Schedule(format!(
                "snapshot_start {} precedes the morning window start {}",
                self.session.snapshot_start, self.funnel.morning_window.start
            )));
        }
        Ok(())
    }

    /// Funnel settings with the global worker override applied.
    pub fn funnel_config(&self) -> FunnelConfig {
        FunnelConfig {
            workers: self.workers.unwrap_or(self.funnel.workers),
            ..self.funnel.clone()
        }
    }

    /// Refiner settings with the global worker override applied.
    pub fn refiner_config(&self) -> RefinerConfig {
        RefinerConfig {
            workers: self.workers.unwrap_or(self.refiner.workers),
            ..self.refiner.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_the_default() {
        assert_eq!(SieveConfig::from_toml("").unwrap(), SieveConfig::default());
    }

    #[test]
    fn default_survives_toml_round_trip() {
        let text = SieveConfig::default().to_toml().unwrap();
        assert!(text.contains("[funnel]"));
        assert!(text.contains("[session]"));
        assert_eq!(SieveConfig::from_toml(&text).unwrap(), SieveConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = SieveConfig::from_toml(
            r#"
            seed = 7
            workers = 2

            [funnel]
            liquidity_floor = 5000.0

            [bus]
            capacity = 128
            "#,
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.funnel.liquidity_floor, 5000.0);
        assert_eq!(config.funnel.volume_ratio_floor, 3.0);
        assert_eq!(config.bus.capacity, 128);
        assert_eq!(config.funnel_config().workers, 2);
        assert_eq!(config.refiner_config().workers, 2);
    }

    #[test]
    fn weights_not_summing_to_one_fail_on_load() {
        let err = SieveConfig::from_toml(
            r#"
            [refiner.weights]
            amplitude = 0.5
            volatility = 0.5
            volume = 0.5
            flow = 0.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SieveConfigError::Invalid(ConfigError::WeightsDoNotSumToOne { .. })
        ));
    }

    #[test]
    fn zero_bus_capacity_fails_on_load() {
        let err = SieveConfig::from_toml("[bus]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, SieveConfigError::Invalid(ConfigError::TooSmall { .. })));
    }

    #[test]
    fn out_of_order_schedule_fails_on_load() {
        let err = SieveConfig::from_toml("[session]\npre_market_start = \"10:00:00\"\n").unwrap_err();
        assert!(matches!(err, SieveConfigError::Invalid(ConfigError::Schedule(_))));
    }
}
