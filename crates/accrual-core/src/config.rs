//! Configuration for the accrual engines.
//!
//! # Configuration Sources
//!
//! - Environment variables (prefixed with `ACCRUAL_`)
//! - JSON files (loaded by the CLI)
//! - Programmatic defaults and the builder
//!
//! # Example
//!
//! ```rust,ignore
//! use accrual_core::config::AccrualConfig;
//!
//! let config = AccrualConfig::builder()
//!     .private_staking_mode(true)
//!     .max_deposit_fee_bps(250)
//!     .build()?;
//! ```

use crate::math::BPS_U16;
use crate::{AccrualError, Result};
use serde::{Deserialize, Serialize};

/// Complete accrual configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualConfig {
    /// Access gates of the single-stream tracker.
    pub staking: StakingConfig,

    /// Safety bounds and fee caps of the multi-pool engine.
    pub pools: PoolBoundsConfig,

    /// Logging configuration (consumed by binaries).
    pub logging: LoggingConfig,
}

impl AccrualConfig {
    pub fn builder() -> AccrualConfigBuilder {
        AccrualConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// - `ACCRUAL_PRIVATE_STAKING` / `ACCRUAL_PRIVATE_CLAIMING` / `ACCRUAL_PRIVATE_TRANSFER`
    /// - `ACCRUAL_MAX_DEPOSIT_FEE_BPS`
    /// - `ACCRUAL_MAX_POOLS` / `ACCRUAL_MAX_REWARD_TOKENS`
    /// - `ACCRUAL_LOG_LEVEL`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<bool>("ACCRUAL_PRIVATE_STAKING")? {
            config.staking.private_staking_mode = v;
        }
        if let Some(v) = env_parse::<bool>("ACCRUAL_PRIVATE_CLAIMING")? {
            config.staking.private_claiming_mode = v;
        }
        if let Some(v) = env_parse::<bool>("ACCRUAL_PRIVATE_TRANSFER")? {
            config.staking.private_transfer_mode = v;
        }
        if let Some(v) = env_parse::<u16>("ACCRUAL_MAX_DEPOSIT_FEE_BPS")? {
            config.pools.max_deposit_fee_bps = v;
        }
        if let Some(v) = env_parse::<usize>("ACCRUAL_MAX_POOLS")? {
            config.pools.max_pools = v;
        }
        if let Some(v) = env_parse::<usize>("ACCRUAL_MAX_REWARD_TOKENS")? {
            config.pools.max_reward_tokens = v;
        }
        if let Ok(level) = std::env::var("ACCRUAL_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.max_deposit_fee_bps > BPS_U16 {
            return Err(AccrualError::Config(format!(
                "max_deposit_fee_bps must be at most {BPS_U16}"
            )));
        }
        if self.pools.max_pools == 0 || self.pools.max_pools > PoolBoundsConfig::HARD_MAX_POOLS {
            return Err(AccrualError::Config(format!(
                "max_pools must be between 1 and {}",
                PoolBoundsConfig::HARD_MAX_POOLS
            )));
        }
        if self.pools.max_reward_tokens == 0
            || self.pools.max_reward_tokens > PoolBoundsConfig::HARD_MAX_REWARD_TOKENS
        {
            return Err(AccrualError::Config(format!(
                "max_reward_tokens must be between 1 and {}",
                PoolBoundsConfig::HARD_MAX_REWARD_TOKENS
            )));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(AccrualError::Config(format!("unknown log level: {other}")));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| AccrualError::Config(format!("Invalid {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Handler-only gates of the single-stream tracker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StakingConfig {
    /// Only handlers may stake / unstake.
    pub private_staking_mode: bool,

    /// Only handlers may claim.
    pub private_claiming_mode: bool,

    /// Only handlers may move staked shares between accounts.
    pub private_transfer_mode: bool,
}

/// Multi-pool engine bounds.
///
/// Every sync walks pools x reward tokens, so both are bounded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolBoundsConfig {
    /// Upper bound for any pool's deposit fee.
    pub max_deposit_fee_bps: u16,

    pub max_pools: usize,

    pub max_reward_tokens: usize,
}

impl PoolBoundsConfig {
    pub const HARD_MAX_POOLS: usize = 1024;
    pub const HARD_MAX_REWARD_TOKENS: usize = 64;
}

impl Default for PoolBoundsConfig {
    fn default() -> Self {
        Self {
            max_deposit_fee_bps: 400,
            max_pools: 64,
            max_reward_tokens: 16,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// JSON output format.
    pub json_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_output: false,
        }
    }
}

/// Builder for AccrualConfig.
#[derive(Default)]
pub struct AccrualConfigBuilder {
    config: AccrualConfig,
}

impl AccrualConfigBuilder {
    pub fn private_staking_mode(mut self, enabled: bool) -> Self {
        self.config.staking.private_staking_mode = enabled;
        self
    }

    pub fn private_claiming_mode(mut self, enabled: bool) -> Self {
        self.config.staking.private_claiming_mode = enabled;
        self
    }

    pub fn private_transfer_mode(mut self, enabled: bool) -> Self {
        self.config.staking.private_transfer_mode = enabled;
        self
    }

    pub fn max_deposit_fee_bps(mut self, bps: u16) -> Self {
        self.config.pools.max_deposit_fee_bps = bps;
        self
    }

    pub fn max_pools(mut self, max: usize) -> Self {
        self.config.pools.max_pools = max;
        self
    }

    pub fn max_reward_tokens(mut self, max: usize) -> Self {
        self.config.pools.max_reward_tokens = max;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.config.logging.json_output = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<AccrualConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(AccrualConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = AccrualConfig::builder()
            .private_staking_mode(true)
            .max_deposit_fee_bps(250)
            .max_pools(8)
            .log_level("debug")
            .build()
            .expect("should build");

        assert!(config.staking.private_staking_mode);
        assert!(!config.staking.private_claiming_mode);
        assert_eq!(config.pools.max_deposit_fee_bps, 250);
        assert_eq!(config.pools.max_pools, 8);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn fee_cap_above_100_percent_rejected() {
        assert!(AccrualConfig::builder().max_deposit_fee_bps(10_001).build().is_err());
    }

    #[test]
    fn zero_pools_rejected() {
        assert!(AccrualConfig::builder().max_pools(0).build().is_err());
    }

    #[test]
    fn unknown_log_level_rejected() {
        assert!(AccrualConfig::builder().log_level("loud").build().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: AccrualConfig =
            serde_json::from_str(r#"{"staking":{"private_claiming_mode":true}}"#).unwrap();
        assert!(config.staking.private_claiming_mode);
        assert_eq!(config.pools, PoolBoundsConfig::default());
    }
}
