//! CLI Command Implementations

pub mod init;
pub mod simulate;

use accrual_core::AccrualConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Default config file name written by `accrual init`.
pub const CONFIG_FILE_NAME: &str = "accrual.json";

/// Load the config file if one was given, otherwise defaults overlaid with `ACCRUAL_*`
/// environment variables.
pub fn load_config(path: Option<&Path>) -> Result<AccrualConfig> {
    let config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: AccrualConfig = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            config.validate()?;
            config
        }
        None => AccrualConfig::from_env()?,
    };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_file_fills_defaults() {
        let dir = std::env::temp_dir().join(format!("accrual-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "pools": { "max_pools": 8 } }"#).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.pools.max_pools, 8);
        assert_eq!(config.pools.max_deposit_fee_bps, 400);
        assert_eq!(config.logging.level, "info");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn invalid_config_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("accrual-badcfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{ "logging": { "level": "loud" } }"#).unwrap();

        assert!(load_config(Some(&path)).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
