//! `accrual init` command implementation

use accrual_core::AccrualConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use super::CONFIG_FILE_NAME;

pub fn run(output: PathBuf, force: bool) -> Result<()> {
    fs::create_dir_all(&output)
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let config_path = output.join(CONFIG_FILE_NAME);
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let config_json = serde_json::to_string_pretty(&AccrualConfig::default())?;
    fs::write(&config_path, config_json).context("Failed to write config file")?;

    println!("Created configuration at {}", config_path.display());
    println!();
    println!("Next steps:");
    println!(
        "   accrual --config {} simulate --scenario scenario.json",
        config_path.display()
    );
    Ok(())
}
