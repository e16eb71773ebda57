//! CLI command implementations.

pub mod download;
pub mod remote;
pub mod run;

use anyhow::{Context, Result};
use lorabatch_core::EnvSettings;
use std::path::Path;

/// Load and validate the environment settings document.
pub fn load_settings(env_file: &Path) -> Result<EnvSettings> {
    let settings = EnvSettings::load_from_file(env_file)
        .with_context(|| format!("Failed to load settings from {}", env_file.display()))?;
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}
