//! `lorabatch download-model`.

use anyhow::{Context, Result};
use colored::Colorize;
use lorabatch_core::{EnvSettings, ModelDownloader};
use std::path::Path;
use tracing::{error, warn};

/// Environment variable consulted when `[modeldownload].token` is unset.
const TOKEN_ENV: &str = "HF_TOKEN";

pub async fn execute(env_file: &Path) -> Result<()> {
    // Only the paths and modeldownload sections matter here, so no validation.
    let settings = EnvSettings::load_from_file(env_file)
        .with_context(|| format!("Failed to load settings from {}", env_file.display()))?;
    let paths = settings.resolve_paths();
    let download = &settings.modeldownload;

    let Some(filename) =
        settings.paths.pretrained_model_name_or_path.as_deref().filter(|name| !name.trim().is_empty())
    else {
        anyhow::bail!("paths.pretrained_model_name_or_path is not set; it names the file to download");
    };
    if download.models.is_empty() {
        anyhow::bail!("no models listed in [modeldownload].models");
    }

    let token = download
        .token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty()));
    if token.is_none() {
        warn!("no Hugging Face token configured, private repositories will fail");
    }
    let downloader = ModelDownloader::new(download, token);

    println!("Downloading {} into {}", filename.cyan(), paths.model_directory.display());
    let mut failed = 0usize;
    for source in &download.models {
        match downloader.download(&source.repo_id, filename, &paths.model_directory).await {
            Ok(path) => println!("  {} {} -> {}", "✓".green(), source.repo_id, path.display()),
            Err(e) => {
                error!(repo = %source.repo_id, "model download failed: {}", e);
                println!("  {} {} ({})", "✗".red(), source.repo_id, e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} model downloads failed", failed, download.models.len());
    }
    Ok(())
}
