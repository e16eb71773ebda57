//! `lorabatch check-remote`.

use anyhow::{Context, Result};
use colored::Colorize;
use lorabatch_core::{EnvSettings, RcloneSync, RemoteSync};
use std::path::Path;

pub async fn execute(env_file: &Path) -> Result<()> {
    // Only the rclone section matters here, so no validation.
    let settings = EnvSettings::load_from_file(env_file)
        .with_context(|| format!("Failed to load settings from {}", env_file.display()))?;
    let paths = settings.resolve_paths();
    let rclone = &settings.rclone;
    let sync = RcloneSync::new(&rclone.binary, paths.program_directory.join(&rclone.config_file));

    println!("Checking remote {}...", rclone.remote_path.cyan());
    let output = sync.list_dirs(&rclone.remote_path).await;

    if output.success {
        println!("{} remote is reachable", "✓".green());
        if !output.stdout.trim().is_empty() {
            println!("{}", output.stdout.trim_end().dimmed());
        }
        return Ok(());
    }

    println!("{} remote check failed", "✗".red());
    println!("{}", output.stderr.trim_end());
    println!();
    println!("Reconnect the remote with:");
    println!(
        "  {}",
        format!(
            "{} config reconnect {} --config {}",
            rclone.binary,
            rclone.remote_root(),
            sync.config_file().display()
        )
        .bold()
    );
    anyhow::bail!("remote {} is not reachable", rclone.remote_path)
}
