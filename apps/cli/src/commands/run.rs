//! `lorabatch run`: the full batch pipeline.

use super::load_settings;
use anyhow::{Context, Result};
use colored::Colorize;
use lorabatch_core::job_config::{load_job_config, merge_into};
use lorabatch_core::{
    diff, discover_work_units, extract_archives, EnvSettings, InterruptGate, JobConfig, RcloneSync,
    RemoteSync, ResolvedPaths, ResourceStager,
};
use lorabatch_orchestrator::launch::CUDA_ALLOC_ENV;
use lorabatch_orchestrator::{
    BatchDriver, BatchOptions, BatchReport, JobRunner, LaunchCommand, RecoveryPolicy, StreamMultiplexer,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct RunArgs {
    pub env_file: PathBuf,
    pub add: Option<PathBuf>,
    pub test: bool,
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let settings = load_settings(&args.env_file)?;
    let paths = settings.resolve_paths();
    let suffix = settings.effective_output_suffix(args.add.as_deref());

    print_header(&settings, &paths, &suffix, &args);

    if !paths.working_directory.is_dir() {
        anyhow::bail!("working directory {} not found", paths.working_directory.display());
    }
    for dir in [&paths.output_dir, &paths.temp_directory] {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let rclone = &settings.rclone;
    let sync = RcloneSync::new(&rclone.binary, paths.program_directory.join(&rclone.config_file));
    prepare_inputs(&settings, &paths, &sync).await?;

    let discovery = discover_work_units(
        &paths.working_directory,
        &settings.batch.reserved_prefix,
        &suffix,
        &paths.temp_directory,
    )
    .context("Failed to list the working directory")?;
    print_discovery(&discovery);

    let base_config = load_base_config(&settings, &paths, args.add.as_deref())?;

    let mut multiplexer = StreamMultiplexer::new()
        .with_env(CUDA_ALLOC_ENV.0, CUDA_ALLOC_ENV.1)
        .with_grace_period(settings.process.grace_period());
    if paths.kohya_directory.is_dir() {
        multiplexer = multiplexer.with_working_dir(paths.kohya_directory.clone());
    } else {
        warn!(path = %paths.kohya_directory.display(), "kohya directory not found, running from the current directory");
    }

    let recovery = RecoveryPolicy {
        oom_signatures: settings.signatures.out_of_memory.clone(),
        alternate_config: paths.program_directory.join(&settings.batch.oom_config_file),
    };

    let gate = InterruptGate::new();
    spawn_interrupt_handler(gate.clone());

    let stager = ResourceStager::new(paths.temp_directory.clone(), settings.restore_policy(), gate.clone());
    let options = BatchOptions {
        base_config,
        output_dir: paths.output_dir.clone(),
        pretrained_model: paths.pretrained_model.clone(),
        remote_output: rclone.remote_subdir("output"),
        remote_root: rclone.remote_root(),
        empty_trash_after_upload: rclone.empty_trash_after_upload,
        keep_inputs: args.test,
        quota_signatures: settings.signatures.quota_exceeded.clone(),
        launch: LaunchCommand::from_settings(&settings),
    };

    let driver = BatchDriver::new(JobRunner::new(multiplexer, recovery), sync, stager, gate, options);
    let report = driver.run(discovery).await.context("Batch did not complete")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if let Some(reason) = &report.halted {
        anyhow::bail!("batch halted: {}", reason);
    }
    if report.cancelled {
        anyhow::bail!("batch cancelled by operator");
    }
    Ok(())
}

/// Remote trash cleanup, dataset download and archive extraction.
///
/// Remote failures are warnings; the batch goes on with whatever is local.
async fn prepare_inputs(settings: &EnvSettings, paths: &ResolvedPaths, sync: &RcloneSync) -> Result<()> {
    let rclone = &settings.rclone;

    if rclone.empty_trash_on_start {
        info!(remote = %rclone.remote_root(), "emptying remote trash");
        let output = sync.cleanup(&rclone.remote_root()).await;
        if !output.success {
            warn!("could not empty remote trash: {}", output.combined_text().trim());
        }
    }

    if rclone.download_on_start {
        let remote_training = rclone.remote_subdir("training");
        info!(from = %remote_training, to = %paths.working_directory.display(), "downloading datasets");
        let output = sync.download(&remote_training, &paths.working_directory).await;
        if output.success {
            let cleared = sync.delete_contents(&remote_training).await;
            if !cleared.success {
                warn!(remote = %remote_training, "could not clear remote training folder: {}", cleared.combined_text().trim());
            }
        } else {
            warn!("download failed, continuing with local data: {}", output.combined_text().trim());
        }
    }

    let archives = extract_archives(&paths.working_directory).context("Failed to scan for archives")?;
    for (path, reason) in &archives.failed {
        println!("  {} {} ({})", "!".yellow(), path.display(), reason);
    }
    Ok(())
}

/// Base training config from the program directory, with the `--add`
/// document merged on top.
fn load_base_config(settings: &EnvSettings, paths: &ResolvedPaths, add: Option<&Path>) -> Result<JobConfig> {
    let train_config_file = settings.batch.train_config_file.as_deref().unwrap_or_default();
    let base_path = paths.program_directory.join(train_config_file);
    let mut config = load_job_config(&base_path)
        .with_context(|| format!("Failed to load base training config {}", base_path.display()))?;

    let Some(add) = add else {
        return Ok(config);
    };
    let add_path = paths.program_directory.join(add);
    match load_job_config(&add_path) {
        Ok(overlay) => {
            let before = config.clone();
            merge_into(&mut config, &overlay);
            let changes = diff(&before, &config);
            println!("Merged {} into the base config", add_path.display().to_string().cyan());
            if changes.is_empty() {
                println!("  {}", "no settings changed".dimmed());
            }
            for change in changes {
                println!("  {}", change);
            }
        }
        Err(e) => warn!(path = %add_path.display(), "skipping override document: {}", e),
    }
    Ok(config)
}

fn spawn_interrupt_handler(gate: InterruptGate) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            gate.request();
        }
    });
}

fn print_header(settings: &EnvSettings, paths: &ResolvedPaths, suffix: &str, args: &RunArgs) {
    println!();
    println!("{}", "lorabatch".bold().cyan());
    println!("  settings:   {}", args.env_file.display());
    println!("  working:    {}", paths.working_directory.display());
    println!("  output:     {}", paths.output_dir.display());
    println!("  suffix:     {}", suffix);
    if let Some(add) = &args.add {
        println!("  add:        {}", add.display());
    }
    if let Some(model) = &paths.pretrained_model {
        println!("  model:      {}", model.display());
    }
    println!("  remote:     {}", settings.rclone.remote_path);
    if args.test {
        println!("  {}", "test mode: input directories are kept".yellow());
    }
    println!();
}

fn print_discovery(discovery: &lorabatch_core::Discovery) {
    println!("{}", format!("Work units ({})", discovery.units.len()).bold());
    if discovery.units.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for unit in &discovery.units {
        println!("  - {}", unit.id);
    }
    for entry in &discovery.excluded {
        println!("  {}", format!("skipped {}", entry).dimmed());
    }
    println!();
}

fn print_report(report: &BatchReport) {
    println!();
    println!("{}", "Batch report".bold().cyan());
    println!("{}", "─".repeat(60));

    println!("{} ({})", "Processed".green().bold(), report.processed.len());
    for id in &report.processed {
        println!("  {} {}", "✓".green(), id);
    }

    println!("{} ({})", "Remaining".yellow().bold(), report.remaining.len());
    for id in &report.remaining {
        println!("  {} {}", "•".yellow(), id);
    }

    println!("{} ({})", "Excluded".dimmed().bold(), report.excluded.len());
    for entry in &report.excluded {
        println!("  {}", entry.to_string().dimmed());
    }

    if let Some(reason) = &report.halted {
        println!();
        println!("{} {}", "Halted:".red().bold(), reason);
        println!("  {}", "local data for remaining units was left in place".dimmed());
    } else if report.cancelled {
        println!();
        println!("{}", "Cancelled by operator".red().bold());
        println!("  {}", "local data for remaining units was left in place".dimmed());
    }
    println!();
}
