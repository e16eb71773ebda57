//! Sequential batch driver.
//!
//! Work units are trained one at a time since the GPU is a singleton. Each
//! unit goes through stage → train → unstage → upload → housekeeping; the
//! model is always moved back before the next unit is staged.

use crate::error::{OrchestrationError, Result};
use crate::launch::LaunchCommand;
use crate::runner::{JobReport, JobRunner};
use crate::stream::CommandRunner;
use lorabatch_core::job_config::write_job_config;
use lorabatch_core::{
    contains_signature, Discovery, ExcludedEntry, InterruptGate, JobConfig, RemoteSync, ResourceStager,
    UnstageOutcome, WorkUnit,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// Number of stderr lines repeated in a failure summary.
const STDERR_TAIL_LINES: usize = 20;

/// Per-batch inputs of the driver.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Merged base training config, copied for every unit.
    pub base_config: JobConfig,
    /// Directory the training process writes LoRA files to.
    pub output_dir: PathBuf,
    /// Pretrained model to stage. Units are skipped when it is not configured.
    pub pretrained_model: Option<PathBuf>,
    /// Remote folder finished LoRA files are copied to.
    pub remote_output: String,
    /// Remote root (`name:`) used for trash cleanup.
    pub remote_root: String,
    /// Empty the remote trash after each upload.
    pub empty_trash_after_upload: bool,
    /// Keep input directories after success (test mode).
    pub keep_inputs: bool,
    /// Substrings in sync output that mean the remote is full.
    pub quota_signatures: Vec<String>,
    pub launch: LaunchCommand,
}

/// Where every discovered entry ended up.
///
/// The three sets are disjoint. `halted` carries the reason when the batch
/// stopped on a fatal sync error and `cancelled` is set when the operator
/// stopped it; either way the unit being processed and everything after it
/// are listed in `remaining`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: Vec<String>,
    pub remaining: Vec<String>,
    pub excluded: Vec<ExcludedEntry>,
    pub halted: Option<String>,
    pub cancelled: bool,
}

impl BatchReport {
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// True when the batch did not get through every unit.
    #[must_use]
    pub fn stopped_early(&self) -> bool {
        self.is_halted() || self.cancelled
    }

    fn leave_rest(&mut self, current: String, rest: impl Iterator<Item = WorkUnit>) {
        self.remaining.push(current);
        self.remaining.extend(rest.map(|u| u.id));
    }
}

/// How one unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UnitResult {
    Processed,
    Remaining,
    Excluded(String),
    Halt(String),
}

pub struct BatchDriver<R, S> {
    runner: JobRunner<R>,
    sync: S,
    stager: ResourceStager,
    gate: InterruptGate,
    options: BatchOptions,
}

impl<R, S> BatchDriver<R, S>
where
    R: CommandRunner,
    S: RemoteSync,
{
    #[must_use]
    pub fn new(
        runner: JobRunner<R>,
        sync: S,
        stager: ResourceStager,
        gate: InterruptGate,
        options: BatchOptions,
    ) -> Self {
        Self { runner, sync, stager, gate, options }
    }

    /// Process every discovered unit in order.
    ///
    /// An operator stop ends the batch with `cancelled` set in the report,
    /// after the model has been restored and the unit's temp config removed.
    pub async fn run(&self, discovery: Discovery) -> Result<BatchReport> {
        let start = Instant::now();
        let mut report = BatchReport { excluded: discovery.excluded, ..BatchReport::default() };
        let total = discovery.units.len();
        info!(units = total, excluded = report.excluded.len(), "starting batch");

        let mut units = discovery.units.into_iter();
        while let Some(unit) = units.next() {
            if self.gate.is_cancelled() {
                warn!("batch cancelled before {}", unit.id);
                report.cancelled = true;
                report.leave_rest(unit.id, units.by_ref());
                break;
            }

            info!(unit = %unit.id, input = %unit.input_path.display(), "processing work unit");
            let result = self.process_unit(&unit).await;
            remove_temp_config(&unit).await;

            let result = match result {
                Ok(result) => result,
                Err(OrchestrationError::Cancelled) => {
                    warn!(unit = %unit.id, "batch cancelled by operator");
                    report.cancelled = true;
                    report.leave_rest(unit.id, units.by_ref());
                    break;
                }
                Err(e) => return Err(e),
            };

            match result {
                UnitResult::Processed => {
                    info!(unit = %unit.id, "work unit done");
                    report.processed.push(unit.id);
                }
                UnitResult::Remaining => {
                    warn!(unit = %unit.id, input = %unit.input_path.display(), "work unit left in place");
                    report.remaining.push(unit.id);
                }
                UnitResult::Excluded(reason) => {
                    report.excluded.push(ExcludedEntry::new(unit.id, reason));
                }
                UnitResult::Halt(reason) => {
                    error!("halting batch: {}", reason);
                    report.leave_rest(unit.id, units.by_ref());
                    report.halted = Some(reason);
                    break;
                }
            }
        }

        info!(
            processed = report.processed.len(),
            remaining = report.remaining.len(),
            excluded = report.excluded.len(),
            elapsed_secs = start.elapsed().as_secs(),
            "batch finished"
        );
        Ok(report)
    }

    async fn process_unit(&self, unit: &WorkUnit) -> Result<UnitResult> {
        let mut config = self.unit_config(unit);

        let artifact = match &self.options.pretrained_model {
            Some(model) => match self.stager.stage(model).await {
                Ok(artifact) => {
                    config.insert(
                        "pretrained_model_name_or_path".to_string(),
                        path_value(&artifact.effective),
                    );
                    artifact
                }
                Err(e) => {
                    error!(unit = %unit.id, model = %model.display(), "skipping unit, model unavailable: {}", e);
                    return Ok(UnitResult::Excluded(e.to_string()));
                }
            },
            None => {
                error!(unit = %unit.id, "skipping unit, no pretrained model configured");
                return Ok(UnitResult::Excluded("pretrained_model_name_or_path is not set".to_string()));
            }
        };

        let job = self.train(unit, &mut config).await;

        if let UnstageOutcome::Stranded { location, .. } = self.stager.unstage(&artifact).await {
            warn!(unit = %unit.id, location = %location.display(), "continuing with model outside its home");
        }

        let Some(job) = job? else {
            return Ok(UnitResult::Remaining);
        };
        if !job.success() {
            report_failure(unit, &job);
            return Ok(UnitResult::Remaining);
        }

        Ok(self.ship(unit).await)
    }

    /// Unit copy of the base config with its paths filled in.
    fn unit_config(&self, unit: &WorkUnit) -> JobConfig {
        let mut config = self.options.base_config.clone();
        config.insert("train_data_dir".to_string(), path_value(&unit.input_path));
        config.insert("output_name".to_string(), toml::Value::String(unit.output_name.clone()));
        config.insert("output_dir".to_string(), path_value(&self.options.output_dir));
        config
    }

    /// Write the unit config and run training. `None` means it never ran.
    async fn train(&self, unit: &WorkUnit, config: &mut JobConfig) -> Result<Option<JobReport>> {
        if let Err(e) = write_job_config(&unit.config_path, config) {
            error!(unit = %unit.id, path = %unit.config_path.display(), "could not write training config: {}", e);
            return Ok(None);
        }
        let command = self.options.launch.render(&unit.config_path);
        let report = self.runner.run(unit, &command, config, &self.gate.token()).await?;
        Ok(Some(report))
    }

    /// Upload the output directory and clean up after a successful job.
    async fn ship(&self, unit: &WorkUnit) -> UnitResult {
        let output_dir = &self.options.output_dir;
        info!(unit = %unit.id, to = %self.options.remote_output, "uploading results");

        let upload = self.sync.copy(output_dir, &self.options.remote_output).await;
        if !upload.success {
            let text = upload.combined_text();
            if contains_signature(&text, &self.options.quota_signatures) {
                error!(unit = %unit.id, "remote storage quota exceeded: {}", text.trim());
                return UnitResult::Halt(format!(
                    "remote storage quota exceeded while uploading {}",
                    unit.output_name
                ));
            }
            error!(
                unit = %unit.id,
                exit_code = ?upload.exit_code,
                output = %output_dir.display(),
                "upload failed: {}", text.trim()
            );
            return UnitResult::Remaining;
        }

        if self.options.empty_trash_after_upload {
            let cleanup = self.sync.cleanup(&self.options.remote_root).await;
            if !cleanup.success {
                warn!(remote = %self.options.remote_root, "could not empty remote trash: {}", cleanup.combined_text().trim());
            }
        }

        if let Err(e) = clear_directory(output_dir).await {
            warn!(output = %output_dir.display(), "could not clear output directory: {}", e);
        }

        if self.options.keep_inputs {
            info!(unit = %unit.id, "test mode, keeping input directory");
        } else if let Err(e) = tokio::fs::remove_dir_all(&unit.input_path).await {
            error!(unit = %unit.id, input = %unit.input_path.display(), "could not delete input directory: {}", e);
            return UnitResult::Remaining;
        }

        UnitResult::Processed
    }
}

fn path_value(path: &Path) -> toml::Value {
    toml::Value::String(path.to_string_lossy().into_owned())
}

fn report_failure(unit: &WorkUnit, job: &JobReport) {
    error!(
        unit = %unit.id,
        exit_code = job.outcome.exit_code,
        attempts = job.attempts,
        input = %unit.input_path.display(),
        config = %unit.config_path.display(),
        "training failed"
    );
    let lines: Vec<&str> = job.outcome.stderr.lines().collect();
    let tail = &lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..];
    if !tail.is_empty() {
        error!(unit = %unit.id, "stderr (last {} lines):\n{}", tail.len(), tail.join("\n"));
    }
}

async fn remove_temp_config(unit: &WorkUnit) {
    match tokio::fs::remove_file(&unit.config_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %unit.config_path.display(), "could not remove temp config: {}", e),
    }
}

/// Delete everything inside `dir`, keeping `dir` itself.
async fn clear_directory(dir: &Path) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}
