//! Job runner with out-of-memory recovery.
//!
//! One attempt, and at most one more: if the first run fails with a GPU
//! out-of-memory signature and an alternate config exists, the alternate is
//! merged onto the job config, the config file is rewritten and the same
//! command runs again. Whatever the second run returns is final.

use crate::error::{OrchestrationError, Result};
use crate::stream::{CommandRunner, RunOutcome};
use lorabatch_core::job_config::{load_job_config, merge_into, write_job_config};
use lorabatch_core::{contains_signature, diff, CoreResult, JobConfig, WorkUnit};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Substrings in stderr that mean the GPU ran out of memory.
    pub oom_signatures: Vec<String>,
    /// Config overlay applied before the retry.
    pub alternate_config: PathBuf,
}

/// Final outcome of a job plus how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub outcome: RunOutcome,
    pub attempts: u32,
}

impl JobReport {
    fn single(outcome: RunOutcome) -> Self {
        Self { outcome, attempts: 1 }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome.success()
    }
}

#[derive(Debug, Clone)]
pub struct JobRunner<R> {
    runner: R,
    recovery: RecoveryPolicy,
}

impl<R: CommandRunner> JobRunner<R> {
    #[must_use]
    pub fn new(runner: R, recovery: RecoveryPolicy) -> Self {
        Self { runner, recovery }
    }

    #[must_use]
    pub fn command_runner(&self) -> &R {
        &self.runner
    }

    /// Run the unit's training command, retrying once after an OOM failure.
    ///
    /// `config` must be the content of `unit.config_path`; it is updated in
    /// place when the alternate config is applied. Only cancellation is
    /// returned as an error.
    pub async fn run(
        &self,
        unit: &WorkUnit,
        command: &str,
        config: &mut JobConfig,
        cancel: &CancellationToken,
    ) -> Result<JobReport> {
        info!(unit = %unit.id, "starting training");

        let first = self.attempt(unit, command, cancel).await?;
        if first.success() {
            return Ok(JobReport::single(first));
        }

        if !contains_signature(&first.stderr, &self.recovery.oom_signatures) {
            return Ok(JobReport::single(first));
        }

        warn!(unit = %unit.id, "GPU out of memory detected");
        let alternate = &self.recovery.alternate_config;
        if !alternate.is_file() {
            warn!(
                unit = %unit.id,
                path = %alternate.display(),
                "no alternate config found, not retrying"
            );
            return Ok(JobReport::single(first));
        }

        if let Err(e) = self.apply_alternate(unit, config) {
            error!(unit = %unit.id, path = %alternate.display(), "could not apply alternate config: {}", e);
            return Ok(JobReport::single(first));
        }

        info!(unit = %unit.id, "retrying with updated config");
        let second = self.attempt(unit, command, cancel).await?;
        Ok(JobReport { outcome: second, attempts: 2 })
    }

    /// One run; orchestration faults become a failed outcome.
    async fn attempt(&self, unit: &WorkUnit, command: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        match self.runner.run(command, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(OrchestrationError::Cancelled) => Err(OrchestrationError::Cancelled),
            Err(e) => {
                error!(unit = %unit.id, "unexpected error while running training: {}", e);
                Ok(RunOutcome::synthetic_failure(e.to_string()))
            }
        }
    }

    fn apply_alternate(&self, unit: &WorkUnit, config: &mut JobConfig) -> CoreResult<()> {
        let overlay = load_job_config(&self.recovery.alternate_config)?;
        let before = config.clone();
        merge_into(config, &overlay);

        for change in diff(&before, config) {
            info!(unit = %unit.id, "  {}", change);
        }

        write_job_config(&unit.config_path, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Runner that replays scripted outcomes and records what it saw.
    struct ScriptedRunner {
        config_path: PathBuf,
        outcomes: Mutex<Vec<Result<RunOutcome>>>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedRunner {
        fn new(config_path: &Path, outcomes: Vec<Result<RunOutcome>>) -> Self {
            Self {
                config_path: config_path.to_path_buf(),
                outcomes: Mutex::new(outcomes.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<(String, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &str, _cancel: &CancellationToken) -> Result<RunOutcome> {
            let content = std::fs::read_to_string(&self.config_path).unwrap_or_default();
            self.seen.lock().unwrap().push((command.to_string(), content));
            self.outcomes.lock().unwrap().pop().expect("unexpected extra attempt")
        }
    }

    fn ok() -> Result<RunOutcome> {
        Ok(RunOutcome { exit_code: 0, stdout: "done\n".to_string(), stderr: String::new() })
    }

    fn fail(stderr: &str) -> Result<RunOutcome> {
        Ok(RunOutcome { exit_code: 1, stdout: String::new(), stderr: stderr.to_string() })
    }

    struct Fixture {
        temp: TempDir,
        unit: WorkUnit,
        config: JobConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let unit = WorkUnit::new("catA", temp.path().join("catA"), "v1", temp.path());
            let config: JobConfig = toml::from_str("train_batch_size = 4\nlearning_rate = 0.0001\n").unwrap();
            write_job_config(&unit.config_path, &config).unwrap();
            Self { temp, unit, config }
        }

        fn alternate(&self) -> PathBuf {
            self.temp.path().join("outofmemory.toml")
        }

        fn write_alternate(&self) {
            std::fs::write(self.alternate(), "train_batch_size = 1\ngradient_checkpointing = true\n").unwrap();
        }

        fn policy(&self) -> RecoveryPolicy {
            RecoveryPolicy {
                oom_signatures: vec!["CUDA out of memory".to_string(), "torch.cuda.OutOfMemoryError".to_string()],
                alternate_config: self.alternate(),
            }
        }
    }

    const COMMAND: &str = "accelerate launch train.py --config_file /tmp/catA_v1.toml";

    #[tokio::test]
    async fn test_success_runs_once() {
        let mut fx = Fixture::new();
        fx.write_alternate();
        let runner = JobRunner::new(ScriptedRunner::new(&fx.unit.config_path, vec![ok()]), fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert!(report.success());
        assert_eq!(report.attempts, 1);
        assert_eq!(runner.command_runner().seen().len(), 1);
    }

    #[tokio::test]
    async fn test_oom_retries_once_with_alternate_config() {
        let mut fx = Fixture::new();
        fx.write_alternate();
        let scripted = ScriptedRunner::new(
            &fx.unit.config_path,
            vec![fail("RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB"), ok()],
        );
        let runner = JobRunner::new(scripted, fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert!(report.success());
        assert_eq!(report.attempts, 2);

        let seen = runner.command_runner().seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, seen[1].0);
        assert_ne!(seen[0].1, seen[1].1);
        assert!(seen[1].1.contains("train_batch_size = 1"));
        assert!(seen[1].1.contains("learning_rate"));
        assert_eq!(fx.config["gradient_checkpointing"], toml::Value::Boolean(true));
    }

    #[tokio::test]
    async fn test_second_failure_is_final_even_if_oom_again() {
        let mut fx = Fixture::new();
        fx.write_alternate();
        let scripted = ScriptedRunner::new(
            &fx.unit.config_path,
            vec![fail("torch.cuda.OutOfMemoryError"), fail("torch.cuda.OutOfMemoryError")],
        );
        let runner = JobRunner::new(scripted, fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert!(!report.success());
        assert_eq!(report.attempts, 2);
        assert_eq!(runner.command_runner().seen().len(), 2);
    }

    #[tokio::test]
    async fn test_other_failure_is_not_retried() {
        let mut fx = Fixture::new();
        fx.write_alternate();
        let scripted = ScriptedRunner::new(&fx.unit.config_path, vec![fail("ValueError: bad dataset")]);
        let runner = JobRunner::new(scripted, fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome.stderr, "ValueError: bad dataset");
    }

    #[tokio::test]
    async fn test_oom_without_alternate_is_not_retried() {
        let mut fx = Fixture::new();
        let scripted = ScriptedRunner::new(&fx.unit.config_path, vec![fail("CUDA out of memory")]);
        let runner = JobRunner::new(scripted, fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.attempts, 1);
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_broken_alternate_returns_first_outcome() {
        let mut fx = Fixture::new();
        std::fs::write(fx.alternate(), "this is [not toml").unwrap();
        let scripted = ScriptedRunner::new(&fx.unit.config_path, vec![fail("CUDA out of memory")]);
        let runner = JobRunner::new(scripted, fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.outcome.stderr, "CUDA out of memory");
    }

    #[tokio::test]
    async fn test_runner_fault_becomes_failed_outcome() {
        let mut fx = Fixture::new();
        let scripted = ScriptedRunner::new(
            &fx.unit.config_path,
            vec![Err(OrchestrationError::Other("pipe exploded".to_string()))],
        );
        let runner = JobRunner::new(scripted, fx.policy());

        let report = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap();

        assert!(!report.success());
        assert!(report.outcome.stderr.contains("pipe exploded"));
    }

    #[tokio::test]
    async fn test_cancellation_is_propagated() {
        let mut fx = Fixture::new();
        let scripted = ScriptedRunner::new(&fx.unit.config_path, vec![Err(OrchestrationError::Cancelled)]);
        let runner = JobRunner::new(scripted, fx.policy());

        let err = runner.run(&fx.unit, COMMAND, &mut fx.config, &CancellationToken::new()).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
