use lorabatch_core::{AccelerateOptions, EnvSettings};
use std::path::{Path, PathBuf};

/// Environment variable set for every training run.
pub const CUDA_ALLOC_ENV: (&str, &str) = ("PYTORCH_CUDA_ALLOC_CONF", "expandable_segments:True");

/// `accelerate launch` invocation of the training script.
///
/// Only the config file path differs between work units, so the same
/// command line is reused for the out-of-memory retry.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub accelerate_path: PathBuf,
    pub train_script_path: PathBuf,
    pub options: AccelerateOptions,
    pub log_prefix: String,
}

impl LaunchCommand {
    #[must_use]
    pub fn from_settings(settings: &EnvSettings) -> Self {
        Self {
            accelerate_path: settings.paths.accelerate_path.clone(),
            train_script_path: settings.paths.train_script_path.clone(),
            options: settings.accelerate_options.clone(),
            log_prefix: settings.train_options.log_prefix.clone(),
        }
    }

    #[must_use]
    pub fn render(&self, config_file: &Path) -> String {
        let o = &self.options;
        format!(
            "{} launch --dynamo_backend {} --dynamo_mode {} --mixed_precision {} \
             --num_processes {} --num_machines {} --num_cpu_threads_per_process {} \
             \"{}\" --config_file \"{}\" --log_prefix={}",
            self.accelerate_path.display(),
            o.dynamo_backend,
            o.dynamo_mode,
            o.mixed_precision,
            o.num_processes,
            o.num_machines,
            o.num_cpu_threads_per_process,
            self.train_script_path.display(),
            config_file.display(),
            self.log_prefix,
        )
    }
}
