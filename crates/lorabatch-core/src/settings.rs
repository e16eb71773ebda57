//! Environment settings document (`PSPACE_env.toml`).
//!
//! Describes where things live on the GPU box, how the launcher is invoked
//! and how the remote is reached. Every field has a default except the ones
//! checked by [`EnvSettings::validate`].

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name of the environment settings document.
pub const DEFAULT_ENV_FILE: &str = "PSPACE_env.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvSettings {
    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub accelerate_options: AccelerateOptions,

    #[serde(default)]
    pub train_options: TrainOptions,

    #[serde(default, rename = "makelora_settings")]
    pub batch: BatchSettings,

    #[serde(default)]
    pub rclone: RcloneSettings,

    #[serde(default)]
    pub signatures: Signatures,

    #[serde(default)]
    pub restore: RestoreSettings,

    #[serde(default)]
    pub process: ProcessSettings,

    #[serde(default)]
    pub modeldownload: ModelDownloadSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub base_directory: PathBuf,
    pub working_directory: PathBuf,
    pub program_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub kohya_directory: PathBuf,
    pub accelerate_path: PathBuf,
    pub train_script_path: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub model_dir: PathBuf,
    /// File name of the pretrained model inside `model_dir`.
    pub pretrained_model_name_or_path: Option<String>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("/notebooks"),
            working_directory: PathBuf::from("training"),
            program_directory: PathBuf::from("program"),
            temp_directory: PathBuf::from("/tmp"),
            kohya_directory: PathBuf::from("/kohya_ss"),
            accelerate_path: PathBuf::from("/venv/bin/accelerate"),
            train_script_path: PathBuf::from("/kohya_ss/sd-scripts/sdxl_train_network.py"),
            output_dir: None,
            model_dir: PathBuf::from("."),
            pretrained_model_name_or_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerateOptions {
    pub dynamo_backend: String,
    pub dynamo_mode: String,
    pub mixed_precision: String,
    pub num_processes: u32,
    pub num_machines: u32,
    pub num_cpu_threads_per_process: u32,
}

impl Default for AccelerateOptions {
    fn default() -> Self {
        Self {
            dynamo_backend: "no".to_string(),
            dynamo_mode: "default".to_string(),
            mixed_precision: "bf16".to_string(),
            num_processes: 1,
            num_machines: 1,
            num_cpu_threads_per_process: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub log_prefix: String,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self { log_prefix: "xl-loha".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub output_suffix: Option<String>,
    /// Base training config, relative to the program directory.
    pub train_config_file: Option<String>,
    /// Alternate config applied when training runs out of GPU memory.
    pub oom_config_file: String,
    /// Work unit directories starting with this prefix are not processed.
    pub reserved_prefix: String,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            output_suffix: None,
            train_config_file: None,
            oom_config_file: "outofmemory.toml".to_string(),
            reserved_prefix: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcloneSettings {
    pub remote_path: String,
    pub config_file: String,
    pub binary: String,
    pub empty_trash_on_start: bool,
    pub empty_trash_after_upload: bool,
    pub download_on_start: bool,
}

impl Default for RcloneSettings {
    fn default() -> Self {
        Self {
            remote_path: "google:lora".to_string(),
            config_file: "rclone.conf".to_string(),
            binary: "rclone".to_string(),
            empty_trash_on_start: true,
            empty_trash_after_upload: true,
            download_on_start: true,
        }
    }
}

impl RcloneSettings {
    /// `remote:path` -> `remote`.
    #[must_use]
    pub fn remote_name(&self) -> &str {
        self.remote_path.split_once(':').map_or(self.remote_path.as_str(), |(name, _)| name)
    }

    #[must_use]
    pub fn remote_root(&self) -> String {
        format!("{}:", self.remote_name())
    }

    #[must_use]
    pub fn remote_subdir(&self, name: &str) -> String {
        format!("{}/{name}", self.remote_path.trim_end_matches('/'))
    }
}

/// Substrings recognized in process output.
///
/// These are heuristics over free-form text, not structured error codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Signatures {
    pub out_of_memory: Vec<String>,
    pub quota_exceeded: Vec<String>,
}

impl Default for Signatures {
    fn default() -> Self {
        Self {
            out_of_memory: vec![
                "CUDA out of memory".to_string(),
                "torch.cuda.OutOfMemoryError".to_string(),
            ],
            quota_exceeded: vec![
                "storageQuotaExceeded".to_string(),
                "Drive storage quota".to_string(),
                "The user's Drive storage quota has been exceeded".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreSettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self { max_attempts: 5, delay_ms: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    pub grace_period_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self { grace_period_secs: 5 }
    }
}

impl ProcessSettings {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Where `lorabatch download-model` fetches the pretrained model from.
///
/// The file name is always `paths.pretrained_model_name_or_path`, so every
/// entry in `models` names a repository holding that file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDownloadSettings {
    /// Hugging Face access token. Falls back to `HF_TOKEN` when unset.
    pub token: Option<String>,
    pub endpoint: String,
    pub revision: String,
    pub models: Vec<ModelSource>,
}

impl Default for ModelDownloadSettings {
    fn default() -> Self {
        Self {
            token: None,
            endpoint: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            models: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub repo_id: String,
}

/// Absolute locations derived from [`PathSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub working_directory: PathBuf,
    pub program_directory: PathBuf,
    pub output_dir: PathBuf,
    pub temp_directory: PathBuf,
    pub kohya_directory: PathBuf,
    pub accelerate_path: PathBuf,
    pub train_script_path: PathBuf,
    /// Home directory of the pretrained model.
    pub model_directory: PathBuf,
    /// Permanent location of the pretrained model, if configured.
    pub pretrained_model: Option<PathBuf>,
}

impl EnvSettings {
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| CoreError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&content).map_err(|source| CoreError::Parse { path: path.to_path_buf(), source })
    }

    /// Check the keys that have no sensible default.
    pub fn validate(&self) -> CoreResult<()> {
        if self.batch.output_suffix.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(CoreError::InvalidSettings(
                "makelora_settings.output_suffix is required".to_string(),
            ));
        }
        if self.batch.train_config_file.as_deref().is_none_or(|s| s.trim().is_empty()) {
            return Err(CoreError::InvalidSettings(
                "makelora_settings.train_config_file is required".to_string(),
            ));
        }
        if self.paths.output_dir.is_none() {
            return Err(CoreError::InvalidSettings("paths.output_dir is required".to_string()));
        }
        if self.restore.max_attempts == 0 {
            return Err(CoreError::InvalidSettings("restore.max_attempts must be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn resolve_paths(&self) -> ResolvedPaths {
        let p = &self.paths;
        let base = &p.base_directory;
        ResolvedPaths {
            working_directory: base.join(&p.working_directory),
            program_directory: base.join(&p.program_directory),
            output_dir: base.join(p.output_dir.as_deref().unwrap_or_else(|| Path::new("output"))),
            temp_directory: p.temp_directory.clone(),
            kohya_directory: p.kohya_directory.clone(),
            accelerate_path: p.accelerate_path.clone(),
            train_script_path: p.train_script_path.clone(),
            model_directory: base.join(&p.model_dir),
            pretrained_model: p
                .pretrained_model_name_or_path
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .map(|name| base.join(&p.model_dir).join(name)),
        }
    }

    /// Output suffix, extended with the override document's stem when one is given.
    #[must_use]
    pub fn effective_output_suffix(&self, override_file: Option<&Path>) -> String {
        let suffix = self.batch.output_suffix.clone().unwrap_or_default();
        match override_file.and_then(Path::file_stem) {
            Some(stem) => format!("{suffix}-{}", stem.to_string_lossy()),
            None => suffix,
        }
    }

    #[must_use]
    pub fn restore_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy::fixed(
            self.restore.max_attempts,
            Duration::from_millis(self.restore.delay_ms),
        )
    }
}
