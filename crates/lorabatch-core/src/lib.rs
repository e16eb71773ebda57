//! lorabatch core
//!
//! Building blocks for running LoRA training batches on a rented GPU box:
//! - Loading the environment settings document (`EnvSettings`)
//! - Merging and diffing training job configurations (`JobConfig`)
//! - Discovering work units and unpacking uploaded archives
//! - Staging the pretrained model next to the GPU (`ResourceStager`)
//! - Fetching the pretrained model from the Hugging Face Hub (`ModelDownloader`)
//! - Talking to remote storage through the `RemoteSync` collaborator

pub mod archive;
pub mod error;
pub mod interrupt;
pub mod job_config;
pub mod model_download;
pub mod retry;
pub mod settings;
pub mod stager;
pub mod sync;
pub mod work_unit;

pub use archive::{extract_archives, ArchiveReport};
pub use error::{CoreError, CoreResult};
pub use interrupt::{InterruptGate, MaskGuard};
pub use job_config::{diff, merge, ConfigChange, JobConfig, DELETE_SENTINEL};
pub use model_download::ModelDownloader;
pub use retry::RetryPolicy;
pub use settings::{
    AccelerateOptions, BatchSettings, EnvSettings, ModelDownloadSettings, ModelSource, PathSettings,
    ProcessSettings, RcloneSettings, ResolvedPaths, RestoreSettings, Signatures, TrainOptions,
};
pub use stager::{ResourceStager, StagedArtifact, UnstageOutcome};
pub use sync::{contains_signature, RcloneSync, RemoteSync, SyncOutput};
pub use work_unit::{discover_work_units, Discovery, ExcludedEntry, WorkUnit};
