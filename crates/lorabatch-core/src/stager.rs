//! Pretrained model staging.
//!
//! The model is moved into the temp directory (usually local NVMe) for the
//! duration of a job and moved back afterwards. At any point exactly one of
//! the two locations holds the file.

use crate::error::{CoreError, CoreResult};
use crate::interrupt::InterruptGate;
use crate::retry::RetryPolicy;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Where the artifact lives for the current job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    pub permanent: PathBuf,
    pub staging: PathBuf,
    /// Path the training process should read.
    pub effective: PathBuf,
}

impl StagedArtifact {
    fn in_place(path: &Path) -> Self {
        Self { permanent: path.to_path_buf(), staging: path.to_path_buf(), effective: path.to_path_buf() }
    }

    #[must_use]
    pub fn is_relocated(&self) -> bool {
        self.staging != self.permanent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnstageOutcome {
    /// Nothing to move back.
    NotNeeded,
    Restored,
    /// The move back failed; the file is still at `location`.
    Stranded { location: PathBuf, error: String },
}

#[derive(Debug, Clone)]
pub struct ResourceStager {
    temp_directory: PathBuf,
    policy: RetryPolicy,
    gate: InterruptGate,
}

impl ResourceStager {
    #[must_use]
    pub fn new(temp_directory: PathBuf, policy: RetryPolicy, gate: InterruptGate) -> Self {
        Self { temp_directory, policy, gate }
    }

    #[must_use]
    pub fn staging_path_for(&self, permanent: &Path) -> Option<PathBuf> {
        permanent.file_name().map(|name| self.temp_directory.join(name))
    }

    /// Move the artifact into the staging area, or reuse a copy left there by
    /// an interrupted run.
    pub async fn stage(&self, permanent: &Path) -> CoreResult<StagedArtifact> {
        if !permanent.is_absolute() {
            warn!(path = %permanent.display(), "model path is not absolute, using it in place");
            return Ok(StagedArtifact::in_place(permanent));
        }

        let staging = self.staging_path_for(permanent).ok_or_else(|| {
            CoreError::InvalidSettings(format!("model path has no file name: {}", permanent.display()))
        })?;

        if staging == permanent {
            info!(path = %permanent.display(), "model already lives in the temp directory");
            return Ok(StagedArtifact::in_place(permanent));
        }

        let artifact = StagedArtifact {
            permanent: permanent.to_path_buf(),
            staging: staging.clone(),
            effective: staging.clone(),
        };

        if tokio::fs::try_exists(permanent).await? {
            info!(from = %permanent.display(), to = %staging.display(), "staging model");
            tokio::fs::create_dir_all(&self.temp_directory).await?;
            move_file(permanent, &staging).await?;
            Ok(artifact)
        } else if tokio::fs::try_exists(&staging).await? {
            info!(path = %staging.display(), "model already staged by a previous run, reusing it");
            Ok(artifact)
        } else {
            Err(CoreError::ArtifactMissing { permanent: permanent.to_path_buf(), staging })
        }
    }

    /// Move the artifact back to its permanent location.
    ///
    /// Interrupts are held back for the duration of the move. Failures are
    /// reported through the outcome, never as an error.
    pub async fn unstage(&self, artifact: &StagedArtifact) -> UnstageOutcome {
        self.unstage_with(artifact, |from, to| async move { move_file(&from, &to).await }).await
    }

    async fn unstage_with<M, Fut>(&self, artifact: &StagedArtifact, mover: M) -> UnstageOutcome
    where
        M: Fn(PathBuf, PathBuf) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        if !artifact.is_relocated() {
            return UnstageOutcome::NotNeeded;
        }
        match tokio::fs::try_exists(&artifact.staging).await {
            Ok(true) => {}
            Ok(false) => return UnstageOutcome::NotNeeded,
            Err(e) => warn!(path = %artifact.staging.display(), "could not inspect staged model: {}", e),
        }

        info!(from = %artifact.staging.display(), to = %artifact.permanent.display(), "restoring model");
        let _mask = self.gate.mask();

        let staging = artifact.staging.as_path();
        let permanent = artifact.permanent.as_path();
        let result = self
            .policy
            .run(
                |attempt| {
                    let moved = mover(staging.to_path_buf(), permanent.to_path_buf());
                    async move {
                        if attempt > 1 {
                            warn!(attempt, "model file is locked, retrying restore");
                        }
                        if let Some(parent) = permanent.parent() {
                            tokio::fs::create_dir_all(parent).await?;
                        }
                        moved.await
                    }
                },
                is_lock_error,
            )
            .await;

        match result {
            Ok(()) => {
                info!(path = %permanent.display(), "model restored");
                UnstageOutcome::Restored
            }
            Err(e) => {
                error!(
                    staging = %staging.display(),
                    permanent = %permanent.display(),
                    "failed to restore model: {}", e
                );
                error!("IMPORTANT: the model file is still in the temp directory: {}", staging.display());
                UnstageOutcome::Stranded { location: staging.to_path_buf(), error: e.to_string() }
            }
        }
    }
}

fn is_lock_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy)
}

/// Rename, falling back to copy + remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            if let Err(copy_err) = tokio::fs::copy(from, to).await {
                let _ = tokio::fs::remove_file(to).await;
                return Err(copy_err);
            }
            tokio::fs::remove_file(from).await
        }
        Err(e) => Err(e),
    }
}
