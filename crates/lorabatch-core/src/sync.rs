//! Remote storage collaborator.
//!
//! The batch only needs three opaque operations against the remote. Their
//! status and captured text are the whole contract; the text is inspected for
//! quota signatures and nothing else.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Status and combined output of one remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SyncOutput {
    #[must_use]
    pub fn ok() -> Self {
        Self { success: true, exit_code: Some(0), stdout: String::new(), stderr: String::new() }
    }

    #[must_use]
    pub fn failed(exit_code: i32, text: impl Into<String>) -> Self {
        Self { success: false, exit_code: Some(exit_code), stdout: String::new(), stderr: text.into() }
    }

    /// stdout and stderr joined by a newline.
    #[must_use]
    pub fn combined_text(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// True when `text` contains any of `signatures`.
#[must_use]
pub fn contains_signature(text: &str, signatures: &[String]) -> bool {
    signatures.iter().any(|sig| !sig.is_empty() && text.contains(sig.as_str()))
}

#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Copy `local_dir` into `remote_dir`.
    async fn copy(&self, local_dir: &Path, remote_dir: &str) -> SyncOutput;

    /// Copy `remote_dir` into `local_dir`.
    async fn download(&self, remote_dir: &str, local_dir: &Path) -> SyncOutput;

    /// Remove everything below `remote_dir`, keeping the directory itself.
    async fn delete_contents(&self, remote_dir: &str) -> SyncOutput;

    /// Empty the remote's trash.
    async fn cleanup(&self, remote_root: &str) -> SyncOutput;

    /// List top-level directories, used as a connectivity check.
    async fn list_dirs(&self, remote: &str) -> SyncOutput;
}

/// [`RemoteSync`] backed by the `rclone` binary.
#[derive(Debug, Clone)]
pub struct RcloneSync {
    binary: String,
    config_file: PathBuf,
}

impl RcloneSync {
    #[must_use]
    pub fn new(binary: impl Into<String>, config_file: PathBuf) -> Self {
        Self { binary: binary.into(), config_file }
    }

    #[must_use]
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Command line an operator would type, for log messages.
    #[must_use]
    pub fn describe(&self, args: &[&str]) -> String {
        format!("{} --config {} {}", self.binary, self.config_file.display(), args.join(" "))
    }

    async fn rclone(&self, args: &[&str]) -> SyncOutput {
        debug!(command = %self.describe(args), "running rclone");
        let output = Command::new(&self.binary)
            .arg("--config")
            .arg(&self.config_file)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => SyncOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => {
                warn!(binary = %self.binary, "failed to launch rclone: {}", e);
                SyncOutput::failed(-1, format!("failed to launch {}: {}", self.binary, e))
            }
        }
    }
}

#[async_trait]
impl RemoteSync for RcloneSync {
    async fn copy(&self, local_dir: &Path, remote_dir: &str) -> SyncOutput {
        let local = local_dir.to_string_lossy();
        self.rclone(&["copy", &local, remote_dir]).await
    }

    async fn download(&self, remote_dir: &str, local_dir: &Path) -> SyncOutput {
        let local = local_dir.to_string_lossy();
        self.rclone(&["copy", remote_dir, &local]).await
    }

    async fn delete_contents(&self, remote_dir: &str) -> SyncOutput {
        let delete = self.rclone(&["delete", remote_dir]).await;
        if !delete.success {
            return delete;
        }
        // rmdirs may take the root with it; mkdir puts it back.
        let rmdirs = self.rclone(&["rmdirs", remote_dir]).await;
        let mkdir = self.rclone(&["mkdir", remote_dir]).await;
        if !rmdirs.success {
            return rmdirs;
        }
        mkdir
    }

    async fn cleanup(&self, remote_root: &str) -> SyncOutput {
        self.rclone(&["cleanup", remote_root]).await
    }

    async fn list_dirs(&self, remote: &str) -> SyncOutput {
        self.rclone(&["lsd", "--low-level-retries", "1", remote]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_signature_detection() {
        let signatures = vec!["storageQuotaExceeded".to_string(), "Drive storage quota".to_string()];
        let output = SyncOutput::failed(
            7,
            "googleapi: Error 403: The user's Drive storage quota has been exceeded., storageQuotaExceeded",
        );
        assert!(contains_signature(&output.combined_text(), &signatures));
        assert!(!contains_signature("rate limit exceeded", &signatures));
        assert!(!contains_signature("anything", &[String::new()]));
    }

    #[test]
    fn test_describe_includes_config_file() {
        let sync = RcloneSync::new("rclone", PathBuf::from("/notebooks/program/rclone.conf"));
        assert_eq!(
            sync.describe(&["cleanup", "google:"]),
            "rclone --config /notebooks/program/rclone.conf cleanup google:"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_failed_output() {
        let sync = RcloneSync::new("definitely-not-rclone-xyz", PathBuf::from("rclone.conf"));
        let output = sync.cleanup("google:").await;
        assert!(!output.success);
        assert!(output.stderr.contains("definitely-not-rclone-xyz"));
    }
}
