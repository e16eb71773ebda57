//! Pretrained model download from the Hugging Face Hub.
//!
//! Files are fetched over the Hub's `resolve` endpoint straight into the model
//! directory. The body lands in a hidden `.part` file first, so an interrupted
//! download never leaves a truncated model under the real name.

use crate::error::{CoreError, CoreResult};
use crate::settings::ModelDownloadSettings;
use reqwest::{Client, Response};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub struct ModelDownloader {
    client: Client,
    endpoint: String,
    revision: String,
    token: Option<String>,
}

impl ModelDownloader {
    #[must_use]
    pub fn new(settings: &ModelDownloadSettings, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            revision: settings.revision.clone(),
            token,
        }
    }

    #[must_use]
    pub fn file_url(&self, repo_id: &str, filename: &str) -> String {
        format!("{}/{repo_id}/resolve/{}/{filename}", self.endpoint, self.revision)
    }

    /// Download `filename` from `repo_id` into `model_dir`, replacing any
    /// existing copy. Returns the final path.
    ///
    /// # Errors
    /// Returns `CoreError::Download` for a non-success status, `CoreError::Http`
    /// when the request or body transfer fails and `CoreError::Io` when the
    /// file cannot be written.
    pub async fn download(&self, repo_id: &str, filename: &str, model_dir: &Path) -> CoreResult<PathBuf> {
        let target = model_dir.join(filename);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.file_url(repo_id, filename);
        info!(repo = repo_id, file = filename, "downloading model");
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Download { url, status: status.as_u16() });
        }

        let name = target.file_name().map_or_else(|| filename.into(), |n| n.to_string_lossy());
        let partial = target.with_file_name(format!(".{name}.part"));
        let bytes = match write_body(&mut response, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&partial, &target).await?;

        info!(path = %target.display(), bytes, "model saved");
        Ok(target)
    }
}

async fn write_body(response: &mut Response, path: &Path) -> CoreResult<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    debug!(path = %path.display(), bytes = written, "body written");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn downloader(endpoint: String, token: Option<&str>) -> ModelDownloader {
        let settings = ModelDownloadSettings { endpoint, ..ModelDownloadSettings::default() };
        ModelDownloader::new(&settings, token.map(str::to_string))
    }

    #[test]
    fn test_file_url_uses_resolve_endpoint() {
        let downloader = downloader("https://huggingface.co/".to_string(), None);
        assert_eq!(
            downloader.file_url("org/sdxl", "base.safetensors"),
            "https://huggingface.co/org/sdxl/resolve/main/base.safetensors"
        );
    }

    #[tokio::test]
    async fn test_download_writes_model_with_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/org/sdxl/resolve/main/base.safetensors")
            .match_header("authorization", "Bearer hf_test")
            .with_status(200)
            .with_body("weights")
            .create();
        let temp = TempDir::new().unwrap();
        let model_dir = temp.path().join("models");

        let path = downloader(server.url(), Some("hf_test"))
            .download("org/sdxl", "base.safetensors", &model_dir)
            .await
            .unwrap();

        mock.assert();
        assert_eq!(path, model_dir.join("base.safetensors"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "weights");
        assert!(!model_dir.join(".base.safetensors.part").exists());
    }

    #[tokio::test]
    async fn test_download_replaces_existing_copy() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/org/sdxl/resolve/main/base.safetensors")
            .match_header("authorization", mockito::Matcher::Missing)
            .with_status(200)
            .with_body("new")
            .create();
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("base.safetensors"), "old").unwrap();

        downloader(server.url(), None)
            .download("org/sdxl", "base.safetensors", temp.path())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(temp.path().join("base.safetensors")).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_missing_file_leaves_nothing_behind() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/org/private/resolve/main/base.safetensors")
            .with_status(404)
            .with_body("Entry not found")
            .create();
        let temp = TempDir::new().unwrap();

        let err = downloader(server.url(), None)
            .download("org/private", "base.safetensors", temp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Download { status: 404, .. }));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
