use std::path::PathBuf;
use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("artifact not found at {permanent} or {staging}")]
    ArtifactMissing { permanent: PathBuf, staging: PathBuf },

    #[error("archive error in {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("remote sync error: {0}")]
    Sync(String),

    #[error("download of {url} failed with HTTP {status}")]
    Download { url: String, status: u16 },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}
