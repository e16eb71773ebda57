//! Unpacking of uploaded dataset archives.

use crate::error::{CoreError, CoreResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Archives extracted and removed.
    pub extracted: Vec<PathBuf>,
    /// Archives left in place, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

/// Extract every `*.zip` in `directory` into it and delete each archive that
/// extracted cleanly. Broken archives are reported and kept.
pub fn extract_archives(directory: &Path) -> CoreResult<ArchiveReport> {
    let mut archives = Vec::new();
    for entry in std::fs::read_dir(directory)
        .map_err(|source| CoreError::Read { path: directory.to_path_buf(), source })?
    {
        let path = entry?.path();
        let is_zip = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"));
        if is_zip && path.is_file() {
            archives.push(path);
        }
    }
    archives.sort();

    let mut report = ArchiveReport::default();
    for path in archives {
        match extract_one(&path, directory) {
            Ok(()) => {
                info!(archive = %path.display(), "extracted archive");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(archive = %path.display(), "extracted but could not delete archive: {}", e);
                }
                report.extracted.push(path);
            }
            Err(e) => {
                warn!("{}", e);
                report.failed.push((path, e.to_string()));
            }
        }
    }
    Ok(report)
}

fn extract_one(path: &Path, into: &Path) -> CoreResult<()> {
    let archive_err = |message: String| CoreError::Archive { path: path.to_path_buf(), message };
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| archive_err(e.to_string()))?;
    archive.extract(into).map_err(|e| archive_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, body) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extracts_and_removes_archives() {
        let temp = TempDir::new().unwrap();
        write_zip(&temp.path().join("catA.zip"), &[("catA/001.txt", "a cat"), ("catA/001.png", "png")]);

        let report = extract_archives(temp.path()).unwrap();

        assert_eq!(report.extracted.len(), 1);
        assert!(report.failed.is_empty());
        assert!(!temp.path().join("catA.zip").exists());
        assert_eq!(std::fs::read_to_string(temp.path().join("catA/001.txt")).unwrap(), "a cat");
    }

    #[test]
    fn test_corrupt_archive_is_kept_and_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("broken.zip"), b"not a zip").unwrap();
        std::fs::create_dir(temp.path().join("catB")).unwrap();

        let report = extract_archives(temp.path()).unwrap();

        assert!(report.extracted.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(temp.path().join("broken.zip").exists());
    }
}
