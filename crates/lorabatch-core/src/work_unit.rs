use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// One directory of training data, trained as a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkUnit {
    pub id: String,
    pub input_path: PathBuf,
    /// `<id>_<suffix>`, used for the LoRA file name.
    pub output_name: String,
    /// Per-unit training config handed to the launcher.
    pub config_path: PathBuf,
}

impl WorkUnit {
    #[must_use]
    pub fn new(id: &str, input_path: PathBuf, suffix: &str, temp_directory: &Path) -> Self {
        let output_name = format!("{id}_{suffix}");
        let config_path = temp_directory.join(format!("{output_name}.toml"));
        Self { id: id.to_string(), input_path, output_name, config_path }
    }
}

/// Entry that was never turned into a job, with the reason why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedEntry {
    pub name: String,
    pub reason: String,
}

impl ExcludedEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { name: name.into(), reason: reason.into() }
    }
}

impl std::fmt::Display for ExcludedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub units: Vec<WorkUnit>,
    pub excluded: Vec<ExcludedEntry>,
}

/// List the working directory: every directory becomes a work unit unless its
/// name starts with `reserved_prefix`; everything else is excluded.
pub fn discover_work_units(
    working_directory: &Path,
    reserved_prefix: &str,
    suffix: &str,
    temp_directory: &Path,
) -> CoreResult<Discovery> {
    let entries = std::fs::read_dir(working_directory)
        .map_err(|source| CoreError::Read { path: working_directory.to_path_buf(), source })?;

    let mut discovery = Discovery::default();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if !path.is_dir() {
            discovery.excluded.push(ExcludedEntry::new(name, "not a directory"));
        } else if !reserved_prefix.is_empty() && name.starts_with(reserved_prefix) {
            discovery.excluded.push(ExcludedEntry::new(name, format!("starts with '{reserved_prefix}'")));
        } else {
            discovery.units.push(WorkUnit::new(&name, path, suffix, temp_directory));
        }
    }

    discovery.units.sort_by(|a, b| a.id.cmp(&b.id));
    discovery.excluded.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(discovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discovery_filters_reserved_and_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir(root.join("catB")).unwrap();
        std::fs::create_dir(root.join("catA")).unwrap();
        std::fs::create_dir(root.join(".ipynb_checkpoints")).unwrap();
        std::fs::write(root.join("notes.txt"), "x").unwrap();

        let discovery = discover_work_units(root, ".", "v1", Path::new("/tmp")).unwrap();

        let ids: Vec<_> = discovery.units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["catA", "catB"]);
        assert_eq!(discovery.units[0].output_name, "catA_v1");
        assert_eq!(discovery.units[0].config_path, PathBuf::from("/tmp/catA_v1.toml"));
        assert_eq!(discovery.units[0].input_path, root.join("catA"));

        let excluded: Vec<_> = discovery.excluded.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(excluded, vec![".ipynb_checkpoints", "notes.txt"]);
    }

    #[test]
    fn test_missing_working_directory_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = discover_work_units(&temp.path().join("nope"), ".", "v1", temp.path()).unwrap_err();
        assert!(matches!(err, CoreError::Read { .. }));
    }
}
