//! Training job configuration documents.
//!
//! A `JobConfig` is an ordered TOML table handed to the training process.
//! Documents are layered with [`merge`]; [`diff`] reports what a layer changed
//! so the operator can audit it in the log.

use crate::error::{CoreError, CoreResult};
use std::fmt;
use std::path::Path;
use toml::{Table, Value};

pub type JobConfig = Table;

/// Overlay value that removes the key from the base instead of overwriting it.
pub const DELETE_SENTINEL: &str = "**delete**";

fn is_delete_sentinel(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == DELETE_SENTINEL)
}

/// Deep-merge `overlay` onto `base` and return the result.
///
/// Takes `base` by value; clone first if the original must survive.
#[must_use]
pub fn merge(mut base: JobConfig, overlay: &JobConfig) -> JobConfig {
    merge_into(&mut base, overlay);
    base
}

/// In-place variant of [`merge`].
pub fn merge_into(base: &mut JobConfig, overlay: &JobConfig) {
    for (key, value) in overlay {
        if is_delete_sentinel(value) {
            base.remove(key);
            continue;
        }

        match value {
            Value::Table(nested) => {
                // A scalar at this key is replaced by a fresh table.
                if !matches!(base.get(key), Some(Value::Table(_))) {
                    base.insert(key.clone(), Value::Table(Table::new()));
                }
                if let Some(Value::Table(inner)) = base.get_mut(key) {
                    merge_into(inner, nested);
                }
            }
            other => {
                base.insert(key.clone(), other.clone());
            }
        }
    }
}

/// A single leaf-level difference between two configurations.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Added { path: String, value: Value },
    Changed { path: String, old: Value, new: Value },
    Removed { path: String },
}

impl ConfigChange {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Added { path, .. } | Self::Changed { path, .. } | Self::Removed { path } => path,
        }
    }
}

impl fmt::Display for ConfigChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added { path, value } => write!(f, "[added] {path} = {value}"),
            Self::Changed { path, old, new } => write!(f, "[changed] {path}: {old} -> {new}"),
            Self::Removed { path } => write!(f, "[removed] {path}"),
        }
    }
}

/// Compare two configurations and list every added, changed and removed key path.
#[must_use]
pub fn diff(original: &JobConfig, updated: &JobConfig) -> Vec<ConfigChange> {
    let mut changes = Vec::new();
    diff_at(original, updated, "", &mut changes);
    changes
}

fn diff_at(original: &JobConfig, updated: &JobConfig, prefix: &str, changes: &mut Vec<ConfigChange>) {
    let join = |key: &str| {
        if prefix.is_empty() { key.to_string() } else { format!("{prefix}.{key}") }
    };

    for (key, new_value) in updated {
        let path = join(key);
        match original.get(key) {
            None => changes.push(ConfigChange::Added { path, value: new_value.clone() }),
            Some(Value::Table(old_table)) if new_value.is_table() => {
                if let Value::Table(new_table) = new_value {
                    diff_at(old_table, new_table, &path, changes);
                }
            }
            Some(old_value) if old_value != new_value => changes.push(ConfigChange::Changed {
                path,
                old: old_value.clone(),
                new: new_value.clone(),
            }),
            Some(_) => {}
        }
    }

    for key in original.keys() {
        if !updated.contains_key(key) {
            changes.push(ConfigChange::Removed { path: join(key) });
        }
    }
}

/// Read a TOML document from disk.
pub fn load_job_config(path: &Path) -> CoreResult<JobConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|source| CoreError::Read { path: path.to_path_buf(), source })?;
    toml::from_str(&content).map_err(|source| CoreError::Parse { path: path.to_path_buf(), source })
}

/// Serialize a configuration to `path`, replacing any previous content.
pub fn write_job_config(path: &Path, config: &JobConfig) -> CoreResult<()> {
    let content = toml::to_string(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}
