//! Whole-snapshot JSON persistence with atomic replacement.
//!
//! Snapshots are serialized to a temp file in the destination directory and
//! moved into place with a rename, so a reader observes either the old or
//! the new content on any exit path, including crashes mid-write.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::IndexError;

/// Serialize `value` to `path`, replacing any previous snapshot atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create snapshot directory {parent:?}"))?;
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot");
    let tmp = path.with_file_name(format!("{name}.tmp"));

    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize snapshot for {path:?}"))?;
    fs::write(&tmp, json).with_context(|| format!("failed to write {tmp:?}"))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {path:?}"))?;

    Ok(())
}

/// Load a snapshot, falling back to the default value.
///
/// A missing file is the normal first-run case. An unreadable or corrupt
/// snapshot is discarded with a warning rather than failing startup.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(_) => {
            warn!(
                "{}",
                IndexError::CorruptSnapshot {
                    path: path.to_path_buf()
                }
            );
            return T::default();
        }
    };

    match serde_json::from_str(&json) {
        Ok(value) => value,
        Err(_) => {
            warn!(
                "{}",
                IndexError::CorruptSnapshot {
                    path: path.to_path_buf()
                }
            );
            T::default()
        }
    }
}
