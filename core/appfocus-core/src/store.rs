//! Multi-process-visible boolean store.
//!
//! [`SharedStore`] is the seam for whatever durable key/value mechanism the
//! host offers. Two implementations ship here:
//!
//! - [`FileStore`]: a small JSON file under the app data directory. Every read
//!   goes to disk (no caching) so writes from other processes are visible.
//! - [`MemoryStore`]: process-local, for tests and single-process hosts.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "values": { "app_is_foreground": false, "app_is_paused": true }
//! }
//! ```
//!
//! # Failure Handling
//!
//! Readers never fail: a missing, empty, corrupt or wrong-version file yields
//! the caller's default (logged). Writes use temp file + rename so a reader in
//! another process never sees a partial file. The store itself does no
//! locking; callers serialize read-modify-write cycles with the process lock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{FocusError, Result};

pub const KEY_IS_FOREGROUND: &str = "app_is_foreground";
pub const KEY_IS_PAUSED: &str = "app_is_paused";

const STORE_VERSION: u32 = 1;

pub trait SharedStore: Send + Sync {
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn put_bool(&self, key: &str, value: bool) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    values: BTreeMap<String, bool>,
}

impl Default for StoreFile {
    fn default() -> Self {
        StoreFile {
            version: STORE_VERSION,
            values: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<StoreFile> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreFile::default());
            }
            Err(source) => {
                return Err(FocusError::Store {
                    context: "Failed to read shared store".to_string(),
                    source,
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(StoreFile::default());
        }

        let file: StoreFile =
            serde_json::from_str(&content).map_err(|err| FocusError::StoreFormat {
                path: self.path.clone(),
                details: err.to_string(),
            })?;
        if file.version != STORE_VERSION {
            return Err(FocusError::StoreFormat {
                path: self.path.clone(),
                details: format!(
                    "unsupported version {} (expected {})",
                    file.version, STORE_VERSION
                ),
            });
        }
        Ok(file)
    }

    fn write(&self, file: &StoreFile) -> Result<()> {
        let store_io = |context: &str, source: std::io::Error| FocusError::Store {
            context: context.to_string(),
            source,
        };

        let parent_dir = self.path.parent().ok_or_else(|| FocusError::StoreFormat {
            path: self.path.clone(),
            details: "store path has no parent directory".to_string(),
        })?;
        fs::create_dir_all(parent_dir)
            .map_err(|err| store_io("Failed to create shared store directory", err))?;

        let content = serde_json::to_string_pretty(file).map_err(|err| FocusError::StoreFormat {
            path: self.path.clone(),
            details: err.to_string(),
        })?;

        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|err| store_io("Failed to create temp store file", err))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|err| store_io("Failed to write temp store file", err))?;
        temp_file
            .flush()
            .map_err(|err| store_io("Failed to flush temp store file", err))?;
        temp_file
            .persist(&self.path)
            .map_err(|err| store_io("Failed to commit shared store", err.error))?;
        Ok(())
    }
}

impl SharedStore for FileStore {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.read() {
            Ok(file) => file.values.get(key).copied().unwrap_or(default),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    key,
                    default,
                    "Shared store unreadable; using default"
                );
                default
            }
        }
    }

    fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        // A corrupt file is replaced rather than blocking every future write.
        let mut file = self.read().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Discarding unreadable shared store");
            StoreFile::default()
        });
        file.values.insert(key.to_string(), value);
        self.write(&file)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedStore for MemoryStore {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or(default)
    }

    fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let store = FileStore::new(temp.path().join("state.json"));
        assert!(store.get_bool(KEY_IS_PAUSED, true));
        assert!(!store.get_bool(KEY_IS_FOREGROUND, false));
    }

    #[test]
    fn test_values_visible_through_second_handle() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("state.json");
        let writer = FileStore::new(&path);
        let reader = FileStore::new(&path);

        writer.put_bool(KEY_IS_FOREGROUND, true).unwrap();
        writer.put_bool(KEY_IS_PAUSED, false).unwrap();

        assert!(reader.get_bool(KEY_IS_FOREGROUND, false));
        assert!(!reader.get_bool(KEY_IS_PAUSED, true));
    }

    #[test]
    fn test_corrupt_file_degrades_and_is_replaced() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileStore::new(&path);

        assert!(store.get_bool(KEY_IS_PAUSED, true));
        store.put_bool(KEY_IS_PAUSED, false).unwrap();
        assert!(!store.get_bool(KEY_IS_PAUSED, true));
    }

    #[test]
    fn test_version_mismatch_uses_default() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, r#"{"version": 99, "values": {"app_is_foreground": true}}"#).unwrap();
        let store = FileStore::new(&path);
        assert!(!store.get_bool(KEY_IS_FOREGROUND, false));
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, "  \n").unwrap();
        assert!(FileStore::new(&path).get_bool(KEY_IS_PAUSED, true));
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get_bool(KEY_IS_PAUSED, true));
        store.put_bool(KEY_IS_PAUSED, false).unwrap();
        assert!(!store.get_bool(KEY_IS_PAUSED, true));
    }
}
