// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Error type for store-related operations.
///
/// Most callers treat this as a thin wrapper around `anyhow::Error`, but a
/// concrete kind is useful when deciding whether to fall back to an explicit
/// `--data-dir`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to determine data directory")]
    NoDataDir,
    #[error("store path {0} has no file name")]
    InvalidPath(PathBuf),
}

/// Returns the base data directory for tokmeter.
///
/// This is the platform data directory for the `tokmeter` project, e.g.
///
///   `${HOME}/.local/share/tokmeter/`
///
/// on Linux. Deployments that want the registry next to the service should
/// pass an explicit path instead (see [`JsonStore::at_path`]).
pub fn tokmeter_data_root() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "tokmeter").ok_or(StoreError::NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}

/// JSON-backed file store for a single logical value.
///
/// The store is synchronous and deliberately small. It provides:
///
/// - a well-defined on-disk location,
/// - atomic replace-on-write (temporary file + rename in the same directory),
/// - modification timestamps so callers can detect writes made by someone
///   else (another process, an operator editing the file).
///
/// ```ignore
/// let store = JsonStore::at_path("/var/lib/tokmeter/models.json")?;
/// let raw: Option<serde_json::Value> = store.load_optional()?;
/// store.save(&registry)?;
/// ```
#[derive(Debug, Clone)]
pub struct JsonStore {
    /// Full path to the JSON file backing this store.
    path: PathBuf,
}

impl JsonStore {
    /// Create a store backed by an explicit file path.
    ///
    /// The parent directory is created lazily on the first save.
    pub fn at_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.file_name().is_none() {
            return Err(StoreError::InvalidPath(path).into());
        }
        Ok(JsonStore { path })
    }

    /// Returns the underlying path of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the value from disk if present, otherwise return `None`.
    ///
    /// An empty (or whitespace-only) file is treated the same as a missing
    /// one. This never creates the file.
    pub fn load_optional<T>(&self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let mut file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to open store file {}", self.path.display())
                })
            }
        };
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .with_context(|| format!("failed to read store file {}", self.path.display()))?;

        if buf.trim().is_empty() {
            return Ok(None);
        }

        let value = serde_json::from_str(&buf)
            .with_context(|| format!("failed to parse JSON from {}", self.path.display()))?;
        Ok(Some(value))
    }

    /// Persist the given value as pretty-printed JSON.
    ///
    /// The value is serialised first, written and synced to
    /// `{file}.tmp` next to the target and then renamed over the target, so
    /// a concurrent reader sees either the old or the new document, never a
    /// partial one.
    pub fn save<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create parent dir {} for store", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(value)
            .with_context(|| "failed to serialise value to JSON for store")?;

        let tmp_path = self.tmp_path();

        {
            let mut file = fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create temporary store file {}", tmp_path.display())
            })?;
            file.write_all(json.as_bytes()).with_context(|| {
                format!("failed to write temporary store file {}", tmp_path.display())
            })?;
            file.sync_all().with_context(|| {
                format!("failed to sync temporary store file {}", tmp_path.display())
            })?;
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to rename temporary store file {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }

    /// Modification time of the backing file, or `None` if it does not exist.
    ///
    /// Only meant for equality comparisons: any change in the reported value,
    /// including one that goes backwards, means the file was rewritten.
    pub fn modified(&self) -> Result<Option<SystemTime>> {
        match fs::metadata(&self.path) {
            Ok(meta) => {
                let mtime = meta.modified().with_context(|| {
                    format!("failed to read mtime of {}", self.path.display())
                })?;
                Ok(Some(mtime))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("failed to stat store file {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct TestState {
        values: BTreeMap<String, u64>,
    }

    #[test]
    fn roundtrip_save_and_load() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::at_path(root.path().join("state.json")).unwrap();

        let mut state = TestState::default();
        state.values.insert("gpt-4o".into(), 3);

        store.save(&state).unwrap();

        let loaded: TestState = store.load_optional().unwrap().unwrap();
        assert_eq!(state, loaded);
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn load_optional_none_for_missing_file() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::at_path(root.path().join("missing.json")).unwrap();

        let loaded: Option<TestState> = store.load_optional().unwrap();
        assert!(loaded.is_none());
        assert!(store.modified().unwrap().is_none());
    }

    #[test]
    fn empty_file_reads_as_missing() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::at_path(root.path().join("blank.json")).unwrap();
        fs::write(store.path(), "  \n").unwrap();

        let loaded: Option<TestState> = store.load_optional().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::at_path(root.path().join("corrupt.json")).unwrap();
        fs::write(store.path(), "{ not json").unwrap();

        let loaded: Result<Option<TestState>> = store.load_optional();
        assert!(loaded.is_err());
    }

    #[test]
    fn modified_reports_after_save() {
        let root = tempfile::tempdir().unwrap();
        let store = JsonStore::at_path(root.path().join("nested").join("models.json")).unwrap();

        store.save(&TestState::default()).unwrap();
        assert!(store.modified().unwrap().is_some());
        assert_eq!(store.tmp_path(), root.path().join("nested").join("models.json.tmp"));
    }
}
