//! Key-value persistence seam for the lock and job records.
//!
//! Every record is an opaque string (JSON in practice). Writers that share a
//! record coordinate through [`StateStore::compare_and_swap`], so a writer
//! only replaces the exact value it read.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Persisted key-value store shared by the orchestrator and the worker.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current value for `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditionally write `value` under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Replace the value under `key` only if it currently equals `expected`.
    ///
    /// `expected = None` means "only if absent" (create-if-absent) and
    /// `new = None` deletes the record. Returns `Ok(false)` when the current
    /// value did not match; that is not an error.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Delete `key`. Deleting an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Where an external process can read and write `key` directly, if the
    /// backend is shared outside this process.
    fn location(&self, _key: &str) -> Option<StateLocation> {
        None
    }
}

/// Address of a record for processes outside the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLocation {
    /// A JSON file, replaced whole on every write.
    File(PathBuf),
    /// A row of the `sync_state` table (`key`, `value`) in a SQLite database.
    Sqlite { db: PathBuf, key: String },
}

impl StateLocation {
    /// Environment variables handing this location to a worker.
    pub fn env_vars(&self) -> Vec<(&'static str, OsString)> {
        match self {
            StateLocation::File(path) => vec![("SYNC_STATE_FILE", path.into())],
            StateLocation::Sqlite { db, key } => vec![
                ("SYNC_STATE_DB", db.into()),
                ("SYNC_STATE_KEY", key.into()),
            ],
        }
    }
}

/// One JSON file per key inside a state directory.
///
/// Writes land in a temp file that is renamed into place, so readers never
/// observe a half-written record. Create-if-absent uses a hard link, which
/// fails atomically across processes when the target already exists. Swaps
/// that replace an existing value are serialized per store instance; two
/// orchestrator processes replacing the same record can still interleave.
pub struct FileStore {
    dir: PathBuf,
    swap: Mutex<()>,
}

impl FileStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self {
            dir,
            swap: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!(".{key}.{}.tmp", ulid::Ulid::new()))
    }

    async fn write_temp(&self, key: &str, value: &str) -> Result<PathBuf, StoreError> {
        let tmp = self.temp_path_for(key);
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        Ok(tmp)
    }

    async fn replace(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let tmp = self.write_temp(key, value).await?;
        let path = self.path_for(key);
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::io(&path, e));
        }
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let tmp = self.write_temp(key, value).await?;
        let path = self.path_for(key);
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.replace(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let _guard = self.swap.lock().await;

        let Some(expected) = expected else {
            return match new {
                Some(value) => self.create_if_absent(key, value).await,
                None => Ok(self.get(key).await?.is_none()),
            };
        };

        if self.get(key).await?.as_deref() != Some(expected) {
            return Ok(false);
        }
        match new {
            Some(value) => self.replace(key, value).await?,
            None => self.remove(key).await?,
        }
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn location(&self, key: &str) -> Option<StateLocation> {
        Some(StateLocation::File(self.path_for(key)))
    }
}

/// In-process store, used by tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value.to_string());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise_cas(store: &dyn StateStore) {
        assert!(store.compare_and_swap("k", None, Some("a")).await.unwrap());
        // create-if-absent fails once present
        assert!(!store.compare_and_swap("k", None, Some("b")).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        // mismatched expectation leaves the value alone
        assert!(!store.compare_and_swap("k", Some("x"), Some("b")).await.unwrap());
        assert!(store.compare_and_swap("k", Some("a"), Some("b")).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));

        // delete-if-equal
        assert!(!store.compare_and_swap("k", Some("a"), None).await.unwrap());
        assert!(store.compare_and_swap("k", Some("b"), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_compare_and_swap() {
        exercise_cas(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        exercise_cas(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_get_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.set("k", "v").await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_location_and_no_temp_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nested")).unwrap();
        store.set("job", "{}").await.unwrap();
        assert!(store.compare_and_swap("lock", None, Some("{}")).await.unwrap());

        let path = dir.path().join("nested").join("job.json");
        assert_eq!(store.location("job"), Some(StateLocation::File(path.clone())));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "{}");

        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "leftover temp files: {names:?}");
    }

    #[tokio::test]
    async fn test_file_store_external_writer_is_visible() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("state.json"), "written by worker").unwrap();
        assert_eq!(
            store.get("state").await.unwrap().as_deref(),
            Some("written by worker")
        );
    }
}
