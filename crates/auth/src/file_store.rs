//! File-backed session store
//!
//! All keys live in one JSON object on disk. Every mutation rewrites the
//! whole file through a temporary file in the same directory followed by an
//! atomic rename, so readers in other processes observe either the old or
//! the new map and never a torn write.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::store::SessionStore;

type Records = BTreeMap<String, String>;

/// [`SessionStore`] persisted to a JSON file
#[derive(Debug)]
pub struct FileStore {
    path: Arc<PathBuf>,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Use `path` as the backing file. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Arc::new(path.into()), write_lock: Mutex::new(()) }
    }

    /// Location of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || f(&path))
            .await
            .map_err(|e| StoreError::Backend(format!("spawn_blocking failed: {e}")))?
    }

    async fn update<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Records) + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        self.run_blocking(move |path| {
            let mut records = read_records(path)?;
            mutate(&mut records);
            write_records(path, &records)
        })
        .await
    }
}

fn read_records(path: &Path) -> Result<Records, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(Records::new()),
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Records::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_records(path: &Path, records: &Records) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    serde_json::to_writer(&mut tmp, records)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

    debug!(path = %path.display(), keys = records.len(), "Session file written");
    Ok(())
}

#[async_trait]
impl SessionStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run_blocking(move |path| Ok(read_records(path)?.remove(&key))).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.update(move |records| {
            records.insert(key, value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.update(move |records| {
            records.remove(&key);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("session.json"));

        assert_eq!(store.get("auth_tokens").await.unwrap(), None);
        // Removing from a missing file is fine too
        store.remove("auth_tokens").await.unwrap();
    }

    #[tokio::test]
    async fn values_survive_a_new_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = FileStore::new(&path);
        store.set("oauth_state", "\"abc\"").await.unwrap();
        store.set("oauth_code_verifier", "\"xyz\"").await.unwrap();
        drop(store);

        let reopened = FileStore::new(&path);
        assert_eq!(reopened.get("oauth_state").await.unwrap().as_deref(), Some("\"abc\""));
        reopened.remove("oauth_state").await.unwrap();
        assert_eq!(reopened.get("oauth_state").await.unwrap(), None);
        assert_eq!(reopened.get("oauth_code_verifier").await.unwrap().as_deref(), Some("\"xyz\""));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_keys() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(dir.path().join("session.json")));

        let writes = (0..16).map(|i| {
            let store = Arc::clone(&store);
            async move { store.set(&format!("key-{i}"), "v").await }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        for i in 0..16 {
            assert!(store.get(&format!("key-{i}")).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::new(&path);
        assert!(matches!(store.get("auth_tokens").await, Err(StoreError::Serialization(_))));
    }
}
