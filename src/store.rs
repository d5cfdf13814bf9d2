//! Durable state store collaborators.
//!
//! The engine treats persisted state as opaque bytes keyed by a string. Two
//! implementations ship with the crate: [`MemoryStateStore`] for tests and
//! embedding, and [`FileStateStore`], one JSON file per key.

use crate::error::{IndexingError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Last-writer-wins key/value store for queue, actor and bucket state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, key: &str, state: &[u8]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reads and decodes a JSON state blob.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.read(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn write_json<T: serde::Serialize>(
    store: &dyn StateStore,
    key: &str,
    state: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(state)?;
    store.write(key, &bytes).await
}

#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, Vec<u8>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes subsequent writes fail until switched off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn write(&self, key: &str, state: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IndexingError::Store(format!("write to {} rejected", key)));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(key.to_string(), state.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// One file per key under `base_path`. Key segments separated by `/` become
/// directories; every file is replaced atomically through a temp file.
pub struct FileStateStore {
    base_path: PathBuf,
}

impl FileStateStore {
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        std::fs::create_dir_all(base_path.as_ref())?;
        Ok(FileStateStore {
            base_path: base_path.as_ref().to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let segments: Vec<&str> = key.split('/').collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || *s == "." || *s == "..")
        {
            return Err(IndexingError::Store(format!("invalid key '{}'", key)));
        }
        let mut path = self.base_path.clone();
        let (last, dirs) = segments
            .split_last()
            .ok_or_else(|| IndexingError::Store("empty key".to_string()))?;
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{}.json", last));
        Ok(path)
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base_path).ok()?;
        let rel = rel.to_str()?.strip_suffix(".json")?;
        Some(rel.replace(std::path::MAIN_SEPARATOR, "/"))
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let ft = entry.file_type()?;
        if ft.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if ft.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, state: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let bytes = state.to_vec();
        let result = tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path
                .parent()
                .ok_or_else(|| IndexingError::Store(format!("no parent for {:?}", path)))?;
            std::fs::create_dir_all(dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path)
                .map_err(|e| IndexingError::Io(e.error.to_string()))?;
            Ok(())
        })
        .await;

        match result {
            Ok(r) => r,
            Err(e) => Err(IndexingError::Store(format!(
                "write task for {} failed: {:?}",
                key, e
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.base_path.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            collect_files(&base, &mut out)?;
            Ok::<_, std::io::Error>(out)
        })
        .await
        .map_err(|e| IndexingError::Store(format!("key scan failed: {:?}", e)))??;

        let mut keys: Vec<String> = files
            .iter()
            .filter_map(|p| self.key_for(p))
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_counts_writes() {
        let store = MemoryStateStore::new();
        store.write("a", b"1").await.unwrap();
        store.write("a", b"2").await.unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.read("a").await.unwrap(), Some(b"2".to_vec()));

        store.set_fail_writes(true);
        assert!(store.write("a", b"3").await.is_err());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::open(tmp.path()).unwrap();

        store
            .write("workflow-queue/IPlayer/0@host-a", b"{}")
            .await
            .unwrap();
        store.write("actor/Player/p1", b"[1]").await.unwrap();

        assert_eq!(
            store.read("actor/Player/p1").await.unwrap(),
            Some(b"[1]".to_vec())
        );
        assert_eq!(store.read("actor/Player/p2").await.unwrap(), None);

        let keys = store.keys("workflow-queue/").await.unwrap();
        assert_eq!(keys, vec!["workflow-queue/IPlayer/0@host-a".to_string()]);

        store.delete("actor/Player/p1").await.unwrap();
        assert_eq!(store.read("actor/Player/p1").await.unwrap(), None);
        store.delete("actor/Player/p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::open(tmp.path()).unwrap();
        assert!(store.write("../escape", b"x").await.is_err());
        assert!(store.read("a//b").await.is_err());
    }
}
