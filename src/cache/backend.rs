//! Tier B storage backends.

use super::{CacheRecord, Collection};
use crate::error::{LifelineError, Result};
use crate::types::content_version;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

pub type RecordPredicate<'a> = &'a (dyn Fn(&CacheRecord) -> bool + Send + Sync);

/// Async record store organized into named collections.
#[async_trait]
pub trait StructuredBackend: Send + Sync {
    /// Short label for logs and health output.
    fn name(&self) -> &'static str;

    /// Whether a successful write survives a restart.
    fn is_durable(&self) -> bool;

    /// Startup capability check: fails if the backend cannot store records.
    async fn probe(&self) -> Result<()>;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<CacheRecord>>;

    async fn put(&self, record: &CacheRecord) -> Result<()>;

    async fn query(
        &self,
        collection: Collection,
        predicate: RecordPredicate<'_>,
    ) -> Result<Vec<CacheRecord>>;

    async fn delete(&self, collection: Collection, key: &str) -> Result<()>;
}

/// One JSON file per record under `{root}/collections/{collection}/`.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("collections"),
        }
    }

    fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    fn record_path(&self, collection: Collection, key: &str) -> PathBuf {
        // keys are arbitrary strings (file paths included), so hash them
        self.collection_dir(collection)
            .join(format!("{}.json", content_version(key.as_bytes())))
    }
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> LifelineError {
    LifelineError::Storage(format!("{}: {}", context, e))
}

#[async_trait]
impl StructuredBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_durable(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| storage_err("create collections dir", e))?;
        let probe_path = self.root.join(".probe");
        tokio::fs::write(&probe_path, b"ok")
            .await
            .map_err(|e| storage_err("write probe file", e))?;
        tokio::fs::remove_file(&probe_path)
            .await
            .map_err(|e| storage_err("remove probe file", e))?;
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<CacheRecord>> {
        let path = self.record_path(collection, key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: CacheRecord = serde_json::from_slice(&bytes)?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read record", e)),
        }
    }

    async fn put(&self, record: &CacheRecord) -> Result<()> {
        let dir = self.collection_dir(record.collection);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("create collection dir", e))?;
        let path = self.record_path(record.collection, &record.key);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| storage_err("write record", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_err("commit record", e))?;
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        predicate: RecordPredicate<'_>,
    ) -> Result<Vec<CacheRecord>> {
        let dir = self.collection_dir(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("list collection", e)),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("list collection", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("[CACHE] Skipping unreadable record {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_slice::<CacheRecord>(&bytes) {
                Ok(record) if predicate(&record) => results.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!("[CACHE] Skipping corrupt record {:?}: {}", path, e),
            }
        }
        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(collection, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("delete record", e)),
        }
    }
}

/// Process-lifetime store used when no durable backend is available.
#[derive(Default)]
pub struct MemoryBackend {
    records: DashMap<(Collection, String), CacheRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StructuredBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<CacheRecord>> {
        Ok(self
            .records
            .get(&(collection, key.to_string()))
            .map(|r| r.value().clone()))
    }

    async fn put(&self, record: &CacheRecord) -> Result<()> {
        self.records
            .insert((record.collection, record.key.clone()), record.clone());
        Ok(())
    }

    async fn query(
        &self,
        collection: Collection,
        predicate: RecordPredicate<'_>,
    ) -> Result<Vec<CacheRecord>> {
        let mut results: Vec<CacheRecord> = self
            .records
            .iter()
            .filter(|e| e.key().0 == collection && predicate(e.value()))
            .map(|e| e.value().clone())
            .collect();
        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        self.records.remove(&(collection, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(collection: Collection, key: &str, value: serde_json::Value) -> CacheRecord {
        CacheRecord::new(collection, key, value)
    }

    #[tokio::test]
    async fn test_file_backend_crud() {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::new(tmp.path());
        backend.probe().await.unwrap();

        let rec = record(Collection::Files, "src/main.py", serde_json::json!("print(1)"));
        backend.put(&rec).await.unwrap();

        let loaded = backend.get(Collection::Files, "src/main.py").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(backend.get(Collection::Projects, "src/main.py").await.unwrap().is_none());

        backend.delete(Collection::Files, "src/main.py").await.unwrap();
        assert!(backend.get(Collection::Files, "src/main.py").await.unwrap().is_none());
        // deleting twice is fine
        backend.delete(Collection::Files, "src/main.py").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backend_query_filters() {
        let tmp = TempDir::new().unwrap();
        let backend = FileBackend::new(tmp.path());
        for (key, n) in [("a", 1), ("b", 2), ("c", 3)] {
            backend
                .put(&record(Collection::Settings, key, serde_json::json!({ "n": n })))
                .await
                .unwrap();
        }

        let odd = backend
            .query(Collection::Settings, &|r| r.value["n"].as_i64().unwrap_or(0) % 2 == 1)
            .await
            .unwrap();
        let keys: Vec<_> = odd.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);

        let empty = backend.query(Collection::Queue, &|_| true).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_file_backend_probe_fails_on_unwritable_root() {
        let tmp = TempDir::new().unwrap();
        // a regular file where the collections directory should be
        std::fs::write(tmp.path().join("collections"), b"blocked").unwrap();
        let backend = FileBackend::new(tmp.path());
        assert!(matches!(backend.probe().await, Err(LifelineError::Storage(_))));
    }

    #[tokio::test]
    async fn test_memory_backend_crud() {
        let backend = MemoryBackend::new();
        let rec = record(Collection::ModelHealth, "m1", serde_json::json!({"healthy": true}));
        backend.put(&rec).await.unwrap();
        assert_eq!(backend.get(Collection::ModelHealth, "m1").await.unwrap(), Some(rec));
        assert_eq!(backend.query(Collection::ModelHealth, &|_| true).await.unwrap().len(), 1);
        backend.delete(Collection::ModelHealth, "m1").await.unwrap();
        assert!(backend.get(Collection::ModelHealth, "m1").await.unwrap().is_none());
        assert!(!backend.is_durable());
    }
}
