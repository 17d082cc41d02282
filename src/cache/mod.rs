//! Two-tier persistent cache.
//!
//! Tier A ([`KvStore`]) holds small scalar values. Tier B
//! ([`StructuredBackend`]) holds records grouped into [`Collection`]s. A
//! bounded in-memory snapshot of recently used files, projects and settings
//! answers reads while Tier B is failing. When Tier B fails, writes are
//! buffered in memory and reported with `durable: false`; they are never
//! dropped and never surface as errors.

pub mod backend;
pub mod kv;

pub use backend::{FileBackend, MemoryBackend, RecordPredicate, StructuredBackend};
pub use kv::KvStore;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "queue")]
    Queue,
    #[serde(rename = "files")]
    Files,
    #[serde(rename = "projects")]
    Projects,
    #[serde(rename = "settings")]
    Settings,
    #[serde(rename = "modelHealth")]
    ModelHealth,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Queue,
        Collection::Files,
        Collection::Projects,
        Collection::Settings,
        Collection::ModelHealth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Queue => "queue",
            Collection::Files => "files",
            Collection::Projects => "projects",
            Collection::Settings => "settings",
            Collection::ModelHealth => "modelHealth",
        }
    }

    /// Collections kept in the read snapshot so reads survive a Tier B outage.
    fn snapshotted(&self) -> bool {
        matches!(
            self,
            Collection::Files | Collection::Projects | Collection::Settings
        )
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub collection: Collection,
    pub key: String,
    pub value: serde_json::Value,
    pub last_updated: u64,
}

impl CacheRecord {
    pub fn new(collection: Collection, key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            collection,
            key: key.into(),
            value,
            last_updated: crate::types::now_ms(),
        }
    }
}

/// Outcome of a cache write. `durable == false` means the value only lives
/// in memory for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub durable: bool,
}

/// Records kept in the read snapshot; the least recently touched is evicted.
pub const SNAPSHOT_CAPACITY: usize = 256;

pub struct PersistentCache {
    kv: Arc<KvStore>,
    backend: Arc<dyn StructuredBackend>,
    degraded: AtomicBool,
    /// Writes that Tier B rejected; `None` marks a buffered delete.
    buffered: DashMap<(Collection, String), Option<CacheRecord>>,
    /// Last known good records, tagged with a touch sequence for eviction.
    snapshot: DashMap<(Collection, String), (u64, CacheRecord)>,
    snapshot_seq: AtomicU64,
}

impl PersistentCache {
    /// Open both tiers under `data_dir`. If the file backend fails its
    /// capability probe, records are kept in memory only.
    pub async fn open(data_dir: &Path) -> Arc<Self> {
        let kv = Arc::new(KvStore::load_or_create(data_dir));
        let file_backend = FileBackend::new(data_dir);
        let backend: Arc<dyn StructuredBackend> = match file_backend.probe().await {
            Ok(()) => Arc::new(file_backend),
            Err(e) => {
                tracing::warn!(
                    "[CACHE] Structured store unavailable ({}), using memory-only cache",
                    e
                );
                Arc::new(MemoryBackend::new())
            }
        };
        Self::with_backend(kv, backend)
    }

    pub fn in_memory() -> Arc<Self> {
        Self::with_backend(Arc::new(KvStore::in_memory()), Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(kv: Arc<KvStore>, backend: Arc<dyn StructuredBackend>) -> Arc<Self> {
        tracing::info!("[CACHE] structured tier: {}", backend.name());
        Arc::new(Self {
            kv,
            backend,
            degraded: AtomicBool::new(false),
            buffered: DashMap::new(),
            snapshot: DashMap::new(),
            snapshot_seq: AtomicU64::new(0),
        })
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// True when every accepted write so far has reached durable storage.
    pub fn is_durable(&self) -> bool {
        self.backend.is_durable() && !self.degraded.load(Ordering::SeqCst) && self.buffered.is_empty()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub async fn get(&self, collection: Collection, key: &str) -> Option<CacheRecord> {
        if let Some(buffered) = self.buffered.get(&(collection, key.to_string())) {
            return buffered.value().clone();
        }
        match self.backend.get(collection, key).await {
            Ok(found) => {
                if let Some(record) = &found {
                    self.remember(record);
                }
                found
            }
            Err(e) => {
                tracing::warn!("[CACHE] get {}/{} failed, reading snapshot: {}", collection, key, e);
                self.degraded.store(true, Ordering::SeqCst);
                self.snapshot
                    .get(&(collection, key.to_string()))
                    .map(|entry| entry.value().1.clone())
            }
        }
    }

    fn remember(&self, record: &CacheRecord) {
        if !record.collection.snapshotted() {
            return;
        }
        let map_key = (record.collection, record.key.clone());
        if !self.snapshot.contains_key(&map_key) && self.snapshot.len() >= SNAPSHOT_CAPACITY {
            let oldest = self
                .snapshot
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| entry.key().clone());
            if let Some(oldest) = oldest {
                self.snapshot.remove(&oldest);
            }
        }
        let seq = self.snapshot_seq.fetch_add(1, Ordering::Relaxed);
        self.snapshot.insert(map_key, (seq, record.clone()));
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }

    pub async fn put(
        &self,
        collection: Collection,
        key: &str,
        value: serde_json::Value,
    ) -> WriteReceipt {
        let record = CacheRecord::new(collection, key, value);
        self.put_record(record).await
    }

    pub async fn put_record(&self, record: CacheRecord) -> WriteReceipt {
        let map_key = (record.collection, record.key.clone());
        self.remember(&record);
        match self.backend.put(&record).await {
            Ok(()) => {
                self.buffered.remove(&map_key);
                WriteReceipt {
                    durable: self.backend.is_durable(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    "[CACHE] put {}/{} failed, buffering in memory: {}",
                    record.collection,
                    record.key,
                    e
                );
                self.degraded.store(true, Ordering::SeqCst);
                self.buffered.insert(map_key, Some(record));
                WriteReceipt { durable: false }
            }
        }
    }

    pub async fn query(
        &self,
        collection: Collection,
        predicate: RecordPredicate<'_>,
    ) -> Vec<CacheRecord> {
        let mut records = match self.backend.query(collection, predicate).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("[CACHE] query {} failed, reading snapshot: {}", collection, e);
                self.degraded.store(true, Ordering::SeqCst);
                self.snapshot
                    .iter()
                    .filter(|entry| entry.key().0 == collection)
                    .map(|entry| entry.value().1.clone())
                    .filter(|r| predicate(r))
                    .collect()
            }
        };

        // buffered writes are newer than anything in Tier B
        for entry in self.buffered.iter() {
            let (entry_collection, entry_key) = entry.key();
            if *entry_collection != collection {
                continue;
            }
            records.retain(|r| &r.key != entry_key);
            if let Some(record) = entry.value() {
                if predicate(record) {
                    records.push(record.clone());
                }
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub async fn delete(&self, collection: Collection, key: &str) -> WriteReceipt {
        self.snapshot.remove(&(collection, key.to_string()));
        match self.backend.delete(collection, key).await {
            Ok(()) => {
                self.buffered.remove(&(collection, key.to_string()));
                WriteReceipt {
                    durable: self.backend.is_durable(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    "[CACHE] delete {}/{} failed, buffering in memory: {}",
                    collection,
                    key,
                    e
                );
                self.degraded.store(true, Ordering::SeqCst);
                self.buffered.insert((collection, key.to_string()), None);
                WriteReceipt { durable: false }
            }
        }
    }

    /// Retry buffered writes against Tier B. Returns how many were flushed.
    pub async fn flush_buffered(&self) -> usize {
        let pending: Vec<((Collection, String), Option<CacheRecord>)> = self
            .buffered
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut flushed = 0;
        for ((collection, key), record) in pending {
            let result = match &record {
                Some(record) => self.backend.put(record).await,
                None => self.backend.delete(collection, &key).await,
            };
            match result {
                Ok(()) => {
                    // only drop the buffer entry if nothing newer replaced it meanwhile
                    self.buffered
                        .remove_if(&(collection, key.clone()), |_, current| *current == record);
                    flushed += 1;
                }
                Err(e) => {
                    tracing::debug!("[CACHE] flush of {}/{} still failing: {}", collection, key, e);
                }
            }
        }

        if self.buffered.is_empty() {
            self.degraded.store(false, Ordering::SeqCst);
        }
        if flushed > 0 {
            tracing::info!("[CACHE] flushed {} buffered writes", flushed);
        }
        flushed
    }
}
