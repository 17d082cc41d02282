//! Offline Write Queue.
//!
//! Mutations that could not reach the backend are persisted in the `queue`
//! collection and replayed later. Entries for one resource key replay in
//! strict FIFO order; distinct keys replay concurrently up to a fixed limit.

use crate::cache::{Collection, PersistentCache, WriteReceipt};
use crate::error::{LifelineError, Result};
use crate::retry::{AttemptContext, RetryExecutor, RetryPolicy};
use crate::types::{now_ms, payload_version};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueStatus::Pending => "PENDING",
            QueueStatus::InFlight => "IN_FLIGHT",
            QueueStatus::Done => "DONE",
            QueueStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    /// Enqueue order; FIFO within a resource key follows this.
    pub seq: u64,
    pub resource_key: String,
    pub operation: String,
    pub payload: serde_json::Value,
    /// Version the resource has once this entry is applied.
    pub version_hash: String,
    /// Version the caller last saw before mutating, if known.
    pub base_version: Option<String>,
    pub status: QueueStatus,
    pub attempt_count: u32,
    pub created_at: u64,
    pub last_error: Option<String>,
}

/// Where replayed entries are applied.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Current remote version of `resource_key`, `None` if it does not exist.
    async fn current_version(&self, resource_key: &str) -> Result<Option<String>>;

    async fn apply(&self, entry: &QueueEntry, ctx: AttemptContext) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Entries submitted to the backend.
    pub applied: usize,
    /// Entries whose target version was already present remotely.
    pub already_applied: usize,
    /// Entries that hit a non-retryable error and are now FAILED.
    pub failed: usize,
    /// Entries put back to PENDING after exhausting retries.
    pub deferred: usize,
    /// Keys skipped because an earlier entry for them is FAILED.
    pub blocked_keys: Vec<String>,
    /// Keys skipped because another replay cycle holds them.
    pub busy_keys: Vec<String>,
    pub errors: Vec<String>,
}

impl ReplayReport {
    pub fn completed(&self) -> usize {
        self.applied + self.already_applied
    }

    fn merge_group(&mut self, other: ReplayReport) {
        self.applied += other.applied;
        self.already_applied += other.already_applied;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.errors.extend(other.errors);
    }
}

/// Removes its key from the claim map when dropped.
struct Claim<'a> {
    claims: &'a DashMap<String, ()>,
    key: String,
}

impl<'a> Claim<'a> {
    fn acquire(claims: &'a DashMap<String, ()>, key: &str) -> Option<Self> {
        match claims.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(());
                Some(Claim {
                    claims,
                    key: key.to_string(),
                })
            }
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.key);
    }
}

enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

pub struct OfflineQueue {
    cache: Arc<PersistentCache>,
    entries: DashMap<String, QueueEntry>,
    next_seq: AtomicU64,
    concurrency: usize,
    claimed_entries: DashMap<String, ()>,
    claimed_keys: DashMap<String, ()>,
}

impl OfflineQueue {
    /// Load persisted entries. Entries left IN_FLIGHT by a previous process
    /// go back to PENDING.
    pub async fn open(cache: Arc<PersistentCache>, concurrency: usize) -> Arc<Self> {
        let records = cache.query(Collection::Queue, &|_| true).await;
        let entries = DashMap::new();
        let mut max_seq = 0;
        for record in records {
            let mut entry: QueueEntry = match serde_json::from_value(record.value) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("[QUEUE] dropping unreadable entry {}: {}", record.key, e);
                    continue;
                }
            };
            if entry.status == QueueStatus::Done {
                cache.delete(Collection::Queue, &entry.id).await;
                continue;
            }
            if entry.status == QueueStatus::InFlight {
                entry.status = QueueStatus::Pending;
            }
            max_seq = max_seq.max(entry.seq);
            entries.insert(entry.id.clone(), entry);
        }
        if !entries.is_empty() {
            tracing::info!("[QUEUE] restored {} queued entries", entries.len());
        }

        Arc::new(Self {
            cache,
            entries,
            next_seq: AtomicU64::new(max_seq + 1),
            concurrency: concurrency.max(1),
            claimed_entries: DashMap::new(),
            claimed_keys: DashMap::new(),
        })
    }

    /// Append a PENDING entry. It is persisted before this returns; the
    /// receipt says whether that storage is durable.
    pub async fn enqueue(
        &self,
        resource_key: &str,
        operation: &str,
        payload: serde_json::Value,
        base_version: Option<String>,
    ) -> (QueueEntry, WriteReceipt) {
        let entry = QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            resource_key: resource_key.to_string(),
            operation: operation.to_string(),
            version_hash: payload_version(&payload),
            payload,
            base_version,
            status: QueueStatus::Pending,
            attempt_count: 0,
            created_at: now_ms(),
            last_error: None,
        };
        let receipt = self.persist(&entry).await;
        self.entries.insert(entry.id.clone(), entry.clone());
        tracing::info!(
            "[QUEUE] queued {} for {} (seq={}, durable={})",
            entry.operation,
            entry.resource_key,
            entry.seq,
            receipt.durable
        );
        (entry, receipt)
    }

    async fn persist(&self, entry: &QueueEntry) -> WriteReceipt {
        match serde_json::to_value(entry) {
            Ok(value) => self.cache.put(Collection::Queue, &entry.id, value).await,
            Err(e) => {
                tracing::error!("[QUEUE] failed to encode entry {}: {}", entry.id, e);
                WriteReceipt { durable: false }
            }
        }
    }

    /// All retained entries ordered by enqueue sequence.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut all: Vec<QueueEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.seq);
        all
    }

    pub fn get(&self, id: &str) -> Option<QueueEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .count()
    }

    pub fn failed(&self) -> Vec<QueueEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.status == QueueStatus::Failed)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True while any retained entry targets `resource_key`. New mutations
    /// for that key must queue behind it.
    pub fn has_entries_for(&self, resource_key: &str) -> bool {
        self.entries.iter().any(|e| e.resource_key == resource_key)
    }

    /// Payload of the newest retained entry for `resource_key`.
    pub fn latest_payload(&self, resource_key: &str) -> Option<serde_json::Value> {
        self.entries
            .iter()
            .filter(|e| e.resource_key == resource_key)
            .max_by_key(|e| e.seq)
            .map(|e| e.payload.clone())
    }

    /// Put a FAILED entry back to PENDING.
    pub async fn retry_failed(&self, id: &str) -> Result<QueueEntry> {
        let entry = {
            let mut entry = self
                .entries
                .get_mut(id)
                .ok_or_else(|| LifelineError::NotFound(format!("queue entry {}", id)))?;
            if entry.status != QueueStatus::Failed {
                return Err(LifelineError::QueueReplay {
                    entry_id: id.to_string(),
                    message: format!("entry is {}, not FAILED", entry.status),
                });
            }
            entry.status = QueueStatus::Pending;
            entry.last_error = None;
            entry.clone()
        };
        self.persist(&entry).await;
        tracing::info!("[QUEUE] entry {} re-queued for {}", id, entry.resource_key);
        Ok(entry)
    }

    /// Drop an entry that is not currently being replayed.
    pub async fn discard(&self, id: &str) -> Result<QueueEntry> {
        let _claim = Claim::acquire(&self.claimed_entries, id).ok_or_else(|| {
            LifelineError::QueueReplay {
                entry_id: id.to_string(),
                message: "entry is being replayed".to_string(),
            }
        })?;
        let (_, entry) = self
            .entries
            .remove(id)
            .ok_or_else(|| LifelineError::NotFound(format!("queue entry {}", id)))?;
        self.cache.delete(Collection::Queue, id).await;
        tracing::info!("[QUEUE] discarded entry {} for {}", id, entry.resource_key);
        Ok(entry)
    }

    /// Replay PENDING entries against `target`. Per-entry failures are
    /// recorded in the report and never abort other keys.
    pub async fn replay(
        &self,
        target: &dyn ReplayTarget,
        executor: &RetryExecutor,
        policy: &RetryPolicy,
    ) -> ReplayReport {
        let mut groups: BTreeMap<String, Vec<QueueEntry>> = BTreeMap::new();
        for entry in self.entries() {
            groups.entry(entry.resource_key.clone()).or_default().push(entry);
        }

        let mut report = ReplayReport::default();
        let mut runnable = Vec::new();
        for (key, group) in groups {
            if group.iter().any(|e| e.status == QueueStatus::Failed) {
                if group.iter().any(|e| e.status == QueueStatus::Pending) {
                    report.blocked_keys.push(key);
                }
                continue;
            }
            let pending: Vec<QueueEntry> = group
                .into_iter()
                .filter(|e| e.status == QueueStatus::Pending)
                .collect();
            if !pending.is_empty() {
                runnable.push((key, pending));
            }
        }

        if runnable.is_empty() {
            return report;
        }
        tracing::info!(
            "[QUEUE] replaying {} resource keys (concurrency={})",
            runnable.len(),
            self.concurrency
        );

        let shared = Mutex::new(report);
        futures::stream::iter(runnable)
            .for_each_concurrent(self.concurrency, |(key, group)| {
                let shared = &shared;
                async move {
                    let claim = match Claim::acquire(&self.claimed_keys, &key) {
                        Some(c) => c,
                        None => {
                            tracing::debug!("[QUEUE] {} already replaying elsewhere", key);
                            shared
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .busy_keys
                                .push(key);
                            return;
                        }
                    };
                    let group_report = self.replay_group(&group, target, executor, policy).await;
                    drop(claim);
                    shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .merge_group(group_report);
                }
            })
            .await;

        let mut report = shared.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.busy_keys.sort();
        tracing::info!(
            "[QUEUE] replay finished: applied={} already_applied={} failed={} deferred={}",
            report.applied,
            report.already_applied,
            report.failed,
            report.deferred
        );
        report
    }

    /// Apply one key's entries in order, stopping at the first entry that
    /// does not complete.
    async fn replay_group(
        &self,
        group: &[QueueEntry],
        target: &dyn ReplayTarget,
        executor: &RetryExecutor,
        policy: &RetryPolicy,
    ) -> ReplayReport {
        let mut report = ReplayReport::default();

        for queued in group {
            let _claim = match Claim::acquire(&self.claimed_entries, &queued.id) {
                Some(c) => c,
                None => break,
            };

            // re-read: the entry may have been discarded since the snapshot
            let entry = {
                let mut current = match self.entries.get_mut(&queued.id) {
                    Some(e) if e.status == QueueStatus::Pending => e,
                    Some(_) => break,
                    None => continue,
                };
                current.status = QueueStatus::InFlight;
                current.attempt_count += 1;
                current.clone()
            };
            self.persist(&entry).await;

            let outcome = executor
                .execute(policy, |ctx| {
                    let entry = &entry;
                    async move {
                        let remote = target.current_version(&entry.resource_key).await?;
                        if remote.as_deref() == Some(entry.version_hash.as_str()) {
                            return Ok(ApplyOutcome::AlreadyApplied);
                        }
                        target.apply(entry, ctx).await?;
                        Ok(ApplyOutcome::Applied)
                    }
                })
                .await;

            match outcome {
                Ok(applied) => {
                    match applied {
                        ApplyOutcome::Applied => report.applied += 1,
                        ApplyOutcome::AlreadyApplied => {
                            tracing::debug!(
                                "[QUEUE] {} already at target version, skipping",
                                entry.id
                            );
                            report.already_applied += 1;
                        }
                    }
                    self.entries.remove(&entry.id);
                    self.cache.delete(Collection::Queue, &entry.id).await;
                }
                Err(e) => {
                    let retry_later = e.is_connectivity_failure();
                    let replay_err = LifelineError::QueueReplay {
                        entry_id: entry.id.clone(),
                        message: e.to_string(),
                    };
                    let updated = self.entries.get_mut(&entry.id).map(|mut current| {
                        current.status = if retry_later {
                            QueueStatus::Pending
                        } else {
                            QueueStatus::Failed
                        };
                        current.last_error = Some(e.to_string());
                        current.clone()
                    });
                    if let Some(updated) = updated {
                        self.persist(&updated).await;
                    }
                    if retry_later {
                        tracing::warn!("[QUEUE] {}; will retry next cycle", replay_err);
                        report.deferred += 1;
                    } else {
                        tracing::error!("[QUEUE] {}; marked FAILED", replay_err);
                        report.failed += 1;
                    }
                    report.errors.push(replay_err.to_string());
                    break;
                }
            }
        }
        report
    }
}
