//! Model Fallback Manager: per-model health records and model selection.

use crate::types::{now_ms, ModelId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEALTH_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelHealthRecord {
    pub model_id: ModelId,
    pub healthy: bool,
    /// Consecutive failures since the last success or reset.
    pub failure_count: u32,
    pub last_used: Option<u64>,
    pub last_error: Option<String>,
    /// While in the future, an unhealthy model is skipped.
    pub cooldown_until: Option<u64>,
    pub last_failure_at: Option<u64>,
    pub last_latency_ms: Option<u64>,
    pub success_count: u64,
    pub total_failures: u64,
    pub last_meta: Option<serde_json::Value>,
}

impl ModelHealthRecord {
    fn new(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            healthy: true,
            failure_count: 0,
            last_used: None,
            last_error: None,
            cooldown_until: None,
            last_failure_at: None,
            last_latency_ms: None,
            success_count: 0,
            total_failures: 0,
            last_meta: None,
        }
    }

    pub fn is_eligible(&self, now: u64) -> bool {
        self.healthy || self.cooldown_until.map_or(true, |until| until <= now)
    }
}

pub struct ModelFallbackManager {
    records: DashMap<ModelId, ModelHealthRecord>,
    threshold: u32,
    cooldown_ms: u64,
}

impl Default for ModelFallbackManager {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_THRESHOLD, DEFAULT_COOLDOWN_MS)
    }
}

impl ModelFallbackManager {
    pub fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            records: DashMap::new(),
            threshold: threshold.max(1),
            cooldown_ms,
        }
    }

    pub fn record_success(&self, model: &str, meta: Option<serde_json::Value>, latency_ms: u64) {
        self.record_success_at(model, meta, latency_ms, now_ms());
    }

    fn record_success_at(
        &self,
        model: &str,
        meta: Option<serde_json::Value>,
        latency_ms: u64,
        now: u64,
    ) {
        let mut record = self
            .records
            .entry(model.to_string())
            .or_insert_with(|| ModelHealthRecord::new(model));
        if !record.healthy {
            tracing::info!("[MODELS] {} recovered", model);
        }
        record.healthy = true;
        record.failure_count = 0;
        record.cooldown_until = None;
        record.success_count += 1;
        record.last_used = Some(now);
        record.last_latency_ms = Some(latency_ms);
        if meta.is_some() {
            record.last_meta = meta;
        }
    }

    pub fn record_failure(&self, model: &str, error: &str) {
        self.record_failure_at(model, error, now_ms());
    }

    fn record_failure_at(&self, model: &str, error: &str, now: u64) {
        let mut record = self
            .records
            .entry(model.to_string())
            .or_insert_with(|| ModelHealthRecord::new(model));
        record.failure_count = record.failure_count.saturating_add(1);
        record.total_failures += 1;
        record.last_used = Some(now);
        record.last_failure_at = Some(now);
        record.last_error = Some(error.to_string());

        if record.failure_count >= self.threshold {
            if record.healthy {
                tracing::warn!(
                    "[MODELS] {} marked unhealthy after {} consecutive failures: {}",
                    model,
                    record.failure_count,
                    error
                );
            }
            record.healthy = false;
            record.cooldown_until = Some(now.saturating_add(self.cooldown_ms));
        }
    }

    /// First eligible model in `priority` order, restricted to `available`
    /// when given. If every candidate is cooling down, the one that failed
    /// least recently is returned.
    pub fn select_model(&self, priority: &[ModelId], available: Option<&[ModelId]>) -> Option<ModelId> {
        self.select_model_at(priority, available, now_ms())
    }

    fn select_model_at(
        &self,
        priority: &[ModelId],
        available: Option<&[ModelId]>,
        now: u64,
    ) -> Option<ModelId> {
        let candidates: Vec<&ModelId> = priority
            .iter()
            .filter(|m| available.map_or(true, |avail| avail.contains(m)))
            .collect();

        for model in &candidates {
            let eligible = self
                .records
                .get(model.as_str())
                .map_or(true, |r| r.is_eligible(now));
            if eligible {
                return Some((*model).clone());
            }
        }

        let fallback = candidates
            .iter()
            .min_by_key(|m| {
                self.records
                    .get(m.as_str())
                    .and_then(|r| r.last_failure_at)
                    .unwrap_or(0)
            })
            .map(|m| (*m).clone());
        if let Some(model) = &fallback {
            tracing::warn!(
                "[MODELS] all candidates cooling down, using least recently failed: {}",
                model
            );
        }
        fallback
    }

    /// Clear failure state for one model, or for all when `model` is `None`.
    pub fn reset_health(&self, model: Option<&str>) {
        let reset = |record: &mut ModelHealthRecord| {
            record.healthy = true;
            record.failure_count = 0;
            record.cooldown_until = None;
            record.last_error = None;
        };
        match model {
            Some(id) => {
                if let Some(mut record) = self.records.get_mut(id) {
                    reset(record.value_mut());
                }
            }
            None => {
                for mut record in self.records.iter_mut() {
                    reset(record.value_mut());
                }
            }
        }
        tracing::info!("[MODELS] health reset ({})", model.unwrap_or("all models"));
    }

    pub fn get(&self, model: &str) -> Option<ModelHealthRecord> {
        self.records.get(model).map(|r| r.value().clone())
    }

    /// All records sorted by model id.
    pub fn stats(&self) -> Vec<ModelHealthRecord> {
        let mut all: Vec<ModelHealthRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        all
    }

    pub fn snapshot(&self) -> Vec<ModelHealthRecord> {
        self.stats()
    }

    pub fn restore(&self, records: Vec<ModelHealthRecord>) {
        for record in records {
            self.records.insert(record.model_id.clone(), record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<ModelId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_three_failures_mark_unhealthy_and_select_next() {
        let mgr = ModelFallbackManager::new(3, 60_000);
        let priority = ids(&["m1", "m2"]);

        mgr.record_failure_at("m1", "timeout", 1_000);
        mgr.record_failure_at("m1", "timeout", 2_000);
        assert!(mgr.get("m1").unwrap().healthy);
        assert_eq!(mgr.select_model_at(&priority, None, 2_500).as_deref(), Some("m1"));

        mgr.record_failure_at("m1", "timeout", 3_000);
        let rec = mgr.get("m1").unwrap();
        assert!(!rec.healthy);
        assert_eq!(rec.failure_count, 3);
        assert_eq!(rec.cooldown_until, Some(63_000));
        assert_eq!(mgr.select_model_at(&priority, None, 3_001).as_deref(), Some("m2"));
    }

    #[test]
    fn test_cooldown_expiry_makes_model_eligible() {
        let mgr = ModelFallbackManager::new(1, 1_000);
        let priority = ids(&["m1", "m2"]);
        mgr.record_failure_at("m1", "boom", 10_000);

        assert_eq!(mgr.select_model_at(&priority, None, 10_500).as_deref(), Some("m2"));
        assert_eq!(mgr.select_model_at(&priority, None, 11_000).as_deref(), Some("m1"));
    }

    #[test]
    fn test_all_cooling_down_picks_least_recently_failed() {
        let mgr = ModelFallbackManager::new(1, 60_000);
        let priority = ids(&["m1", "m2", "m3"]);
        mgr.record_failure_at("m1", "e", 3_000);
        mgr.record_failure_at("m2", "e", 1_000);
        mgr.record_failure_at("m3", "e", 2_000);

        assert_eq!(mgr.select_model_at(&priority, None, 4_000).as_deref(), Some("m2"));
    }

    #[test]
    fn test_available_filter_and_empty_candidates() {
        let mgr = ModelFallbackManager::default();
        let priority = ids(&["m1", "m2"]);
        let available = ids(&["m2"]);
        assert_eq!(
            mgr.select_model(&priority, Some(available.as_slice())).as_deref(),
            Some("m2")
        );
        let none: Vec<ModelId> = Vec::new();
        assert!(mgr.select_model(&priority, Some(none.as_slice())).is_none());
        assert!(mgr.select_model(&[], None).is_none());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mgr = ModelFallbackManager::new(3, 60_000);
        mgr.record_failure("m1", "e1");
        mgr.record_failure("m1", "e2");
        mgr.record_success("m1", Some(serde_json::json!({"tokens": 12})), 250);

        let rec = mgr.get("m1").unwrap();
        assert_eq!(rec.failure_count, 0);
        assert_eq!(rec.total_failures, 2);
        assert_eq!(rec.success_count, 1);
        assert_eq!(rec.last_latency_ms, Some(250));
        assert_eq!(rec.last_meta.unwrap()["tokens"], 12);
    }

    #[test]
    fn test_reset_health_single_and_all() {
        let mgr = ModelFallbackManager::new(1, 60_000);
        mgr.record_failure("m1", "e");
        mgr.record_failure("m2", "e");

        mgr.reset_health(Some("m1"));
        assert!(mgr.get("m1").unwrap().healthy);
        assert!(!mgr.get("m2").unwrap().healthy);

        mgr.reset_health(None);
        assert!(mgr.stats().iter().all(|r| r.healthy && r.failure_count == 0));
        // history counters survive a reset
        assert_eq!(mgr.get("m2").unwrap().total_failures, 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mgr = ModelFallbackManager::new(1, 60_000);
        mgr.record_failure("m1", "e");
        mgr.record_success("m2", None, 10);

        let other = ModelFallbackManager::new(1, 60_000);
        other.restore(mgr.snapshot());
        assert_eq!(other.stats(), mgr.stats());
    }

    #[test]
    fn test_concurrent_updates_are_counted() {
        let mgr = std::sync::Arc::new(ModelFallbackManager::new(1_000, 60_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        mgr.record_failure("m1", "e");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mgr.get("m1").unwrap().total_failures, 800);
    }
}
