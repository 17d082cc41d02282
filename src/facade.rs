//! API facade composing connectivity, endpoints, retries, the cache, the
//! offline queue and model fallback behind the calls the UI layer makes.

use crate::cache::kv::AUTH_TOKEN;
use crate::cache::{Collection, PersistentCache, WriteReceipt};
use crate::config::LifelineConfig;
use crate::connectivity::{
    ConnectivityMonitor, ConnectivityProbe, ConnectivityState, ConnectivityStatus, ProbeOutcome,
    SubscriptionToken,
};
use crate::endpoint::{should_invalidate, EndpointCandidate, EndpointProber, EndpointRegistry};
use crate::error::{LifelineError, Result};
use crate::models::{ModelFallbackManager, ModelHealthRecord};
use crate::queue::{OfflineQueue, QueueEntry, ReplayReport, ReplayTarget};
use crate::retry::{AttemptContext, CredentialRefresher, RetryExecutor};
use crate::types::{content_version, DataSource, ModelId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Queue operation name for file saves.
pub const OP_SAVE: &str = "save";

const FILE_KEY_PREFIX: &str = "file:";

pub fn file_resource_key(path: &str) -> String {
    format!("{}{}", FILE_KEY_PREFIX, path)
}

/// Per-attempt request parameters handed to the backend client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

/// Wire body of `POST /chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub num_ctx: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    /// Any extra fields the backend returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatOptions {
    /// Preferred model, tried before the configured defaults.
    pub model: Option<ModelId>,
    pub temperature: f32,
    pub top_p: f32,
    pub num_ctx: u32,
    /// Restrict selection to these models when known.
    pub available_models: Option<Vec<ModelId>>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            top_p: 0.9,
            num_ctx: 2048,
            available_models: None,
        }
    }
}

impl ChatOptions {
    fn request(&self, prompt: &str, model: &str) -> ChatRequest {
        ChatRequest {
            prompt: prompt.to_string(),
            model: model.to_string(),
            temperature: self.temperature.clamp(0.1, 1.0),
            top_p: self.top_p.clamp(0.1, 1.0),
            num_ctx: self.num_ctx.min(4096),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub model: ModelId,
    pub latency_ms: u64,
    /// True when a model other than the first choice answered.
    pub fallback_used: bool,
}

/// The backend routes the facade consumes.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// `GET /load/{path}`; plain-text contents.
    async fn load_file(&self, ctx: &RequestContext, path: &str) -> Result<String>;

    /// `POST /save`.
    async fn save_file(&self, ctx: &RequestContext, path: &str, content: &str) -> Result<()>;

    /// `POST /chat`.
    async fn chat(&self, ctx: &RequestContext, request: &ChatRequest) -> Result<ChatResponse>;

    /// `POST /auth/refresh`; returns the new access token.
    async fn refresh_credentials(&self, ctx: &RequestContext, token: Option<&str>) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedFile {
    pub path: String,
    pub content: String,
    pub version: String,
    pub source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved { version: String },
    /// Stored in the offline queue for later replay.
    Queued { entry_id: String, durable: bool },
}

#[derive(Debug, Default)]
struct Metrics {
    successful_checks: AtomicU64,
    failed_checks: AtomicU64,
    fallbacks_used: AtomicU64,
    entries_replayed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub fallbacks_used: u64,
    pub entries_replayed: u64,
}

impl Metrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            successful_checks: self.successful_checks.load(Ordering::Relaxed),
            failed_checks: self.failed_checks.load(Ordering::Relaxed),
            fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
            entries_replayed: self.entries_replayed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub total: usize,
    pub pending: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub backend: String,
    pub durable: bool,
    pub buffered_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `healthy`, `degraded` or `unhealthy`.
    pub status: String,
    pub timestamp: String,
    pub connectivity: ConnectivityState,
    pub endpoint: Option<String>,
    pub candidates: Vec<EndpointCandidate>,
    pub queue: QueueHealth,
    pub models: Vec<ModelHealthRecord>,
    pub cache: CacheHealth,
    pub metrics: MetricsSnapshot,
}

/// Counts every connectivity probe, whoever triggered it.
struct CountingProbe {
    inner: Arc<EndpointRegistry>,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl ConnectivityProbe for CountingProbe {
    async fn probe(&self) -> Result<ProbeOutcome> {
        let outcome = self.inner.probe().await;
        let counter = match &outcome {
            Ok(ProbeOutcome::Reachable) => &self.metrics.successful_checks,
            _ => &self.metrics.failed_checks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }
}

/// Exchanges the stored token for a fresh one after a 401.
struct TokenRefresher {
    backend: Arc<dyn BackendClient>,
    cache: Arc<PersistentCache>,
    registry: Arc<EndpointRegistry>,
    timeout: Duration,
}

#[async_trait]
impl CredentialRefresher for TokenRefresher {
    async fn refresh(&self) -> Result<()> {
        let kv = self.cache.kv();
        let current = kv.get(AUTH_TOKEN);
        let endpoint = match self.registry.current_endpoint() {
            Some(addr) => addr,
            None => self.registry.select_endpoint().await.address,
        };
        let ctx = RequestContext {
            endpoint,
            auth_token: current.clone(),
            timeout: self.timeout,
        };
        let token = self
            .backend
            .refresh_credentials(&ctx, current.as_deref())
            .await?;
        if !kv.set(AUTH_TOKEN, token).durable {
            tracing::warn!("[RETRY] refreshed token kept in memory only");
        }
        Ok(())
    }
}

pub struct Lifeline {
    config: LifelineConfig,
    backend: Arc<dyn BackendClient>,
    cache: Arc<PersistentCache>,
    registry: Arc<EndpointRegistry>,
    monitor: Arc<ConnectivityMonitor>,
    executor: RetryExecutor,
    queue: Arc<OfflineQueue>,
    models: ModelFallbackManager,
    metrics: Arc<Metrics>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifeline {
    /// Wire every component from `config`. Storage problems degrade to
    /// memory-only operation rather than failing.
    pub async fn open(
        config: LifelineConfig,
        backend: Arc<dyn BackendClient>,
        prober: Arc<dyn EndpointProber>,
    ) -> Arc<Self> {
        let cache = PersistentCache::open(&config.data_dir).await;
        Self::with_cache(config, backend, prober, cache).await
    }

    pub async fn with_cache(
        config: LifelineConfig,
        backend: Arc<dyn BackendClient>,
        prober: Arc<dyn EndpointProber>,
        cache: Arc<PersistentCache>,
    ) -> Arc<Self> {
        let mut config = config;
        config.normalize();

        let probe_timeout = Duration::from_millis(config.probe_timeout_ms);
        let last_good_timeout = Duration::from_millis(config.last_good_timeout_ms);
        let registry = EndpointRegistry::new(
            &config.endpoints,
            prober,
            cache.kv().clone(),
            probe_timeout,
            last_good_timeout,
        );

        // a full cycle may probe the last-good endpoint plus every candidate
        let cycle_timeout =
            last_good_timeout + probe_timeout * (registry.candidates().len() as u32 + 1);
        let metrics = Arc::new(Metrics::default());
        let probe = Arc::new(CountingProbe {
            inner: registry.clone(),
            metrics: metrics.clone(),
        });
        let monitor = ConnectivityMonitor::with_kv(probe, cycle_timeout, cache.kv().clone());
        registry.attach_monitor(&monitor);

        let refresher = TokenRefresher {
            backend: backend.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            timeout: Duration::from_millis(config.retry_policy.attempt_timeout_ms),
        };
        let executor = RetryExecutor::with_refresher(Arc::new(refresher));

        let queue = OfflineQueue::open(cache.clone(), config.replay_concurrency).await;

        let models = ModelFallbackManager::new(config.health_threshold, config.cooldown_ms);
        let saved: Vec<ModelHealthRecord> = cache
            .query(Collection::ModelHealth, &|_| true)
            .await
            .into_iter()
            .filter_map(|r| serde_json::from_value(r.value).ok())
            .collect();
        if !saved.is_empty() {
            tracing::info!("[MODELS] restored health for {} models", saved.len());
            models.restore(saved);
        }

        tracing::info!(
            "Lifeline ready: {} endpoints, {} queued entries, cache={}",
            registry.candidates().len(),
            queue.entries().len(),
            cache.backend_name()
        );

        Arc::new(Self {
            config,
            backend,
            cache,
            registry,
            monitor,
            executor,
            queue,
            models,
            metrics,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &LifelineConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PersistentCache> {
        &self.cache
    }

    /// Start periodic probing and replay the queue on every transition to
    /// ONLINE.
    pub fn start(self: &Arc<Self>) {
        self.monitor
            .start_probe_loop(Duration::from_millis(self.config.probe_interval_ms));

        let mut rx = self.monitor.watch();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut was_online = rx.borrow_and_update().is_online;
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().is_online;
                if online && !was_online {
                    let lifeline = match weak.upgrade() {
                        Some(l) => l,
                        None => break,
                    };
                    lifeline.replay_queue().await;
                }
                was_online = online;
            }
        });
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub fn stop(&self) {
        self.monitor.stop_probe_loop();
        for handle in self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }

    fn is_offline(&self) -> bool {
        self.monitor.state().status == ConnectivityStatus::Offline
    }

    async fn resolve_endpoint(&self) -> String {
        match self.registry.current_endpoint() {
            Some(addr) => addr,
            None => self.registry.select_endpoint().await.address,
        }
    }

    fn request_context(&self, endpoint: String, timeout: Duration) -> RequestContext {
        RequestContext {
            endpoint,
            auth_token: self.cache.kv().get(AUTH_TOKEN),
            timeout,
        }
    }

    /// One backend attempt against the current endpoint. Transport failures
    /// drop the cached endpoint so the next attempt re-selects.
    async fn attempt<T, F, Fut>(&self, timeout: Duration, op: &F) -> Result<T>
    where
        F: Fn(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let endpoint = self.resolve_endpoint().await;
        let ctx = self.request_context(endpoint.clone(), timeout);
        let result = op(ctx).await;
        if let Err(e) = &result {
            if should_invalidate(e) {
                self.registry.invalidate(&endpoint);
            }
        }
        result
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry_policy;
        self.executor
            .execute(policy, |attempt| {
                let op = &op;
                async move { self.attempt(attempt.timeout, op).await }
            })
            .await
    }

    fn cached_file(&self, path: &str, record: Option<serde_json::Value>) -> Option<LoadedFile> {
        // queued edits are newer than anything the backend returned
        if let Some(serde_json::Value::String(content)) =
            self.queue.latest_payload(&file_resource_key(path))
        {
            return Some(LoadedFile {
                path: path.to_string(),
                version: content_version(content.as_bytes()),
                content,
                source: DataSource::Cache,
            });
        }
        let record = record?;
        let content = record.get("content")?.as_str()?.to_string();
        Some(LoadedFile {
            path: path.to_string(),
            version: content_version(content.as_bytes()),
            content,
            source: DataSource::Cache,
        })
    }

    async fn cache_file(&self, path: &str, content: &str) -> WriteReceipt {
        let value = serde_json::json!({
            "content": content,
            "version": content_version(content.as_bytes()),
        });
        self.cache.put(Collection::Files, path, value).await
    }

    /// Load a file from the backend, or from the local cache while offline
    /// or when the backend cannot be reached.
    pub async fn load_file(&self, path: &str) -> Result<LoadedFile> {
        let cached = || async move {
            let record = self.cache.get(Collection::Files, path).await.map(|r| r.value);
            self.cached_file(path, record)
        };

        if self.is_offline() {
            return cached().await.ok_or_else(|| {
                LifelineError::Network(format!("offline and {} is not cached", path))
            });
        }

        match self
            .call(|ctx| async move { self.backend.load_file(&ctx, path).await })
            .await
        {
            Ok(content) => {
                self.cache_file(path, &content).await;
                // a pending local edit still wins over the remote copy
                if self.queue.has_entries_for(&file_resource_key(path)) {
                    if let Some(local) = cached().await {
                        return Ok(local);
                    }
                }
                Ok(LoadedFile {
                    path: path.to_string(),
                    version: content_version(content.as_bytes()),
                    content,
                    source: DataSource::Remote,
                })
            }
            Err(e) if e.is_connectivity_failure() => {
                tracing::warn!("load of {} failed, trying cache: {}", path, e);
                cached().await.ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Save a file. While offline, or when the backend cannot be reached, the
    /// save is queued and replayed later.
    pub async fn save_file(&self, path: &str, content: &str) -> Result<SaveOutcome> {
        let key = file_resource_key(path);
        let base_version = self
            .cache
            .get(Collection::Files, path)
            .await
            .and_then(|r| r.value.get("version").and_then(|v| v.as_str()).map(String::from));

        if self.is_offline() || self.queue.has_entries_for(&key) {
            return Ok(self.enqueue_save(path, content, base_version).await);
        }

        match self
            .call(|ctx| async move { self.backend.save_file(&ctx, path, content).await })
            .await
        {
            Ok(()) => {
                self.cache_file(path, content).await;
                Ok(SaveOutcome::Saved {
                    version: content_version(content.as_bytes()),
                })
            }
            Err(e) if e.is_connectivity_failure() => {
                tracing::warn!("save of {} failed, queueing: {}", path, e);
                Ok(self.enqueue_save(path, content, base_version).await)
            }
            // rejected content never reaches the cache
            Err(e) => Err(e),
        }
    }

    async fn enqueue_save(&self, path: &str, content: &str, base_version: Option<String>) -> SaveOutcome {
        let (entry, receipt) = self
            .queue
            .enqueue(
                &file_resource_key(path),
                OP_SAVE,
                serde_json::Value::String(content.to_string()),
                base_version,
            )
            .await;
        self.cache_file(path, content).await;
        SaveOutcome::Queued {
            entry_id: entry.id,
            durable: receipt.durable,
        }
    }

    /// Send a chat prompt, falling back across models. Network and auth
    /// failures are returned as-is. Anything else, including a model that
    /// times out while loading, counts against that model and moves on to the
    /// next candidate until every model has been tried.
    pub async fn chat(&self, prompt: &str, options: ChatOptions) -> Result<ChatReply> {
        if self.is_offline() {
            return Err(LifelineError::Network("backend offline".to_string()));
        }

        let mut priority: Vec<ModelId> = Vec::new();
        for model in options.model.iter().chain(self.config.default_models.iter()) {
            if !priority.contains(model) {
                priority.push(model.clone());
            }
        }

        let mut tried: Vec<ModelId> = Vec::new();
        let mut last_error: Option<LifelineError> = None;
        loop {
            let remaining: Vec<ModelId> = priority
                .iter()
                .filter(|m| !tried.contains(m))
                .cloned()
                .collect();
            let model = match self
                .models
                .select_model(&remaining, options.available_models.as_deref())
            {
                Some(m) => m,
                None => break,
            };
            tried.push(model.clone());

            let request = options.request(prompt, &model);
            let started = Instant::now();
            let result = self
                .call(|ctx| {
                    let request = &request;
                    async move { self.backend.chat(&ctx, request).await }
                })
                .await;

            match result {
                Ok(reply) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.models.record_success(&model, reply.meta, latency_ms);
                    self.persist_model_health(&model).await;
                    let fallback_used = tried.len() > 1;
                    if fallback_used {
                        self.metrics.fallbacks_used.fetch_add(1, Ordering::Relaxed);
                        tracing::info!("[MODELS] answered by fallback model {}", model);
                    }
                    return Ok(ChatReply {
                        response: reply.response,
                        model,
                        latency_ms,
                        fallback_used,
                    });
                }
                Err(e @ (LifelineError::Network(_) | LifelineError::Auth(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("[MODELS] {} failed: {}", model, e);
                    self.models.record_failure(&model, &e.to_string());
                    self.persist_model_health(&model).await;
                    last_error = Some(e);
                }
            }
        }

        let detail = match last_error {
            Some(e) => format!("tried [{}], last error: {}", tried.join(", "), e),
            None => "no candidate models".to_string(),
        };
        Err(LifelineError::ModelsExhausted(detail))
    }

    async fn persist_model_health(&self, model: &str) {
        let record = match self.models.get(model) {
            Some(r) => r,
            None => return,
        };
        match serde_json::to_value(&record) {
            Ok(value) => {
                self.cache.put(Collection::ModelHealth, model, value).await;
            }
            Err(e) => tracing::warn!("[MODELS] failed to encode health for {}: {}", model, e),
        }
    }

    pub fn subscribe_connectivity<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&ConnectivityState) + Send + Sync + 'static,
    {
        self.monitor.subscribe(callback)
    }

    pub fn unsubscribe_connectivity(&self, token: SubscriptionToken) -> bool {
        self.monitor.unsubscribe(token)
    }

    pub fn get_connectivity_status(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub fn get_model_health_stats(&self) -> Vec<ModelHealthRecord> {
        self.models.stats()
    }

    pub fn force_online_mode(&self, enabled: bool) {
        self.monitor.set_force_online(enabled);
    }

    /// Probe now. A transition to ONLINE replays the offline queue.
    pub async fn check_connectivity(&self) -> ConnectivityState {
        let was_online = self.monitor.state().is_online;
        let state = self.monitor.check_now().await;
        if state.is_online && !was_online {
            self.replay_queue().await;
        }
        state
    }

    /// Flush buffered cache writes and replay queued mutations.
    pub async fn replay_queue(&self) -> ReplayReport {
        let flushed = self.cache.flush_buffered().await;
        if flushed > 0 {
            tracing::info!("[CACHE] {} buffered writes reached storage", flushed);
        }
        let target = FacadeReplayTarget { lifeline: self };
        let report = self
            .queue
            .replay(&target, &self.executor, &self.config.retry_policy)
            .await;
        self.metrics
            .entries_replayed
            .fetch_add(report.completed() as u64, Ordering::Relaxed);
        report
    }

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        self.queue.entries()
    }

    pub async fn retry_failed_entry(&self, id: &str) -> Result<QueueEntry> {
        self.queue.retry_failed(id).await
    }

    pub async fn discard_entry(&self, id: &str) -> Result<QueueEntry> {
        self.queue.discard(id).await
    }

    pub async fn reset_model_health(&self, model: Option<&str>) {
        self.models.reset_health(model);
        for record in self.models.snapshot() {
            self.persist_model_health(&record.model_id).await;
        }
    }

    pub fn health_report(&self) -> HealthReport {
        let connectivity = self.monitor.state();
        let failed = self.queue.failed().len();
        let queue = QueueHealth {
            total: self.queue.entries().len(),
            pending: self.queue.pending_count(),
            failed,
        };
        let cache = CacheHealth {
            backend: self.cache.backend_name().to_string(),
            durable: self.cache.is_durable(),
            buffered_writes: self.cache.buffered_count(),
        };
        let status = match connectivity.status {
            ConnectivityStatus::Online if failed == 0 && cache.durable => "healthy",
            ConnectivityStatus::Offline => "unhealthy",
            _ => "degraded",
        };

        HealthReport {
            status: status.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            connectivity,
            endpoint: self.registry.current_endpoint(),
            candidates: self.registry.candidates().to_vec(),
            queue,
            models: self.models.stats(),
            cache,
            metrics: self.metrics.snapshot(),
        }
    }
}

impl Drop for Lifeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Applies queued mutations through the backend client.
struct FacadeReplayTarget<'a> {
    lifeline: &'a Lifeline,
}

fn file_path(resource_key: &str) -> Result<&str> {
    resource_key.strip_prefix(FILE_KEY_PREFIX).ok_or_else(|| LifelineError::Client {
        status: 400,
        message: format!("unsupported resource key {}", resource_key),
    })
}

#[async_trait]
impl ReplayTarget for FacadeReplayTarget<'_> {
    async fn current_version(&self, resource_key: &str) -> Result<Option<String>> {
        let path = file_path(resource_key)?;
        let timeout = Duration::from_millis(self.lifeline.config.retry_policy.attempt_timeout_ms);
        let backend = &self.lifeline.backend;
        let result = self
            .lifeline
            .attempt(timeout, &|ctx: RequestContext| async move {
                backend.load_file(&ctx, path).await
            })
            .await;
        match result {
            Ok(content) => Ok(Some(content_version(content.as_bytes()))),
            Err(LifelineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply(&self, entry: &QueueEntry, ctx: AttemptContext) -> Result<()> {
        if entry.operation != OP_SAVE {
            return Err(LifelineError::Client {
                status: 400,
                message: format!("unsupported queued operation {}", entry.operation),
            });
        }
        let path = file_path(&entry.resource_key)?;
        let content = entry.payload.as_str().ok_or_else(|| LifelineError::Client {
            status: 400,
            message: "save payload must be a string".to_string(),
        })?;
        let backend = &self.lifeline.backend;
        self.lifeline
            .attempt(ctx.timeout, &|req: RequestContext| async move {
                backend.save_file(&req, path, content).await
            })
            .await?;
        self.lifeline.cache_file(path, content).await;
        Ok(())
    }
}
