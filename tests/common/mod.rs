#![allow(dead_code)]

use async_trait::async_trait;
use lifeline::facade::{BackendClient, ChatRequest, ChatResponse, RequestContext};
use lifeline::{EndpointProber, Lifeline, LifelineConfig, LifelineError, Result, RetryPolicy};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PRIMARY: &str = "http://primary:8000";
pub const SECONDARY: &str = "http://secondary:8000";

/// Addresses marked up answer the health route; everything else is refused.
#[derive(Default)]
pub struct FakeProber {
    up: Mutex<HashSet<String>>,
    probes: AtomicUsize,
}

impl FakeProber {
    pub fn with_up(addresses: &[&str]) -> Arc<Self> {
        let prober = Self::default();
        for a in addresses {
            prober.set_up(a, true);
        }
        Arc::new(prober)
    }

    pub fn set_up(&self, address: &str, up: bool) {
        let mut set = self.up.lock().unwrap();
        if up {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointProber for FakeProber {
    async fn probe(&self, address: &str, _timeout: Duration) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.up.lock().unwrap().contains(address) {
            Ok(())
        } else {
            Err(LifelineError::Network(format!("connection refused: {}", address)))
        }
    }
}

/// In-memory backend with switchable failures.
#[derive(Default)]
pub struct FakeBackend {
    pub files: Mutex<HashMap<String, String>>,
    /// Every save that reached the backend, in arrival order.
    pub saves: Mutex<Vec<(String, String)>>,
    /// Models that answered or failed, in call order.
    pub chat_calls: Mutex<Vec<String>>,
    /// Endpoints each call was sent to.
    pub endpoints_used: Mutex<Vec<String>>,
    down: AtomicBool,
    failing_models: Mutex<HashSet<String>>,
    slow_models: Mutex<HashSet<String>>,
    required_token: Mutex<Option<String>>,
    refreshes: AtomicUsize,
    rejected_saves: Mutex<HashSet<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn fail_model(&self, model: &str) {
        self.failing_models.lock().unwrap().insert(model.to_string());
    }

    /// Chat calls for `model` time out, as when it is still loading.
    pub fn time_out_model(&self, model: &str) {
        self.slow_models.lock().unwrap().insert(model.to_string());
    }

    /// Calls must carry `token`; refresh hands out `fresh-token`.
    pub fn require_token(&self, token: &str) {
        *self.required_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn reject_saves_of(&self, path: &str) {
        self.rejected_saves.lock().unwrap().insert(path.to_string());
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
    }

    fn check(&self, ctx: &RequestContext) -> Result<()> {
        self.endpoints_used.lock().unwrap().push(ctx.endpoint.clone());
        if self.down.load(Ordering::SeqCst) {
            return Err(LifelineError::Network(format!(
                "connection refused: {}",
                ctx.endpoint
            )));
        }
        if let Some(required) = self.required_token.lock().unwrap().as_deref() {
            if ctx.auth_token.as_deref() != Some(required) {
                return Err(LifelineError::Auth("token expired".to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn load_file(&self, ctx: &RequestContext, path: &str) -> Result<String> {
        self.check(ctx)?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| LifelineError::NotFound(path.to_string()))
    }

    async fn save_file(&self, ctx: &RequestContext, path: &str, content: &str) -> Result<()> {
        self.check(ctx)?;
        if self.rejected_saves.lock().unwrap().contains(path) {
            return Err(LifelineError::Client {
                status: 422,
                message: format!("{} rejected", path),
            });
        }
        self.saves
            .lock()
            .unwrap()
            .push((path.to_string(), content.to_string()));
        self.put_file(path, content);
        Ok(())
    }

    async fn chat(&self, ctx: &RequestContext, request: &ChatRequest) -> Result<ChatResponse> {
        self.check(ctx)?;
        self.chat_calls.lock().unwrap().push(request.model.clone());
        if self.slow_models.lock().unwrap().contains(&request.model) {
            return Err(LifelineError::Timeout {
                after_ms: ctx.timeout.as_millis() as u64,
                message: format!("model {} still loading", request.model),
            });
        }
        if self.failing_models.lock().unwrap().contains(&request.model) {
            return Err(LifelineError::Server {
                status: 500,
                message: format!("model {} crashed", request.model),
            });
        }
        Ok(ChatResponse {
            response: format!("{} says hi", request.model),
            meta: Some(serde_json::json!({ "eval_count": 3 })),
        })
    }

    async fn refresh_credentials(&self, _ctx: &RequestContext, _token: Option<&str>) -> Result<String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let fresh = "fresh-token".to_string();
        *self.required_token.lock().unwrap() = Some(fresh.clone());
        Ok(fresh)
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_ms: 0,
        attempt_timeout_ms: 500,
        max_attempt_timeout_ms: 1_000,
    }
}

pub fn test_config(tmp: &TempDir) -> LifelineConfig {
    LifelineConfig {
        endpoints: vec![PRIMARY.to_string(), SECONDARY.to_string()],
        retry_policy: fast_policy(),
        health_threshold: 3,
        cooldown_ms: 60_000,
        replay_concurrency: 4,
        data_dir: tmp.path().to_path_buf(),
        probe_timeout_ms: 200,
        last_good_timeout_ms: 100,
        probe_interval_ms: 50,
        default_models: vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
    }
}

pub async fn open(
    tmp: &TempDir,
    backend: &Arc<FakeBackend>,
    prober: &Arc<FakeProber>,
) -> Arc<Lifeline> {
    Lifeline::open(test_config(tmp), backend.clone(), prober.clone()).await
}
