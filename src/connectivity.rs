//! Connectivity Monitor.
//!
//! Tracks whether the backend is usable and notifies subscribers on
//! transitions only. Recovery is cautious: leaving OFFLINE or DEGRADED takes
//! two consecutive successful probes, while a single failure leaves ONLINE.

use crate::cache::kv::{KvStore, FORCE_ONLINE_FLAG};
use crate::error::Result;
use crate::types::now_ms;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Successes needed to leave OFFLINE or DEGRADED.
pub const RECOVERY_SUCCESSES: u32 = 2;

pub const SOURCE_PROBE: &str = "probe";
pub const SOURCE_PROBE_FAILED: &str = "probe-failed";
pub const SOURCE_ENDPOINT_REGISTRY: &str = "endpoint-registry";
pub const SOURCE_FORCED: &str = "forced";
pub const SOURCE_INITIAL: &str = "initial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityStatus {
    Unknown,
    Online,
    Offline,
    Degraded,
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityStatus::Unknown => write!(f, "UNKNOWN"),
            ConnectivityStatus::Online => write!(f, "ONLINE"),
            ConnectivityStatus::Offline => write!(f, "OFFLINE"),
            ConnectivityStatus::Degraded => write!(f, "DEGRADED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_online: bool,
    pub status: ConnectivityStatus,
    /// What produced this state: `probe`, `probe-failed`, `endpoint-registry`, `forced`.
    pub source: String,
    pub last_check_ms: Option<u64>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub detail: Option<String>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            is_online: false,
            status: ConnectivityStatus::Unknown,
            source: SOURCE_INITIAL.to_string(),
            last_check_ms: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            detail: None,
        }
    }
}

impl ConnectivityState {
    fn forced(&self) -> Self {
        Self {
            is_online: true,
            status: ConnectivityStatus::Online,
            source: SOURCE_FORCED.to_string(),
            ..self.clone()
        }
    }
}

/// Result of one reachability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    /// The backend answered but is not healthy.
    Degraded(String),
    /// Nothing answered.
    Unreachable(String),
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeOutcome>;
}

/// Handle returned by [`ConnectivityMonitor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

pub type ConnectivityCallback = Arc<dyn Fn(&ConnectivityState) + Send + Sync>;

pub struct ConnectivityMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    probe_timeout: Duration,
    state: Mutex<ConnectivityState>,
    cycle: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    force_online: AtomicBool,
    kv: Option<Arc<KvStore>>,
    subscribers: DashMap<u64, ConnectivityCallback>,
    next_token: AtomicU64,
    watch_tx: watch::Sender<ConnectivityState>,
    probe_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn ConnectivityProbe>, probe_timeout: Duration) -> Arc<Self> {
        Self::build(probe, probe_timeout, None)
    }

    /// Monitor whose force-online override is persisted in `kv`.
    pub fn with_kv(
        probe: Arc<dyn ConnectivityProbe>,
        probe_timeout: Duration,
        kv: Arc<KvStore>,
    ) -> Arc<Self> {
        Self::build(probe, probe_timeout, Some(kv))
    }

    fn build(
        probe: Arc<dyn ConnectivityProbe>,
        probe_timeout: Duration,
        kv: Option<Arc<KvStore>>,
    ) -> Arc<Self> {
        let forced = kv
            .as_ref()
            .and_then(|kv| kv.get(FORCE_ONLINE_FLAG))
            .map(|v| v == "true")
            .unwrap_or(false);
        if forced {
            tracing::info!("[CONN] force-online override restored from storage");
        }

        let initial = ConnectivityState::default();
        let view = if forced { initial.forced() } else { initial.clone() };
        let (watch_tx, _) = watch::channel(view);

        Arc::new(Self {
            probe,
            probe_timeout,
            state: Mutex::new(initial),
            cycle: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            force_online: AtomicBool::new(forced),
            kv,
            subscribers: DashMap::new(),
            next_token: AtomicU64::new(1),
            watch_tx,
            probe_loop: Mutex::new(None),
        })
    }

    /// Current state as seen by consumers (force-online applied).
    pub fn state(&self) -> ConnectivityState {
        let raw = self.raw_state();
        self.view(&raw)
    }

    fn raw_state(&self) -> ConnectivityState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn view(&self, raw: &ConnectivityState) -> ConnectivityState {
        if self.force_online.load(Ordering::SeqCst) {
            raw.forced()
        } else {
            raw.clone()
        }
    }

    pub fn is_forced_online(&self) -> bool {
        self.force_online.load(Ordering::SeqCst)
    }

    /// Register a callback that fires on every status transition.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(&ConnectivityState) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(token, Arc::new(callback));
        SubscriptionToken(token)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.subscribers.remove(&token.0).is_some()
    }

    /// Receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.watch_tx.subscribe()
    }

    /// Probe now and return the resulting state. Never fails: probe errors
    /// and timeouts resolve to an offline state with source `probe-failed`.
    pub async fn check_now(&self) -> ConnectivityState {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _cycle = self.cycle.lock().await;

        if self.generation.load(Ordering::SeqCst) != generation {
            // a newer check is queued behind us and will be authoritative
            return self.state();
        }

        let (outcome, source) = match tokio::time::timeout(self.probe_timeout, self.probe.probe()).await {
            Ok(Ok(outcome)) => (outcome, SOURCE_PROBE),
            Ok(Err(e)) => (ProbeOutcome::Unreachable(e.to_string()), SOURCE_PROBE_FAILED),
            Err(_) => (
                ProbeOutcome::Unreachable(format!(
                    "probe timed out after {}ms",
                    self.probe_timeout.as_millis()
                )),
                SOURCE_PROBE_FAILED,
            ),
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("[CONN] discarding stale probe result (generation {})", generation);
            return self.state();
        }

        self.apply(outcome, source)
    }

    /// Signal that every endpoint candidate failed.
    pub fn report_degraded(&self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!("[CONN] degraded reported by endpoint registry: {}", detail);
        self.apply(ProbeOutcome::Degraded(detail), SOURCE_ENDPOINT_REGISTRY);
    }

    /// Manual override for environments where detection misfires. Persisted
    /// when the monitor has a key-value store.
    pub fn set_force_online(&self, enabled: bool) {
        let before = self.state();
        self.force_online.store(enabled, Ordering::SeqCst);
        if let Some(kv) = &self.kv {
            let receipt = if enabled {
                kv.set(FORCE_ONLINE_FLAG, "true")
            } else {
                kv.remove(FORCE_ONLINE_FLAG)
            };
            if !receipt.durable {
                tracing::warn!("[CONN] force-online flag could not be persisted");
            }
        }
        tracing::info!("[CONN] force-online {}", if enabled { "enabled" } else { "disabled" });
        let after = self.state();
        self.publish(&before, after);
    }

    fn apply(&self, outcome: ProbeOutcome, source: &str) -> ConnectivityState {
        let (before, after) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let before = self.view(&state);
            next_state(&mut state, outcome, source);
            (before, self.view(&state))
        };
        self.publish(&before, after.clone());
        after
    }

    fn publish(&self, before: &ConnectivityState, after: ConnectivityState) {
        self.watch_tx.send_replace(after.clone());
        if before.status == after.status && before.is_online == after.is_online {
            return;
        }
        tracing::info!(
            "[CONN] {} -> {} (source={})",
            before.status,
            after.status,
            after.source
        );
        let callbacks: Vec<ConnectivityCallback> =
            self.subscribers.iter().map(|e| e.value().clone()).collect();
        for callback in callbacks {
            callback(&after);
        }
    }

    /// Probe every `interval` in the background until [`stop_probe_loop`]
    /// is called or the monitor is dropped.
    ///
    /// [`stop_probe_loop`]: ConnectivityMonitor::stop_probe_loop
    pub fn start_probe_loop(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let monitor = match weak.upgrade() {
                    Some(m) => m,
                    None => break,
                };
                let state = monitor.check_now().await;
                tracing::debug!("[CONN] periodic probe: {}", state.status);
            }
        });

        let mut slot = self.probe_loop.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_probe_loop(&self) {
        let mut slot = self.probe_loop.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.probe_loop.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// State machine step.
fn next_state(state: &mut ConnectivityState, outcome: ProbeOutcome, source: &str) {
    state.last_check_ms = Some(now_ms());
    state.source = source.to_string();

    match outcome {
        ProbeOutcome::Reachable => {
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.consecutive_failures = 0;
            state.detail = None;
            let recovered = match state.status {
                ConnectivityStatus::Unknown | ConnectivityStatus::Online => true,
                ConnectivityStatus::Offline | ConnectivityStatus::Degraded => {
                    state.consecutive_successes >= RECOVERY_SUCCESSES
                }
            };
            if recovered {
                state.status = ConnectivityStatus::Online;
            }
        }
        ProbeOutcome::Degraded(detail) => {
            state.consecutive_successes = 0;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.status = ConnectivityStatus::Degraded;
            state.detail = Some(detail);
        }
        ProbeOutcome::Unreachable(detail) => {
            state.consecutive_successes = 0;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.status = ConnectivityStatus::Offline;
            state.detail = Some(detail);
        }
    }
    state.is_online = state.status == ConnectivityStatus::Online;
}
