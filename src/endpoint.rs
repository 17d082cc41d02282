//! Endpoint Registry & Prober.
//!
//! Candidates are tried by an ordered list of strategies evaluated in a
//! single loop: the cached last-good endpoint (short timeout) first, then
//! every candidate in priority order. The first reachable address is cached
//! and persisted.

use crate::cache::kv::{KvStore, LAST_GOOD_ENDPOINT};
use crate::config::DEFAULT_ENDPOINT;
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe, ProbeOutcome};
use crate::error::{ErrorClass, LifelineError, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCandidate {
    pub address: String,
    /// 0 is the highest priority.
    pub priority_rank: usize,
}

/// Checks whether one address answers its health route.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// The remembered last-good endpoint answered.
    Cached,
    /// A candidate answered during the priority scan.
    Probed,
    /// Nothing answered; top-priority candidate returned anyway.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSelection {
    pub address: String,
    pub source: SelectionSource,
    pub degraded: bool,
    /// Per-address failures collected during this selection.
    #[serde(skip)]
    pub failures: Vec<(String, LifelineError)>,
}

impl EndpointSelection {
    /// True when at least one candidate answered with an HTTP error, i.e.
    /// the network works but the backend does not.
    fn backend_answered(&self) -> bool {
        self.failures.iter().any(|(_, e)| {
            !matches!(e, LifelineError::Network(_) | LifelineError::Timeout { .. })
        })
    }

    fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|(addr, e)| format!("{}: {}", addr, e))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    LastGood,
    PriorityScan,
}

const STRATEGIES: [Strategy; 2] = [Strategy::LastGood, Strategy::PriorityScan];

pub struct EndpointRegistry {
    candidates: Vec<EndpointCandidate>,
    prober: Arc<dyn EndpointProber>,
    kv: Arc<KvStore>,
    current: RwLock<Option<String>>,
    probe_timeout: Duration,
    last_good_timeout: Duration,
    monitor: OnceCell<Weak<ConnectivityMonitor>>,
}

impl EndpointRegistry {
    /// An empty `addresses` list falls back to [`DEFAULT_ENDPOINT`].
    pub fn new(
        addresses: &[String],
        prober: Arc<dyn EndpointProber>,
        kv: Arc<KvStore>,
        probe_timeout: Duration,
        last_good_timeout: Duration,
    ) -> Arc<Self> {
        let mut candidates: Vec<EndpointCandidate> = Vec::new();
        for address in addresses {
            let address = address.trim().trim_end_matches('/');
            if address.is_empty() || candidates.iter().any(|c| c.address == address) {
                continue;
            }
            candidates.push(EndpointCandidate {
                address: address.to_string(),
                priority_rank: candidates.len(),
            });
        }
        if candidates.is_empty() {
            candidates.push(EndpointCandidate {
                address: DEFAULT_ENDPOINT.to_string(),
                priority_rank: 0,
            });
        }

        let current = match kv.get(LAST_GOOD_ENDPOINT) {
            Some(addr) if candidates.iter().any(|c| c.address == addr) => {
                tracing::info!("[ENDPOINT] restored last-good endpoint {}", addr);
                Some(addr)
            }
            Some(addr) => {
                tracing::info!(
                    "[ENDPOINT] dropping last-good endpoint {}: no longer a candidate",
                    addr
                );
                kv.remove(LAST_GOOD_ENDPOINT);
                None
            }
            None => None,
        };

        Arc::new(Self {
            candidates,
            prober,
            kv,
            current: RwLock::new(current),
            probe_timeout,
            last_good_timeout,
            monitor: OnceCell::new(),
        })
    }

    /// Monitor to notify when every candidate fails. Held weakly because the
    /// monitor usually probes through this registry.
    pub fn attach_monitor(&self, monitor: &Arc<ConnectivityMonitor>) {
        if self.monitor.set(Arc::downgrade(monitor)).is_err() {
            tracing::warn!("[ENDPOINT] monitor already attached, ignoring");
        }
    }

    pub fn candidates(&self) -> &[EndpointCandidate] {
        &self.candidates
    }

    pub fn current_endpoint(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Forget the cached endpoint if it is `address`.
    pub fn invalidate(&self, address: &str) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if current.as_deref() == Some(address) {
            tracing::info!("[ENDPOINT] invalidating cached endpoint {}", address);
            *current = None;
            drop(current);
            self.kv.remove(LAST_GOOD_ENDPOINT);
        }
    }

    /// Pick an endpoint to talk to. Signals DEGRADED to the attached monitor
    /// when nothing answers.
    pub async fn select_endpoint(&self) -> EndpointSelection {
        let selection = self.resolve().await;
        if selection.degraded {
            if let Some(monitor) = self.monitor.get().and_then(Weak::upgrade) {
                monitor.report_degraded(format!(
                    "no endpoint reachable ({})",
                    selection.failure_summary()
                ));
            }
        }
        selection
    }

    async fn resolve(&self) -> EndpointSelection {
        let mut failures: Vec<(String, LifelineError)> = Vec::new();
        let cached = self.current_endpoint();

        for strategy in STRATEGIES {
            let attempts: Vec<(String, Duration)> = match strategy {
                Strategy::LastGood => match &cached {
                    Some(addr) => vec![(addr.clone(), self.last_good_timeout)],
                    None => Vec::new(),
                },
                Strategy::PriorityScan => self
                    .candidates
                    .iter()
                    .filter(|c| cached.as_deref() != Some(c.address.as_str()))
                    .map(|c| (c.address.clone(), self.probe_timeout))
                    .collect(),
            };

            for (address, timeout) in attempts {
                match self.probe_one(&address, timeout).await {
                    Ok(()) => {
                        let source = match strategy {
                            Strategy::LastGood => SelectionSource::Cached,
                            Strategy::PriorityScan => SelectionSource::Probed,
                        };
                        self.remember(&address);
                        return EndpointSelection {
                            address,
                            source,
                            degraded: false,
                            failures,
                        };
                    }
                    Err(e) => {
                        tracing::debug!("[ENDPOINT] {} failed: {}", address, e);
                        failures.push((address, e));
                    }
                }
            }
        }

        let fallback = self.candidates[0].address.clone();
        tracing::warn!(
            "[ENDPOINT] all {} candidates failed, using {} best-effort",
            self.candidates.len(),
            fallback
        );
        EndpointSelection {
            address: fallback,
            source: SelectionSource::BestEffort,
            degraded: true,
            failures,
        }
    }

    async fn probe_one(&self, address: &str, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.prober.probe(address, timeout)).await {
            Ok(res) => res,
            Err(_) => Err(LifelineError::Timeout {
                after_ms: timeout.as_millis() as u64,
                message: format!("probe of {}", address),
            }),
        }
    }

    fn remember(&self, address: &str) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if current.as_deref() == Some(address) {
            return;
        }
        tracing::info!("[ENDPOINT] switching to {}", address);
        *current = Some(address.to_string());
        drop(current);
        if !self.kv.set(LAST_GOOD_ENDPOINT, address).durable {
            tracing::warn!("[ENDPOINT] last-good endpoint kept in memory only");
        }
    }
}

/// Probing the registry is how the monitor decides reachability. This path
/// does not call `report_degraded`; the monitor applies the outcome itself.
#[async_trait]
impl ConnectivityProbe for EndpointRegistry {
    async fn probe(&self) -> Result<ProbeOutcome> {
        let selection = self.resolve().await;
        if !selection.degraded {
            return Ok(ProbeOutcome::Reachable);
        }
        let summary = selection.failure_summary();
        if selection.backend_answered() {
            Ok(ProbeOutcome::Degraded(summary))
        } else {
            Ok(ProbeOutcome::Unreachable(summary))
        }
    }
}

/// Whether a failed call should make the registry drop its cached endpoint.
pub fn should_invalidate(err: &LifelineError) -> bool {
    matches!(err.classify(), ErrorClass::Retryable)
}
