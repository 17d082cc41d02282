use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Used when no endpoint is configured so the candidate list is never empty.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000";

/// Name of the optional JSON config file inside the data directory.
pub const CONFIG_FILE: &str = "lifeline.json";

/// Startup configuration. Every field has a default and may be overridden by
/// `lifeline.json` or `LIFELINE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LifelineConfig {
    /// Candidate backend addresses in priority order.
    pub endpoints: Vec<String>,
    pub retry_policy: RetryPolicy,
    /// Consecutive failures before a model is marked unhealthy.
    pub health_threshold: u32,
    /// How long an unhealthy model is skipped before it becomes eligible again.
    pub cooldown_ms: u64,
    /// Max resource keys replayed in parallel.
    pub replay_concurrency: usize,
    pub data_dir: PathBuf,
    pub probe_timeout_ms: u64,
    /// Shorter timeout used when re-checking the cached last-good endpoint.
    pub last_good_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub default_models: Vec<String>,
}

impl Default for LifelineConfig {
    fn default() -> Self {
        LifelineConfig {
            endpoints: vec![
                DEFAULT_ENDPOINT.to_string(),
                "http://127.0.0.1:8000".to_string(),
                // WSL host
                "http://172.28.112.1:8000".to_string(),
            ],
            retry_policy: RetryPolicy::default(),
            health_threshold: 3,
            cooldown_ms: 60_000,
            replay_concurrency: 4,
            data_dir: PathBuf::from("./data"),
            probe_timeout_ms: 3_000,
            last_good_timeout_ms: 1_000,
            probe_interval_ms: 15_000,
            default_models: vec!["codellama:instruct".to_string()],
        }
    }
}

impl LifelineConfig {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load `{data_dir}/lifeline.json` if present, then apply environment
    /// overrides. A missing or malformed file falls back to defaults.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<LifelineConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded {}: endpoints={}, replay_concurrency={}",
                            CONFIG_FILE,
                            config.endpoints.len(),
                            config.replay_concurrency
                        );
                        config
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse {}: {}, using defaults", CONFIG_FILE, e);
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read {}: {}, using defaults", CONFIG_FILE, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_env();
        config.normalize();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("LIFELINE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(list) = std::env::var("LIFELINE_ENDPOINTS") {
            let endpoints: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                self.endpoints = endpoints;
            }
        }
        if let Some(v) = env_parse("LIFELINE_MAX_RETRIES") {
            self.retry_policy.max_retries = v;
        }
        if let Some(v) = env_parse("LIFELINE_BASE_DELAY_MS") {
            self.retry_policy.base_delay_ms = v;
        }
        if let Some(v) = env_parse("LIFELINE_MAX_DELAY_MS") {
            self.retry_policy.max_delay_ms = v;
        }
        if let Some(v) = env_parse("LIFELINE_HEALTH_THRESHOLD") {
            self.health_threshold = v;
        }
        if let Some(v) = env_parse("LIFELINE_COOLDOWN_MS") {
            self.cooldown_ms = v;
        }
        if let Some(v) = env_parse("LIFELINE_REPLAY_CONCURRENCY") {
            self.replay_concurrency = v;
        }
        if let Some(v) = env_parse("LIFELINE_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = v;
        }
        if let Some(v) = env_parse("LIFELINE_PROBE_INTERVAL_MS") {
            self.probe_interval_ms = v;
        }
        if let Ok(list) = std::env::var("LIFELINE_MODELS") {
            let models: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !models.is_empty() {
                self.default_models = models;
            }
        }
    }

    /// Clamp values that would break invariants.
    pub fn normalize(&mut self) {
        self.endpoints.retain(|e| !e.trim().is_empty());
        if self.endpoints.is_empty() {
            tracing::warn!("No endpoints configured, falling back to {}", DEFAULT_ENDPOINT);
            self.endpoints.push(DEFAULT_ENDPOINT.to_string());
        }
        self.health_threshold = self.health_threshold.max(1);
        self.replay_concurrency = self.replay_concurrency.max(1);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
