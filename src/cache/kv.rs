//! Tier A: small scalar values (tokens, flags, last-good endpoint) kept in
//! memory and written through to `kv.json`.

use super::WriteReceipt;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const KV_FILE: &str = "kv.json";

pub const LAST_GOOD_ENDPOINT: &str = "lastGoodEndpoint";
pub const AUTH_TOKEN: &str = "authToken";
pub const FORCE_ONLINE_FLAG: &str = "forceOnlineFlag";

pub struct KvStore {
    values: DashMap<String, String>,
    file_path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl KvStore {
    pub fn load_or_create(data_dir: &Path) -> Self {
        let file_path = data_dir.join(KV_FILE);
        let values = DashMap::new();
        if file_path.exists() {
            match std::fs::read_to_string(&file_path) {
                Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                    Ok(map) => {
                        for (k, v) in map {
                            values.insert(k, v);
                        }
                    }
                    Err(e) => tracing::warn!("[CACHE] Failed to parse {}, starting empty: {}", KV_FILE, e),
                },
                Err(e) => tracing::warn!("[CACHE] Failed to read {}, starting empty: {}", KV_FILE, e),
            }
        }

        Self {
            values,
            file_path: Some(file_path),
            save_lock: Mutex::new(()),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            values: DashMap::new(),
            file_path: None,
            save_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> WriteReceipt {
        self.values.insert(key.to_string(), value.into());
        self.save()
    }

    pub fn remove(&self, key: &str) -> WriteReceipt {
        self.values.remove(key);
        self.save()
    }

    fn save(&self) -> WriteReceipt {
        let file_path = match &self.file_path {
            Some(p) => p,
            None => return WriteReceipt { durable: false },
        };
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let snapshot: BTreeMap<String, String> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let json = match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("[CACHE] Failed to encode {}: {}", KV_FILE, e);
                return WriteReceipt { durable: false };
            }
        };
        if let Some(parent) = file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp = file_path.with_extension("json.tmp");
        let written = std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, file_path));
        match written {
            Ok(()) => WriteReceipt { durable: true },
            Err(e) => {
                tracing::warn!("[CACHE] Failed to save {}: {}", KV_FILE, e);
                WriteReceipt { durable: false }
            }
        }
    }
}
