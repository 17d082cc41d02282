use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// AI model identifier such as `"codellama:instruct"`.
pub type ModelId = String;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Content version used for idempotent replay: hex SHA-256 of the raw bytes.
pub fn content_version(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Version of a JSON payload. String payloads hash their text so that the
/// version matches what a plain-text `GET /load/{path}` returns.
pub fn payload_version(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => content_version(s.as_bytes()),
        other => content_version(other.to_string().as_bytes()),
    }
}

/// Where a value handed back to the UI layer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Remote,
    Cache,
}
