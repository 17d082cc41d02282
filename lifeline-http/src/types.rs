use serde::{Deserialize, Serialize};

/// Body of `POST /save`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub filename: String,
    pub content: String,
}

/// Response from `POST /save`. The backend answers 200 even when it had to
/// fall back internally, so `success` and `error` are checked separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveResponse {
    pub success: Option<bool>,
    pub path: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
}
