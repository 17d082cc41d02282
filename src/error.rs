use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifelineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {after_ms} ms: {message}")]
    Timeout { after_ms: u64, message: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("Storage unavailable: {0}")]
    Storage(String),

    #[error("Replay of queue entry {entry_id} failed: {message}")]
    QueueReplay { entry_id: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("All models exhausted: {0}")]
    ModelsExhausted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, LifelineError>;

/// How the retry executor should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 5xx, timeouts, connection failures.
    Retryable,
    /// Surface immediately.
    NonRetryable,
    /// 401: refresh credentials once, then retry once.
    Auth,
    /// 429 with an optional server-provided wait.
    RateLimited(Option<Duration>),
}

impl From<std::io::Error> for LifelineError {
    fn from(e: std::io::Error) -> Self {
        LifelineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for LifelineError {
    fn from(e: serde_json::Error) -> Self {
        LifelineError::Json(e.to_string())
    }
}

impl LifelineError {
    /// Build a classified error from an HTTP status and response body.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::from_status_with_retry_after(status, message, None)
    }

    pub fn from_status_with_retry_after(
        status: StatusCode,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = message.into();
        match status {
            StatusCode::UNAUTHORIZED => LifelineError::Auth(message),
            StatusCode::TOO_MANY_REQUESTS => LifelineError::RateLimited {
                retry_after,
                message,
            },
            StatusCode::NOT_FOUND => LifelineError::NotFound(message),
            s if s.is_server_error() => LifelineError::Server {
                status: s.as_u16(),
                message,
            },
            s => LifelineError::Client {
                status: s.as_u16(),
                message,
            },
        }
    }

    pub fn classify(&self) -> ErrorClass {
        match self {
            LifelineError::Network(_)
            | LifelineError::Timeout { .. }
            | LifelineError::Server { .. } => ErrorClass::Retryable,
            LifelineError::Auth(_) => ErrorClass::Auth,
            LifelineError::RateLimited { retry_after, .. } => ErrorClass::RateLimited(*retry_after),
            LifelineError::Client { .. }
            | LifelineError::Storage(_)
            | LifelineError::QueueReplay { .. }
            | LifelineError::NotFound(_)
            | LifelineError::ModelsExhausted(_)
            | LifelineError::Config(_)
            | LifelineError::Io(_)
            | LifelineError::Json(_) => ErrorClass::NonRetryable,
        }
    }

    /// True for failures that mean "the backend could not be reached or
    /// could not serve us right now", as opposed to a rejected request.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(
            self.classify(),
            ErrorClass::Retryable | ErrorClass::RateLimited(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            LifelineError::Network(_) => StatusCode::BAD_GATEWAY,
            LifelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            LifelineError::Server { status, .. } | LifelineError::Client { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            LifelineError::Auth(_) => StatusCode::UNAUTHORIZED,
            LifelineError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            LifelineError::Storage(_) => StatusCode::INSUFFICIENT_STORAGE,
            LifelineError::QueueReplay { .. } => StatusCode::CONFLICT,
            LifelineError::NotFound(_) => StatusCode::NOT_FOUND,
            LifelineError::ModelsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            LifelineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LifelineError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LifelineError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }
}
