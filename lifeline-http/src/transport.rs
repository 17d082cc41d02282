use super::types::{RefreshRequest, RefreshResponse, SaveRequest, SaveResponse};
use async_trait::async_trait;
use lifeline::facade::{BackendClient, ChatRequest, ChatResponse, RequestContext};
use lifeline::{EndpointProber, LifelineError, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// reqwest-backed client for the backend routes and the `/health` probe.
pub struct HttpTransport {
    http_client: reqwest::Client,
    last_success: Arc<AtomicU64>, // Unix timestamp in seconds
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        // per-request timeouts come from the caller; this only bounds connects
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http_client,
            last_success: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn last_success_timestamp(&self) -> u64 {
        self.last_success.load(Ordering::Relaxed)
    }

    fn mark_success(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_success.store(now, Ordering::Relaxed);
    }

    fn authorized(&self, builder: RequestBuilder, ctx: &RequestContext) -> RequestBuilder {
        let builder = builder.timeout(ctx.timeout);
        match &ctx.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send and turn every non-2xx response into a classified error.
    async fn send(&self, builder: RequestBuilder, url: &Url, timeout: Duration) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| send_error(e, url, timeout))?;

        let status = response.status();
        if status.is_success() {
            self.mark_success();
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.unwrap_or_default();
        let message = if body.is_empty() {
            format!("{} returned {}", url, status)
        } else {
            format!("{} returned {}: {}", url, status, truncate(&body, 200))
        };
        Err(LifelineError::from_status_with_retry_after(
            status,
            message,
            retry_after,
        ))
    }
}

fn send_error(e: reqwest::Error, url: &Url, timeout: Duration) -> LifelineError {
    if e.is_timeout() {
        LifelineError::Timeout {
            after_ms: timeout.as_millis() as u64,
            message: format!("request to {}", url),
        }
    } else {
        LifelineError::Network(format!("Failed to send request to {}: {}", url, e))
    }
}

fn decode_error(e: reqwest::Error, url: &Url) -> LifelineError {
    LifelineError::Server {
        status: 502,
        message: format!("Failed to parse response from {}: {}", url, e),
    }
}

/// Build `{endpoint}/{segments...}`, percent-encoding each segment.
fn endpoint_url(endpoint: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| LifelineError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
    url.path_segments_mut()
        .map_err(|_| LifelineError::Config(format!("endpoint {} cannot be a base URL", endpoint)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl EndpointProber for HttpTransport {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<()> {
        let url = endpoint_url(address, &["health"])?;
        let builder = self.http_client.get(url.clone()).timeout(timeout);
        self.send(builder, &url, timeout).await?;
        Ok(())
    }
}

#[async_trait]
impl BackendClient for HttpTransport {
    async fn load_file(&self, ctx: &RequestContext, path: &str) -> Result<String> {
        let url = endpoint_url(&ctx.endpoint, &["load", path])?;
        let builder = self.authorized(self.http_client.get(url.clone()), ctx);
        let response = self.send(builder, &url, ctx.timeout).await?;
        response.text().await.map_err(|e| decode_error(e, &url))
    }

    async fn save_file(&self, ctx: &RequestContext, path: &str, content: &str) -> Result<()> {
        let url = endpoint_url(&ctx.endpoint, &["save"])?;
        let req = SaveRequest {
            filename: path.to_string(),
            content: content.to_string(),
        };
        let builder = self.authorized(self.http_client.post(url.clone()).json(&req), ctx);
        let response = self.send(builder, &url, ctx.timeout).await?;

        let saved: SaveResponse = response.json().await.unwrap_or_default();
        if let Some(error) = saved.error {
            return Err(LifelineError::Server {
                status: 500,
                message: format!("save of {} failed: {}", path, error),
            });
        }
        if saved.success == Some(false) {
            tracing::warn!(
                "backend stored {} via its fallback path {:?}: {}",
                path,
                saved.path,
                saved.message.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn chat(&self, ctx: &RequestContext, request: &ChatRequest) -> Result<ChatResponse> {
        let url = endpoint_url(&ctx.endpoint, &["chat"])?;
        let builder = self.authorized(self.http_client.post(url.clone()).json(request), ctx);
        let response = self.send(builder, &url, ctx.timeout).await?;

        let mut body: serde_json::Value = response.json().await.map_err(|e| decode_error(e, &url))?;
        if let Some(error) = body.get("error").and_then(|e| e.as_str()) {
            return Err(LifelineError::Server {
                status: 500,
                message: format!("model {} failed: {}", request.model, error),
            });
        }
        let text = match body.get("response").and_then(|r| r.as_str()) {
            Some(text) => text.to_string(),
            None => {
                return Err(LifelineError::Server {
                    status: 502,
                    message: format!("chat response from {} has no `response` field", url),
                })
            }
        };

        let meta = body.as_object_mut().and_then(|obj| {
            obj.remove("response");
            if obj.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(obj.clone()))
            }
        });
        Ok(ChatResponse {
            response: text,
            meta,
        })
    }

    async fn refresh_credentials(&self, ctx: &RequestContext, token: Option<&str>) -> Result<String> {
        let url = endpoint_url(&ctx.endpoint, &["auth", "refresh"])?;
        let req = RefreshRequest {
            token: token.map(String::from),
        };
        let builder = self.http_client.post(url.clone()).timeout(ctx.timeout).json(&req);
        let response = self.send(builder, &url, ctx.timeout).await?;
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| LifelineError::Auth(format!("malformed refresh response: {}", e)))?;
        Ok(refreshed.access_token)
    }
}
