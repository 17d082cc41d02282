use lifeline::cache::kv::AUTH_TOKEN;
use lifeline::facade::{BackendClient, ChatRequest, RequestContext};
use lifeline::{
    ChatOptions, EndpointProber, LifelineConfig, LifelineError, RetryPolicy, SaveOutcome,
};
use lifeline_http::HttpTransport;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ctx(server: &MockServer, token: Option<&str>) -> RequestContext {
    RequestContext {
        endpoint: server.uri(),
        auth_token: token.map(String::from),
        timeout: Duration::from_secs(5),
    }
}

/// An address nothing listens on.
fn dead_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn test_config(tmp: &TempDir, endpoints: Vec<String>) -> LifelineConfig {
    LifelineConfig {
        endpoints,
        data_dir: tmp.path().to_path_buf(),
        retry_policy: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter_ms: 0,
            attempt_timeout_ms: 2_000,
            max_attempt_timeout_ms: 4_000,
        },
        probe_timeout_ms: 1_000,
        last_good_timeout_ms: 500,
        default_models: vec!["codellama:instruct".to_string()],
        ..LifelineConfig::default()
    }
}

#[tokio::test]
async fn test_probe_health_route() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})))
        .mount(&server)
        .await;

    let transport = HttpTransport::new();
    transport
        .probe(&server.uri(), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(transport.last_success_timestamp() > 0);
}

#[tokio::test]
async fn test_probe_reports_unhealthy_backend_as_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503).set_body_string("starting up"))
        .mount(&server)
        .await;

    let err = HttpTransport::new()
        .probe(&server.uri(), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, LifelineError::Server { status: 503, .. }));
}

#[tokio::test]
async fn test_load_file_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/load/main.py"))
        .and(header("Authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("print('hi')"))
        .expect(1)
        .mount(&server)
        .await;

    let content = HttpTransport::new()
        .load_file(&ctx(&server, Some("secret")), "main.py")
        .await
        .unwrap();
    assert_eq!(content, "print('hi')");
}

#[tokio::test]
async fn test_status_codes_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/load/missing.py"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/load/locked.py"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/load/busy.py"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new();
    let c = ctx(&server, None);

    assert!(matches!(
        transport.load_file(&c, "missing.py").await,
        Err(LifelineError::NotFound(_))
    ));
    assert!(matches!(
        transport.load_file(&c, "locked.py").await,
        Err(LifelineError::Auth(msg)) if msg.contains("token expired")
    ));
    assert!(matches!(
        transport.load_file(&c, "busy.py").await,
        Err(LifelineError::RateLimited { retry_after: Some(d), .. }) if d == Duration::from_secs(3)
    ));
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let transport = HttpTransport::new();
    let c = RequestContext {
        endpoint: dead_address(),
        auth_token: None,
        timeout: Duration::from_secs(1),
    };
    assert!(matches!(
        transport.load_file(&c, "a.py").await,
        Err(LifelineError::Network(_))
    ));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/load/slow.py"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let c = RequestContext {
        timeout: Duration::from_millis(100),
        ..ctx(&server, None)
    };
    let err = HttpTransport::new().load_file(&c, "slow.py").await.unwrap_err();
    assert!(matches!(err, LifelineError::Timeout { after_ms: 100, .. }));
}

#[tokio::test]
async fn test_save_posts_filename_and_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/save"))
        .and(body_json(serde_json::json!({"filename": "a.py", "content": "x = 1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true, "path": "/data/a.py", "filename": "a.py"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/save"))
        .and(body_json(serde_json::json!({"filename": "b.py", "content": "y"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false, "error": "disk full"
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new();
    let c = ctx(&server, None);
    transport.save_file(&c, "a.py", "x = 1").await.unwrap();
    let err = transport.save_file(&c, "b.py", "y").await.unwrap_err();
    assert!(matches!(err, LifelineError::Server { status: 500, message } if message.contains("disk full")));
}

#[tokio::test]
async fn test_chat_parses_response_and_meta() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "hello",
            "model": "codellama:instruct",
            "eval_count": 12
        })))
        .mount(&server)
        .await;

    let request = ChatRequest {
        prompt: "hi".into(),
        model: "codellama:instruct".into(),
        temperature: 0.7,
        top_p: 0.9,
        num_ctx: 2048,
    };
    let reply = HttpTransport::new()
        .chat(&ctx(&server, None), &request)
        .await
        .unwrap();
    assert_eq!(reply.response, "hello");
    assert_eq!(reply.meta.unwrap()["eval_count"], 12);
}

#[tokio::test]
async fn test_chat_error_body_is_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "error": "model not loaded"
        })))
        .mount(&server)
        .await;

    let request = ChatRequest {
        prompt: "hi".into(),
        model: "m1".into(),
        temperature: 0.7,
        top_p: 0.9,
        num_ctx: 2048,
    };
    let err = HttpTransport::new()
        .chat(&ctx(&server, None), &request)
        .await
        .unwrap_err();
    assert!(matches!(err, LifelineError::Server { .. }));
}

#[tokio::test]
async fn test_refresh_returns_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(serde_json::json!({"token": "old"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new"
        })))
        .mount(&server)
        .await;

    let token = HttpTransport::new()
        .refresh_credentials(&ctx(&server, Some("old")), Some("old"))
        .await
        .unwrap();
    assert_eq!(token, "new");
}

#[tokio::test]
async fn test_connect_fails_over_to_live_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/save"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let lifeline =
        lifeline_http::connect(test_config(&tmp, vec![dead_address(), server.uri()])).await;

    let state = lifeline.check_connectivity().await;
    assert!(state.is_online);
    assert_eq!(lifeline.registry().current_endpoint(), Some(server.uri()));

    let outcome = lifeline.save_file("notes.md", "hello").await.unwrap();
    assert!(matches!(outcome, SaveOutcome::Saved { .. }));
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(header("Authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(header("Authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": "refreshed"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tmp = TempDir::new().unwrap();
    let lifeline = lifeline_http::connect(test_config(&tmp, vec![server.uri()])).await;
    lifeline.cache().kv().set(AUTH_TOKEN, "old");

    let reply = lifeline.chat("hi", ChatOptions::default()).await.unwrap();
    assert_eq!(reply.response, "refreshed");
    assert_eq!(lifeline.cache().kv().get(AUTH_TOKEN).as_deref(), Some("new"));
}
