use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::any;
use futures_util::StreamExt as _;
use modelgate::auth;
use modelgate::proxy::{self, RelayError, RelayRequest};
use modelgate::router::KeyCycler;
use modelgate::storage::{self, EndpointKind};
use modelgate::transport::Transport;

/// Upstream requests seen by a mock channel: (path, authorization, body).
#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(String, String, serde_json::Value)>>>,
}

impl Captured {
    fn take(&self) -> Vec<(String, String, serde_json::Value)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn spawn_capture_upstream(body: &'static str, captured: Captured) -> String {
    let app = Router::new().route(
        "/{*path}",
        any(
            move |uri: axum::http::Uri, headers: HeaderMap, req_body: Bytes| {
                let captured = captured.clone();
                async move {
                    let auth = headers
                        .get(axum::http::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let parsed: serde_json::Value =
                        serde_json::from_slice(&req_body).unwrap_or(serde_json::Value::Null);
                    captured
                        .requests
                        .lock()
                        .unwrap()
                        .push((uri.path().to_string(), auth, parsed));
                    (
                        StatusCode::OK,
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        body,
                    )
                }
            },
        ),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://127.0.0.1:{}", addr.port())
}

const SSE_FRAMES: &str = "data: {\"delta\":\"a\"}\n\ndata: {\"delta\":\"b\"}\n\ndata: [DONE]\n\n";

async fn spawn_sse_upstream() -> String {
    let app = Router::new().route(
        "/{*path}",
        any(|| async {
            let chunks = [
                "data: {\"delta\":\"a\"}\n\n",
                "data: {\"delta\":\"b\"}\n\n",
                "data: [DONE]\n\n",
            ];
            let stream = futures_util::stream::iter(chunks)
                .map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes())));
            (
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
        }),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn temp_db_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("modelgate-test-{}.sqlite", uuid::Uuid::new_v4()));
    p
}

async fn create_channel(
    db_path: &std::path::Path,
    name: &str,
    base_url: String,
    api_key: &str,
    sort_order: i64,
    models: &[&str],
) -> storage::Channel {
    let channel = storage::create_channel(
        db_path.to_path_buf(),
        storage::CreateChannel {
            name: name.to_string(),
            base_url,
            api_key: api_key.to_string(),
            proxy_url: None,
            model_filter: None,
            sort_order,
            enabled: true,
        },
    )
    .await
    .expect("create channel");

    storage::insert_missing_models(
        db_path.to_path_buf(),
        channel.id.clone(),
        models.iter().map(|m| m.to_string()).collect(),
    )
    .await
    .expect("insert models");

    channel
}

fn builtin_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        format!("Bearer {}", auth::builtin_key()).parse().unwrap(),
    );
    headers
}

fn chat_request(headers: HeaderMap, body: &str) -> RelayRequest {
    RelayRequest {
        endpoint: EndpointKind::Chat,
        headers,
        body: Bytes::from(body.to_string()),
        path_model: None,
        path_stream: false,
    }
}

#[tokio::test]
async fn channel_prefix_pins_the_channel_and_rewrites_model() {
    let captured_a = Captured::default();
    let captured_b = Captured::default();
    let base_a = spawn_capture_upstream(r#"{"choices":[]}"#, captured_a.clone()).await;
    let base_b = spawn_capture_upstream(r#"{"choices":[]}"#, captured_b.clone()).await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    create_channel(&db_path, "A", base_a, "ka", 0, &["gpt-4o"]).await;
    create_channel(&db_path, "B", base_b, "kb", 1, &["gpt-4o"]).await;

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    let resp = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(
            builtin_headers(),
            r#"{"model":"B/gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
        ),
    )
    .await
    .expect("forward");
    assert_eq!(resp.status(), StatusCode::OK);

    assert!(captured_a.take().is_empty(), "channel A must not be hit");
    let seen = captured_b.take();
    assert_eq!(seen.len(), 1);
    let (path, auth_header, body) = &seen[0];
    assert_eq!(path, "/v1/chat/completions");
    assert_eq!(auth_header, "Bearer kb");
    assert_eq!(body["model"], "gpt-4o");
}

#[tokio::test]
async fn bare_model_name_picks_first_channel_by_sort_order() {
    let captured_a = Captured::default();
    let captured_b = Captured::default();
    let base_a = spawn_capture_upstream(r#"{"choices":[]}"#, captured_a.clone()).await;
    let base_b = spawn_capture_upstream(r#"{"choices":[]}"#, captured_b.clone()).await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    // B sorts first despite its name.
    create_channel(&db_path, "A", base_a, "ka", 5, &["gpt-4o"]).await;
    create_channel(&db_path, "B", base_b, "kb", 1, &["gpt-4o"]).await;

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    for _ in 0..2 {
        let resp = proxy::forward(
            db_path.clone(),
            &transport,
            &cycler,
            chat_request(builtin_headers(), r#"{"model":"gpt-4o","messages":[]}"#),
        )
        .await
        .expect("forward");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    // Deterministic: both requests went to the same channel.
    assert_eq!(captured_b.take().len(), 2);
    assert!(captured_a.take().is_empty());
}

#[tokio::test]
async fn permission_scoped_key_gets_404_not_403() {
    let captured = Captured::default();
    let base = spawn_capture_upstream(r#"{"choices":[]}"#, captured.clone()).await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let channel_a = create_channel(&db_path, "A", base.clone(), "ka", 0, &["gpt-4o"]).await;
    create_channel(&db_path, "B", base, "kb", 1, &["gpt-4o"]).await;

    let key = storage::create_proxy_key(
        db_path.clone(),
        storage::CreateProxyKey {
            name: "scoped".to_string(),
            enabled: true,
            allow_all_models: false,
            allowed_channel_ids: vec![channel_a.id.clone()],
            allowed_model_ids: vec![],
        },
    )
    .await
    .expect("create key");

    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", key.secret.parse().unwrap());

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    // Channel B is out of scope: not found, not forbidden.
    let err = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(headers.clone(), r#"{"model":"B/gpt-4o","messages":[]}"#),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::ModelNotFound));

    // The bare name resolves to the allowed channel.
    let resp = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(headers, r#"{"model":"gpt-4o","messages":[]}"#),
    )
    .await
    .expect("forward");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(captured.take().len(), 1);
}

#[tokio::test]
async fn permission_filter_omits_models_from_listing() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let channel_a = create_channel(&db_path, "A", "https://a.example".to_string(), "ka", 0, &["gpt-4o"]).await;
    let channel_b = create_channel(&db_path, "B", "https://b.example".to_string(), "kb", 1, &["gpt-4o"]).await;

    // Mark both models reachable; only reachable models are listed at all.
    for channel in [&channel_a, &channel_b] {
        let model = storage::list_models(db_path.clone(), Some(channel.id.clone()))
            .await
            .expect("models")
            .remove(0);
        storage::record_probe_success(db_path.clone(), model.id, EndpointKind::Chat, 42)
            .await
            .expect("record success");
    }

    let reachable = storage::list_reachable_models(db_path.clone())
        .await
        .expect("reachable");
    assert_eq!(reachable.len(), 2);

    let policy = auth::AccessPolicy {
        allow_all: false,
        channel_ids: std::collections::HashSet::from([channel_a.id.clone()]),
        model_ids: std::collections::HashSet::new(),
    };
    let visible: Vec<_> = reachable
        .iter()
        .filter(|m| policy.permits(&m.channel_id, &m.model_id))
        .collect();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].channel_name, "A");
}

#[tokio::test]
async fn unreachable_models_stay_out_of_the_listing() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    create_channel(&db_path, "A", "https://a.example".to_string(), "ka", 0, &["gpt-4o"]).await;

    // Never probed successfully: not listed.
    let reachable = storage::list_reachable_models(db_path.clone())
        .await
        .expect("reachable");
    assert!(reachable.is_empty());
}

#[tokio::test]
async fn missing_and_invalid_keys_are_rejected() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    let err = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(HeaderMap::new(), r#"{"model":"gpt-4o"}"#),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::AuthMissing));

    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", "definitely-not-a-key".parse().unwrap());
    let err = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(headers, r#"{"model":"gpt-4o"}"#),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RelayError::AuthInvalid));
}

#[tokio::test]
async fn multi_key_credentials_round_robin() {
    let captured = Captured::default();
    let base = spawn_capture_upstream(r#"{"choices":[]}"#, captured.clone()).await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    create_channel(&db_path, "A", base, "k1,k2", 0, &["gpt-4o"]).await;

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    for _ in 0..3 {
        proxy::forward(
            db_path.clone(),
            &transport,
            &cycler,
            chat_request(builtin_headers(), r#"{"model":"gpt-4o","messages":[]}"#),
        )
        .await
        .expect("forward");
    }

    let auths: Vec<String> = captured.take().into_iter().map(|(_, a, _)| a).collect();
    assert_eq!(auths, vec!["Bearer k1", "Bearer k2", "Bearer k1"]);
}

#[tokio::test]
async fn streaming_passthrough_is_byte_faithful() {
    let base = spawn_sse_upstream().await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    create_channel(&db_path, "A", base, "ka", 0, &["gpt-4o"]).await;

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    let resp = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(
            builtin_headers(),
            r#"{"model":"gpt-4o","stream":true,"messages":[]}"#,
        ),
    )
    .await
    .expect("forward");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        resp.headers()
            .get(axum::http::header::CACHE_CONTROL)
            .unwrap(),
        "no-cache"
    );

    let bytes = to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    assert_eq!(std::str::from_utf8(&bytes).unwrap(), SSE_FRAMES);
}

#[tokio::test]
async fn upstream_error_surfaces_with_status_and_message() {
    let app = Router::new().route(
        "/{*path}",
        any(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                r#"{"error":{"message":"rate limited"}}"#,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let base = format!("http://127.0.0.1:{}", addr.port());

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    create_channel(&db_path, "A", base, "ka", 0, &["gpt-4o"]).await;

    let transport = Transport::new(None);
    let cycler = KeyCycler::new();

    let err = proxy::forward(
        db_path.clone(),
        &transport,
        &cycler,
        chat_request(builtin_headers(), r#"{"model":"gpt-4o","messages":[]}"#),
    )
    .await
    .unwrap_err();

    match err {
        RelayError::Upstream { status, message } => {
            assert_eq!(status, Some(StatusCode::TOO_MANY_REQUESTS));
            assert_eq!(message, "rate limited");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
