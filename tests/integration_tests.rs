use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bucketlock::handlers::{AppState, SharedState};
use bucketlock::headers::{BUCKET, LIMIT, REMAINING, RESET_AFTER};
use bucketlock::lock::LockManager;
use bucketlock::metrics::MetricsCollector;
use bucketlock::{
    create_app, ApiRequest, CoordinatorClient, Error, LockRequest, RateLimiter, RequestMeta,
    RequestQueue, Result, ShardIdentity, Transport, TransportResponse,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn state() -> SharedState {
    Arc::new(AppState {
        limiter: RateLimiter::default(),
        locks: LockManager::new(30_000),
        store: None,
        metrics: MetricsCollector::new(),
    })
}

async fn post(app: axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn serve(state: SharedState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_app(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_malformed_messages_are_rejected_at_the_boundary() {
    let state = state();
    let app = create_app(state.clone());

    let (status, body) = post(app.clone(), "/locks/identify/acquire", json!({ "token": "x" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["code"], 3);

    let (status, _) = post(app.clone(), "/authorize", json!({ "method": "GET" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        app,
        "/responses",
        json!({ "request": { "method": "GET", "url": "/x" }, "response": {} }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(state.locks.stats().unwrap().held, 0);
    assert_eq!(state.limiter.stats().unwrap().routes, 0);
}

#[tokio::test]
async fn test_lock_acquire_timeout_and_release_over_http() {
    let app = create_app(state());

    let (status, token) = post(app.clone(), "/locks/identify/acquire", json!({ "time_out": 0 })).await;
    assert_eq!(status, StatusCode::OK);
    assert!(token["value"].as_str().is_some());

    let (status, body) = post(app.clone(), "/locks/identify/acquire", json!({ "time_out": 20 })).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["error"], "lock_timeout");

    let (status, _) = post(app.clone(), "/locks/identify/release", token.clone()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = post(app, "/locks/identify/release", token).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 14);
}

#[tokio::test]
async fn test_authorize_follows_relayed_headers() {
    let app = create_app(state());
    let meta = json!({ "method": "POST", "url": "/channels/5/messages" });

    let (_, first) = post(app.clone(), "/authorize", meta.clone()).await;
    assert_eq!(first["wait_for"], 0.0);

    let (status, _) = post(
        app.clone(),
        "/responses",
        json!({
            "request": meta,
            "response": { "status_code": 200, "data": "{\"id\":\"1\"}" },
            "headers": {
                BUCKET: "abc",
                LIMIT: "1",
                REMAINING: "0",
                RESET_AFTER: "10"
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, second) = post(app.clone(), "/authorize", meta).await;
    assert!(second["wait_for"].as_f64().unwrap() > 9_000.0);
    assert_eq!(second["global"], false);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let metrics: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(metrics["authorizations_granted"], 1);
    assert_eq!(metrics["authorizations_deferred"], 1);
    assert_eq!(metrics["responses_relayed"], 1);
}

#[tokio::test]
async fn test_cancel_frees_route_for_retry() {
    let state = state();
    let base_url = serve(state.clone()).await;
    let client = CoordinatorClient::new(&base_url);
    let meta = RequestMeta::new("GET", "/guilds/1");

    assert!(client.authorize(&meta).await.unwrap().is_granted());
    assert!(!client.authorize(&meta).await.unwrap().is_granted());

    client.cancel(&meta).await.unwrap();
    assert!(client.authorize(&meta).await.unwrap().is_granted());

    let (status, _) = post(create_app(state), "/cancel", json!({ "url": "/guilds/1" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_app(state());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["redis"]["status"], "disabled");
}

#[tokio::test]
async fn test_client_distinguishes_timeout_from_stale_token() {
    let base_url = serve(state()).await;
    let client = CoordinatorClient::new(&base_url).with_identity(&ShardIdentity::new(2, vec![0]));
    let other = CoordinatorClient::new(&base_url).with_identity(&ShardIdentity::new(2, vec![1]));

    let token = client
        .acquire_lock("identify", &LockRequest { timeout_ms: 0, token: None })
        .await
        .unwrap();

    let err = other
        .acquire_lock("identify", &LockRequest { timeout_ms: 50, token: None })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::LockTimeout {
            key: "identify".to_string(),
            timeout_ms: 50
        }
    );
    assert!(err.is_retryable());

    let waiting = {
        let other = other.clone();
        tokio::spawn(async move {
            other
                .acquire_lock("identify", &LockRequest { timeout_ms: 5_000, token: None })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.release_lock("identify", &token).await.unwrap();
    let handed_off = waiting.await.unwrap().unwrap();
    assert_ne!(handed_off, token);

    let err = client.release_lock("identify", &token).await.unwrap_err();
    assert!(matches!(err, Error::LockReleased(_)));
    assert!(!err.is_retryable());
}

/// Answers every request with a one-per-window bucket.
struct BucketedTransport {
    sends: AtomicUsize,
}

#[async_trait]
impl Transport for BucketedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<TransportResponse> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(TransportResponse::new(200, json!({ "url": request.url }))
            .with_header(BUCKET, "shared")
            .with_header(LIMIT, "1")
            .with_header(REMAINING, "0")
            .with_header(RESET_AFTER, "0.3"))
    }
}

#[tokio::test]
async fn test_queue_paces_through_remote_gate() {
    let state = state();
    let base_url = serve(state.clone()).await;

    let transport = Arc::new(BucketedTransport {
        sends: AtomicUsize::new(0),
    });
    let gate = Arc::new(CoordinatorClient::new(&base_url));
    let queue = Arc::new(RequestQueue::new(transport.clone(), gate));
    let _ticker = queue.spawn(Duration::from_millis(10));

    let started = std::time::Instant::now();
    let receivers = queue
        .push([
            ApiRequest::new("POST", "/channels/9/messages"),
            ApiRequest::new("POST", "/channels/9/messages"),
        ])
        .unwrap();

    for rx in receivers {
        let response = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 200);
    }

    // the second request had to wait out the 300ms window
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(transport.sends.load(Ordering::SeqCst), 2);

    let bucket = state
        .limiter
        .bucket(&RequestMeta::new("POST", "/channels/9/messages"))
        .unwrap()
        .unwrap();
    assert_eq!(bucket.limit, 1);
}
