#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use kmirror_api::{HttpFetcher, QueryParams};
use kmirror_core::{Credentials, MirrorError, Settings, StaticCredentials};
use serde_json::json;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn app() -> Router {
    Router::new()
        .route(
            "/clusters/c1/api/v1/pods",
            get(|headers: HeaderMap| async move {
                let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
                (
                    [("X-Authorization", "fresh-token"), ("X-Reload", "reload")],
                    Json(json!({ "kind": "PodList", "items": [], "metadata": { "resourceVersion": "5" }, "seenAuth": auth })),
                )
            }),
        )
        .route(
            "/clusters/c1/api/v1/secrets",
            get(|| async { (StatusCode::FORBIDDEN, Json(json!({ "kind": "Status", "message": "secrets is forbidden" }))) }),
        )
        .route("/clusters/c1/api/v1/events", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "plain text") }))
        .route(
            "/clusters/c1/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        )
}

fn fetcher(base: String, timeout: Duration, creds: Arc<dyn Credentials>) -> HttpFetcher {
    let settings = Settings { base_url: base, request_timeout: timeout, ..Settings::default() };
    HttpFetcher::new(&settings, creds).unwrap()
}

#[tokio::test]
async fn bearer_token_and_response_signals() {
    let base = serve(app()).await;
    let creds = Arc::new(StaticCredentials::new(Some("old-token".into()), None));
    let http = fetcher(base, Duration::from_secs(10), creds.clone());
    let mut reload = http.subscribe_reload();

    let v = http.get_json("c1", "/api/v1/pods", &QueryParams::new().limit(10)).await.unwrap();
    assert_eq!(v["seenAuth"], "Bearer old-token");
    assert_eq!(v["metadata"]["resourceVersion"], "5");

    assert_eq!(creds.token("c1").as_deref(), Some("fresh-token"));
    assert!(reload.has_changed().unwrap());
    assert_eq!(*reload.borrow_and_update(), 1);

    // The refreshed token is used from now on.
    let v = http.get_json("c1", "/api/v1/pods", &QueryParams::new()).await.unwrap();
    assert_eq!(v["seenAuth"], "Bearer fresh-token");
}

#[tokio::test]
async fn error_status_carries_server_message() {
    let base = serve(app()).await;
    let http = fetcher(base, Duration::from_secs(10), Arc::new(StaticCredentials::default()));

    let err = http.get_json("c1", "/api/v1/secrets", &QueryParams::new()).await.unwrap_err();
    assert_eq!(err, MirrorError::Request { status: 403, message: "Forbidden - secrets is forbidden".into() });

    let err = http.get_json("c1", "/api/v1/events", &QueryParams::new()).await.unwrap_err();
    assert_eq!(err, MirrorError::Request { status: 500, message: "Internal Server Error".into() });
}

#[tokio::test]
async fn timeout_maps_to_408() {
    let base = serve(app()).await;
    let http = fetcher(base, Duration::from_millis(200), Arc::new(StaticCredentials::default()));
    let err = http.get_json("c1", "/slow", &QueryParams::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(408));
}

#[tokio::test]
async fn unreachable_backend_maps_to_502() {
    // Bind and drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let http = fetcher(format!("http://{addr}"), Duration::from_secs(5), Arc::new(StaticCredentials::default()));
    let err = http.get_json("c1", "/api/v1/pods", &QueryParams::new()).await.unwrap_err();
    assert_eq!(err.status(), Some(502));
}
