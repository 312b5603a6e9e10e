//! Test utilities and common setup.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, Response},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::MockServer;

use memory_proxy::config::{
    ServerConfig, Settings, StorageBackend, StorageConfig, UpstreamConfig,
};
use memory_proxy::store::SqliteStore;
use memory_proxy::{build_router, AppState};

pub const API_KEY: &str = "sk-test";

/// Router wired to a wiremock upstream and a temporary SQLite file.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<SqliteStore>,
    pub upstream: MockServer,
    _dir: TempDir,
}

fn settings(base_url: String, api_key: Option<&str>, sqlite_path: String) -> Settings {
    Settings {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            body_limit_bytes: 1024 * 1024,
        },
        upstream: UpstreamConfig {
            base_url,
            api_key: api_key.map(str::to_string),
            connect_timeout_seconds: 2,
        },
        storage: StorageConfig {
            backend: StorageBackend::Sqlite,
            sqlite_path,
            redis_url: String::new(),
            redis_key_prefix: String::new(),
        },
    }
}

pub async fn test_app() -> TestApp {
    test_app_with_key(Some(API_KEY)).await
}

pub async fn test_app_with_key(api_key: Option<&str>) -> TestApp {
    let upstream = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db").display().to_string();

    let settings = settings(upstream.uri(), api_key, path.clone());
    let store = Arc::new(SqliteStore::open(&path).await.unwrap());
    let state = AppState::new(&settings, store.clone()).unwrap();

    TestApp {
        router: build_router(state, &settings.server),
        store,
        upstream,
        _dir: dir,
    }
}

/// Router whose upstream refuses connections.
pub async fn unreachable_upstream_app() -> (Router, Arc<SqliteStore>) {
    // Bind then drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let settings = settings(base_url, None, String::new());
    let state = AppState::new(&settings, store.clone()).unwrap();
    (build_router(state, &settings.server), store)
}

pub async fn post_responses(router: &Router, body: Value) -> Response<Body> {
    post_responses_with(router, body, &[]).await
}

pub async fn post_responses_with(
    router: &Router,
    body: Value,
    headers: &[(&str, &str)],
) -> Response<Body> {
    let mut request = Request::builder()
        .uri("/v1/responses")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }

    router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

pub fn thread_id_of(response: &Response<Body>) -> String {
    response
        .headers()
        .get("x-thread-id")
        .expect("x-thread-id header")
        .to_str()
        .unwrap()
        .to_string()
}

/// Messages the upstream received on its `n`-th chat completion call.
pub async fn upstream_messages(upstream: &MockServer, n: usize) -> Vec<Value> {
    let requests = upstream.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[n].body).unwrap();
    body["messages"].as_array().cloned().unwrap_or_default()
}
