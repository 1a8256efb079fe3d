#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tower::ServiceExt;

use deployd_api::config::ServerConfig;
use deployd_api::router::build_app_router;
use deployd_api::state::AppState;
use deployd_core::command::{FlagSchema, FlagSpec};
use deployd_db::MemoryJobStore;

/// Build a test `ServerConfig` with safe defaults and an in-memory store.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        database_url: None,
        flag_schema_path: None,
        job_timeout_secs: None,
        store_retry_attempts: 3,
        store_retry_backoff_ms: 1,
        live_send_timeout_secs: 5,
        job_cache_capacity: 0,
    }
}

/// A schema that runs `script` with `sh -c`. Submitted flags become the
/// script's positional parameters.
pub fn sh_schema(script: &str) -> FlagSchema {
    FlagSchema {
        program: "sh".into(),
        base_args: vec!["-c".into(), script.into(), "nkp".into()],
        flags: vec![FlagSpec {
            name: "cluster-name".into(),
            required: true,
        }],
        umbrellas: vec![],
        trailing_flags: vec![],
    }
}

/// The management-cluster schema with `echo` standing in for `nkp`.
pub fn echo_management_schema() -> FlagSchema {
    FlagSchema {
        program: "echo".into(),
        ..FlagSchema::management_cluster()
    }
}

/// Build the application router and keep a handle on its state.
///
/// Uses the same `build_app_router` as `main.rs`, so tests exercise the
/// production middleware stack.
pub fn build_test_app(schema: FlagSchema) -> (Router, AppState) {
    let config = test_config();
    let state = AppState::new(Arc::new(MemoryJobStore::new()), schema, config.clone());
    (build_app_router(state.clone(), &config), state)
}

/// Every required management-cluster flag, with the specific image flags in
/// place of the `vm-image` umbrella.
pub fn management_params() -> Value {
    json!({
        "cluster-name": "c1",
        "control-plane-endpoint-ip": "10.0.0.10",
        "control-plane-prism-element-cluster": "pe-1",
        "control-plane-subnets": "subnet-a",
        "control-plane-vm-image": "img",
        "csi-storage-container": "default",
        "endpoint": "https://pc.example:9440",
        "kubernetes-service-load-balancer-ip-range": "10.0.0.20-10.0.0.30",
        "registry-password": "secret",
        "registry-url": "https://registry.example",
        "registry-username": "admin",
        "worker-prism-element-cluster": "pe-1",
        "worker-subnets": "subnet-b",
        "worker-vm-image": "img",
    })
}

pub fn without(params: Value, keys: &[&str]) -> Value {
    let mut map: Map<String, Value> = match params {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    };
    for key in keys {
        map.remove(*key);
    }
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response {
    app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post(app: Router, uri: &str) -> Response {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("JSON body")
}

/// The `data:` payloads of an SSE body, one entry per event.
pub async fn sse_frames(response: Response) -> Vec<String> {
    let body = tokio::time::timeout(Duration::from_secs(10), body_bytes(response))
        .await
        .expect("stream should end");
    let text = String::from_utf8(body).expect("UTF-8 body");

    text.split("\n\n")
        .filter_map(|event| {
            let data: Vec<&str> = event
                .lines()
                .filter_map(|l| l.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();
            (!data.is_empty()).then(|| data.join("\n"))
        })
        .collect()
}

/// Poll `GET /api/v1/jobs/{id}` until the job is terminal.
pub async fn wait_terminal(app: &Router, id: &str) -> Value {
    let poll = async {
        loop {
            let json = body_json(get(app.clone(), &format!("/api/v1/jobs/{id}")).await).await;
            let status = json["data"]["status"].as_str().unwrap_or_default().to_string();
            if status == "completed" || status == "failed" {
                return json["data"].clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), poll)
        .await
        .expect("job should finish")
}

pub fn assert_status(response: &Response, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status");
}
