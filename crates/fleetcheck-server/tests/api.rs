//! HTTP contract tests against the full router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use fleetcheck_common::auth::AuthConfig;
use fleetcheck_remote::{ScriptedConnector, SessionError};
use fleetcheck_server::reference::ReferenceStore;
use fleetcheck_server::state::{AppState, ServerConfig};
use fleetcheck_store::MemoryMetaStore;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

fn create_test_app(fleet: &ScriptedConnector, auth: AuthConfig) -> axum::Router {
    let state = AppState::new(
        Arc::new(fleet.clone()),
        Arc::new(MemoryMetaStore::new()),
        Arc::new(ReferenceStore::builtin()),
        auth,
        &ServerConfig::default(),
    );
    fleetcheck_server::build_router(state)
}

fn connection(host: &str) -> Value {
    json!({
        "host": host,
        "username": "root",
        "auth": {"type": "password", "value": "pw"}
    })
}

async fn send(app: axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

const GPUS: &str = "\
GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-0)
GPU 1: NVIDIA A100-SXM4-80GB (UUID: GPU-1)
";

/// Polls `uri` until its `data.status` is one of `wanted`.
async fn wait_status(app: &axum::Router, uri: &str, wanted: &[&str]) -> Value {
    for _ in 0..500 {
        let (status, body) = send(app.clone(), get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        if wanted.iter().any(|w| body["data"]["status"] == *w) {
            return body["data"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{uri} never reached {wanted:?}");
}

async fn wait_running(host: &fleetcheck_remote::ScriptedHost) {
    for _ in 0..500 {
        if host.running() > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never started its slow command", host.name());
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn healthz_is_public() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::from_tokens("tok:viewer"));
    let (status, body) = send(app, get("/api/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn benchmarks_expose_builtin_table() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::disabled());
    let (status, body) = send(app, get("/api/config/gpu-benchmarks")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["source"], "builtin");
    assert_eq!(body["data"]["benchmarks"]["A100"]["p2p"], 420.0);
}

#[tokio::test]
async fn create_job_without_nodes_is_rejected() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::disabled());
    let (status, body) = send(
        app,
        post("/api/gpu-inspection/create-job", json!({"nodes": [], "tests": ["nccl"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::disabled());
    let (status, body) = send(app, get("/api/gpu-inspection/job/job-missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn unreachable_host_reports_network_error() {
    let fleet = ScriptedConnector::new();
    fleet
        .host("10.9.9.9")
        .fail_connect(SessionError::network("10.9.9.9:22", "connection refused"));
    let app = create_test_app(&fleet, AuthConfig::disabled());

    let (status, body) = send(
        app,
        post("/api/ssh/test-connection", json!({"connection": connection("10.9.9.9")})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "network_error");
}

#[tokio::test]
async fn test_connection_returns_summary() {
    let fleet = ScriptedConnector::new();
    fleet
        .host("10.0.0.5")
        .on("ip route get", "10.0.0.5\n")
        .on("hostname", "gpu-a100-05\n")
        .on("nvidia-smi -L", "GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-aaa)\n")
        .on("driver_version", "535.104.05\n");
    let app = create_test_app(&fleet, AuthConfig::disabled());

    let (status, body) = send(
        app,
        post("/api/ssh/test-connection", json!({"connection": connection("10.0.0.5")})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["gpuModel"], "A100");
    assert_eq!(body["data"]["gpuCount"], 1);
    assert_eq!(fleet.host("10.0.0.5").sessions_released(), 1);
}

#[tokio::test]
async fn check_commands_reports_each_command_once() {
    let fleet = ScriptedConnector::new();
    fleet.host("10.0.0.6").on("command -v nvidia-smi", "/usr/bin/nvidia-smi\n");
    let app = create_test_app(&fleet, AuthConfig::disabled());

    let (status, body) = send(
        app,
        post(
            "/api/ssh/check-commands",
            json!({"connection": connection("10.0.0.6"), "commands": ["nvidia-smi", "nvidia-smi"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let commands = body["data"]["commands"].as_object().unwrap();
    assert_eq!(commands.len(), 1);
}

#[tokio::test]
async fn viewer_token_cannot_start_work() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::from_tokens("view-tok:viewer"));

    let (status, _) = send(app.clone(), get("/api/gpu-inspection/jobs")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut req = post(
        "/api/gpu-inspection/create-job",
        json!({"nodes": [connection("10.0.0.7")], "tests": ["dcgm"]}),
    );
    req.headers_mut()
        .insert("authorization", "Bearer view-tok".parse().unwrap());
    let (status, body) = send(app.clone(), req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let mut req = get("/api/gpu-inspection/jobs");
    req.headers_mut()
        .insert("authorization", "Bearer view-tok".parse().unwrap());
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn node_status_starts_empty() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::disabled());
    let (status, body) = send(app, get("/api/gpu-inspection/node-status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 0);
}

#[tokio::test]
async fn malformed_body_gets_validation_envelope() {
    let app = create_test_app(&ScriptedConnector::new(), AuthConfig::disabled());

    let (status, body) = send(
        app.clone(),
        post(
            "/api/ssh/test-connection",
            json!({"connection": {"host": "10.0.0.8", "username": "root"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "validation_error");

    let req = Request::builder()
        .method("POST")
        .uri("/api/gpu-inspection/create-job")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn check_commands_keys_follow_request() {
    let fleet = ScriptedConnector::new();
    fleet.host("10.0.0.9").on("command -v nvidia-smi", "OK");
    let app = create_test_app(&fleet, AuthConfig::disabled());

    let (status, body) = send(
        app,
        post(
            "/api/ssh/check-commands",
            json!({"connection": connection("10.0.0.9"), "commands": [" nvidia-smi", ""]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["commands"], json!({" nvidia-smi": true, "": false}));
}

#[tokio::test]
async fn job_lifecycle_stop_cancels_running_nodes() {
    let fleet = ScriptedConnector::new();
    let hosts = ["10.1.0.1", "10.1.0.2"];
    for h in hosts {
        fleet
            .host(h)
            .on("command -v", "OK")
            .on("nvidia-smi -L", GPUS)
            .on_slow("dcgmi diag", "| Memory | Pass |\n", Duration::from_secs(60));
    }
    let app = create_test_app(&fleet, AuthConfig::disabled());

    let (status, body) = send(
        app.clone(),
        post(
            "/api/gpu-inspection/create-job",
            json!({"nodes": [connection(hosts[0]), connection(hosts[1])], "tests": ["dcgm"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = body["data"]["jobId"].as_str().unwrap().to_string();
    let job_uri = format!("/api/gpu-inspection/job/{job_id}");

    for h in hosts {
        wait_running(&fleet.host(h)).await;
    }
    let job = wait_status(&app, &job_uri, &["running"]).await;
    assert_eq!(job["nodes"].as_array().unwrap().len(), 2);

    let (status, body) = send(
        app.clone(),
        post(&format!("/api/gpu-inspection/stop-job/{job_id}"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelling");

    let job = wait_status(&app, &job_uri, &["cancelled"]).await;
    for node in job["nodes"].as_array().unwrap() {
        assert_eq!(node["status"], "cancelled");
    }
    for h in hosts {
        assert_eq!(fleet.host(h).running(), 0);
    }

    let (status, body) = send(
        app,
        post(&format!("/api/gpu-inspection/stop-job/{job_id}"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn multi_node_run_can_be_cancelled() {
    let fleet = ScriptedConnector::new();
    fleet
        .host("10.2.0.1")
        .on("test -x", "OK")
        .on_slow("mpirun", "# Avg bus bandwidth : 150.0\n", Duration::from_secs(120));
    let app = create_test_app(&fleet, AuthConfig::disabled());

    let (status, body) = send(
        app.clone(),
        post(
            "/api/gpu-inspection/multi-node-nccl",
            json!({"hosts": ["10.2.0.1", "10.2.0.2"], "connection": connection("10.2.0.1")}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let test_id = body["data"]["testId"].as_str().unwrap().to_string();
    let run_uri = format!("/api/gpu-inspection/multi-node-nccl/{test_id}");

    wait_running(&fleet.host("10.2.0.1")).await;
    wait_status(&app, &run_uri, &["running"]).await;

    let (_, body) = send(app.clone(), get("/api/gpu-inspection/node-status")).await;
    assert_eq!(body["data"]["total"], 2);

    let (status, body) = send(app.clone(), post(&format!("{run_uri}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelling");

    let run = wait_status(&app, &run_uri, &["cancelled"]).await;
    assert_eq!(run["bandwidth"], Value::Null);
    assert_eq!(fleet.host("10.2.0.1").running(), 0);
}
