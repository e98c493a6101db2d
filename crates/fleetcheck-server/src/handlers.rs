use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use fleetcheck_common::auth::{require_role, AuthContext, Role};
use fleetcheck_common::{
    ApiResponse, ConnectionDescriptor, CreateBurninRequest, CreateJobRequest, ErrorCode,
    MultiNodeRequest, NodeActivity, NodeState,
};
use fleetcheck_remote::CancellationToken;
use serde::Deserialize;
use serde_json::json;

use crate::error::OrchestratorError;
use crate::extract::ApiJson;
use crate::probe;
use crate::state::AppState;
use crate::trust::TrustOutcome;

type HandlerResult = Result<Response, OrchestratorError>;

fn ok<T: serde::Serialize>(data: T, message: &str) -> HandlerResult {
    Ok(Json(ApiResponse::ok(data, message)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TestConnectionRequest {
    pub connection: ConnectionDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct CheckCommandsRequest {
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrustRequest {
    #[serde(default)]
    pub nodes: Vec<ConnectionDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBurninRequest {
    pub job_id: String,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn test_connection(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<TestConnectionRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    req.connection
        .validate()
        .map_err(OrchestratorError::Validation)?;

    let shell = st.connector.connect(&req.connection).await?;
    let refs = st.references.snapshot();
    let summary = probe::summarize(&*shell, &refs).await;
    shell.close().await;
    let summary = summary?;
    tracing::info!(host = %req.connection.host, gpu_model = %summary.gpu_model, gpus = summary.gpu_count, "connection test passed");
    ok(summary, "connection succeeded")
}

pub async fn check_commands(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<CheckCommandsRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    req.connection
        .validate()
        .map_err(OrchestratorError::Validation)?;
    if req.commands.is_empty() {
        return Err(OrchestratorError::Validation("commands must not be empty".into()));
    }

    let shell = st.connector.connect(&req.connection).await?;
    let report = st
        .prereq
        .check(&*shell, &req.commands, &CancellationToken::new())
        .await;
    shell.close().await;
    ok(report, "prerequisite check finished")
}

pub async fn gpu_benchmarks(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    let table = st.references.snapshot();
    ok(
        json!({"benchmarks": &*table, "source": st.references.source()}),
        "gpu reference table",
    )
}

pub async fn create_job(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<CreateJobRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    let job_id = st.scheduler.create_job(req)?;
    ok(json!({"jobId": job_id}), "job created")
}

pub async fn get_job(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    ok(st.scheduler.get_job(&job_id)?, "")
}

pub async fn list_jobs(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    ok(st.scheduler.list_jobs(), "")
}

pub async fn stop_job(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    let job = st.scheduler.stop_job(&job_id)?;
    tracing::info!(job_id = %job_id, principal = %ctx.principal, "job stop accepted");
    ok(job, "stop requested")
}

pub async fn start_multi_node(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<MultiNodeRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    let test_id = st.multinode.start(req)?;
    ok(json!({"testId": test_id}), "multi-node test started")
}

pub async fn poll_multi_node(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(test_id): Path<String>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    ok(st.multinode.poll(&test_id)?, "")
}

pub async fn cancel_multi_node(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(test_id): Path<String>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    ok(st.multinode.cancel(&test_id)?, "cancel requested")
}

pub async fn setup_ssh_trust(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<TrustRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    match st.trust.setup(req.nodes).await? {
        TrustOutcome::Completed(report) => {
            let message = format!(
                "ssh trust established on {}/{} nodes",
                report.success_count, report.total_count
            );
            ok(report, &message)
        }
        TrustOutcome::InsufficientKeys(report) => {
            let body = ApiResponse {
                success: false,
                data: Some(report),
                message: "fewer than 2 nodes produced a public key".into(),
                code: Some(ErrorCode::ValidationError),
                timestamp: Utc::now(),
            };
            Ok((StatusCode::BAD_REQUEST, Json(body)).into_response())
        }
    }
}

/// Busy/idle view merged across diagnostic jobs, multi-node runs and
/// burn-ins. Busy wins over idle for the same host.
pub async fn node_status(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    let now = Utc::now();
    let mut nodes: BTreeMap<String, NodeActivity> = st
        .scheduler
        .node_activity()
        .into_iter()
        .map(|n| (n.host.clone(), n))
        .collect();

    let mut mark_busy = |host: String, alias: String, activity: String| {
        nodes.insert(
            host.clone(),
            NodeActivity {
                host,
                alias,
                status: NodeState::Busy,
                activity: Some(activity),
                last_seen: now,
            },
        );
    };
    for (host, test_id) in st.multinode.active_hosts() {
        mark_busy(host.clone(), host, format!("{test_id}: multi-node nccl"));
    }
    for (host, node_name, job_id) in st.burnin.active_hosts() {
        mark_busy(host, node_name, format!("{job_id}: burn-in"));
    }

    let nodes: Vec<NodeActivity> = nodes.into_values().collect();
    let total = nodes.len();
    ok(json!({"nodes": nodes, "total": total}), "")
}

pub async fn create_burnin(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<CreateBurninRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    let job_id = st.burnin.create(req)?;
    ok(json!({"jobId": job_id}), "burn-in created")
}

pub async fn stop_burnin(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(req): ApiJson<StopBurninRequest>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Operator) {
        return Ok(resp);
    }
    ok(st.burnin.stop(&req.job_id)?, "stop requested")
}

pub async fn list_burnin(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    ok(st.burnin.list(), "")
}

pub async fn get_burnin(
    State(st): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> HandlerResult {
    if let Some(resp) = require_role(&ctx, Role::Viewer) {
        return Ok(resp);
    }
    ok(st.burnin.get(&job_id)?, "")
}
