//! HTTP orchestrator for remote GPU fleet diagnostics.

pub mod access_log;
pub mod assets;
pub mod bench;
pub mod burnin;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod multinode;
pub mod prereq;
pub mod probe;
pub mod reference;
pub mod scheduler;
pub mod state;
pub mod trust;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::access_log::access_log;
use crate::handlers::*;
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

/// Full `/api` surface. Health and metrics skip token auth.
pub fn build_router(st: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/ssh/test-connection", post(test_connection))
        .route("/ssh/check-commands", post(check_commands))
        .route("/config/gpu-benchmarks", get(gpu_benchmarks))
        .route("/gpu-inspection/create-job", post(create_job))
        .route("/gpu-inspection/job/:id", get(get_job))
        .route("/gpu-inspection/jobs", get(list_jobs))
        .route("/gpu-inspection/stop-job/:id", post(stop_job))
        .route("/gpu-inspection/multi-node-nccl", post(start_multi_node))
        .route("/gpu-inspection/multi-node-nccl/:id", get(poll_multi_node))
        .route(
            "/gpu-inspection/multi-node-nccl/:id/cancel",
            post(cancel_multi_node),
        )
        .route("/gpu-inspection/setup-ssh-trust", post(setup_ssh_trust))
        .route("/gpu-inspection/node-status", get(node_status))
        .route("/burnin/create", post(create_burnin))
        .route("/burnin/stop", post(stop_burnin))
        .route("/burnin/jobs", get(list_burnin))
        .route("/burnin/jobs/:id", get(get_burnin))
        .layer(middleware::from_fn(access_log))
        .layer(middleware::from_fn_with_state(
            st.clone(),
            fleetcheck_common::auth::auth_middleware::<AppState>,
        ));

    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(access_log));

    let api_routes = public_routes.merge(protected_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .layer(CorsLayer::permissive())
        .with_state(st)
}
