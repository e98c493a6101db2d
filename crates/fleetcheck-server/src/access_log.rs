use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use fleetcheck_common::auth::AuthContext;

/// One structured log line per request: who, what, result, latency.
/// Request bodies carry credentials and are never logged.
pub async fn access_log(req: Request<Body>, next: Next) -> Result<Response, std::convert::Infallible> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let principal = req
        .extensions()
        .get::<AuthContext>()
        .map(|c| c.principal.clone())
        .unwrap_or_else(|| "-".to_string());

    let resp = next.run(req).await;

    let status = resp.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if status >= 500 {
        tracing::warn!(%method, %path, status, latency_ms, %principal, "request");
    } else {
        tracing::info!(%method, %path, status, latency_ms, %principal, "request");
    }
    Ok(resp)
}
