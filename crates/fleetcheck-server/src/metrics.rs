use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    /// Diagnostic jobs accepted.
    pub jobs_created_total: AtomicU64,
    pub jobs_completed_total: AtomicU64,
    pub jobs_failed_total: AtomicU64,
    pub jobs_cancelled_total: AtomicU64,
    /// Nodes that ended a job in `failed`.
    pub nodes_failed_total: AtomicU64,
    pub multi_node_runs_total: AtomicU64,
    pub burnin_jobs_total: AtomicU64,
    /// Job snapshots that could not be written to the store.
    pub persist_errors_total: AtomicU64,
}

impl Metrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let rows: [(&str, &str, &str, &AtomicU64); 13] = [
            ("requests_total", "counter", "HTTP requests served.", &self.requests_total),
            ("requests_inflight", "gauge", "HTTP requests in flight.", &self.requests_inflight),
            ("responses_2xx", "counter", "2xx responses.", &self.status_2xx),
            ("responses_4xx", "counter", "4xx responses.", &self.status_4xx),
            ("responses_5xx", "counter", "5xx responses.", &self.status_5xx),
            ("jobs_created_total", "counter", "Diagnostic jobs accepted.", &self.jobs_created_total),
            ("jobs_completed_total", "counter", "Jobs where every node passed.", &self.jobs_completed_total),
            ("jobs_failed_total", "counter", "Jobs with at least one failed node.", &self.jobs_failed_total),
            ("jobs_cancelled_total", "counter", "Jobs stopped on request.", &self.jobs_cancelled_total),
            ("nodes_failed_total", "counter", "Nodes that finished a job failed.", &self.nodes_failed_total),
            ("multi_node_runs_total", "counter", "Multi-node collective runs started.", &self.multi_node_runs_total),
            ("burnin_jobs_total", "counter", "Burn-in jobs started.", &self.burnin_jobs_total),
            ("persist_errors_total", "counter", "Job snapshot writes that failed.", &self.persist_errors_total),
        ];
        let mut out = String::new();
        for (name, kind, help, value) in rows {
            out.push_str(&format!(
                "# HELP fleetcheck_{name} {help}\n# TYPE fleetcheck_{name} {kind}\nfleetcheck_{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

/// GET /api/metrics, Prometheus text exposition format.
pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, st.metrics.render())
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposes_counters() {
        let m = Metrics::default();
        Metrics::incr(&m.jobs_created_total);
        Metrics::incr(&m.jobs_created_total);
        let text = m.render();
        assert!(text.contains("fleetcheck_jobs_created_total 2\n"));
        assert!(text.contains("# TYPE fleetcheck_requests_inflight gauge"));
    }
}
