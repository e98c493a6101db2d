mod args;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fleetcheck_remote::Ssh2Connector;
use fleetcheck_server::reference::{reference_watch_loop, ReferenceStore};
use fleetcheck_server::state::{AppState, ServerConfig};
use fleetcheck_store::{EtcdMetaStore, MemoryMetaStore, MetaStore};

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = fleetcheck_common::telemetry::init_tracing(
        "fleetcheck-server",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let store: Arc<dyn MetaStore> = match args.etcd_endpoint.as_deref() {
        Some(endpoint) => {
            let etcd = EtcdMetaStore::connect(&[endpoint.to_string()]).await?;
            tracing::info!(endpoint = %endpoint, "job snapshots persisted to etcd");
            Arc::new(etcd)
        }
        None => {
            tracing::warn!("no etcd endpoint configured, job history is kept in memory only");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let references = Arc::new(ReferenceStore::load(args.benchmark_file.clone()));
    if args.benchmark_file.is_some() {
        let watched = references.clone();
        let interval = Duration::from_secs(args.benchmark_reload_secs.max(1));
        tokio::spawn(async move {
            if let Err(e) = reference_watch_loop(watched, interval).await {
                tracing::error!(error=%e, "reference watch loop exited");
            }
        });
    }

    let connector = Arc::new(Ssh2Connector::new(Duration::from_secs(
        args.connect_timeout_secs,
    )));
    let config = ServerConfig {
        assets_dir: args.assets_dir.clone(),
        remote_workdir: args.remote_workdir.clone(),
        max_parallel_nodes: args.max_parallel_nodes,
        job_retention: (args.job_retention_hours > 0)
            .then(|| Duration::from_secs(args.job_retention_hours * 3600)),
    };
    let auth = fleetcheck_common::auth::parse_auth_from_env();
    let st = AppState::new(connector, store, references, auth, &config);

    match st.scheduler.restore().await {
        Ok(n) => tracing::info!(jobs = n, "restored job history"),
        Err(e) => tracing::warn!(error=%e, "could not restore job history"),
    }

    let app = fleetcheck_server::build_router(st);
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr = %args.listen_addr, "fleetcheck-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}
