use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "FLEETCHECK_LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: String,

    /// JSON reference table (`{"A100": {"p2p": .., "nccl": .., "bw": ..}}`).
    #[arg(long, env = "FLEETCHECK_BENCHMARK_FILE")]
    pub benchmark_file: Option<PathBuf>,

    #[arg(long, env = "FLEETCHECK_BENCHMARK_RELOAD_SECS", default_value_t = 10)]
    pub benchmark_reload_secs: u64,

    /// Local directory holding the tool binaries and archives to stage.
    #[arg(long, env = "FLEETCHECK_ASSETS_DIR")]
    pub assets_dir: Option<PathBuf>,

    #[arg(long, env = "FLEETCHECK_REMOTE_WORKDIR", default_value = "/tmp/fleetcheck")]
    pub remote_workdir: String,

    #[arg(long, env = "FLEETCHECK_CONNECT_TIMEOUT_SECS", default_value_t = 15)]
    pub connect_timeout_secs: u64,

    #[arg(long, env = "FLEETCHECK_MAX_PARALLEL_NODES", default_value_t = 32)]
    pub max_parallel_nodes: usize,

    /// Job snapshots go to etcd when set, otherwise they live in memory only.
    #[arg(long, env = "ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    #[arg(long, env = "FLEETCHECK_JOB_RETENTION_HOURS", default_value_t = 168)]
    pub job_retention_hours: u64,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "FLEETCHECK_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "FLEETCHECK_OTLP_TOKEN")]
    pub otlp_token: Option<String>,

    /// `text` or `json`.
    #[arg(long, env = "FLEETCHECK_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}
