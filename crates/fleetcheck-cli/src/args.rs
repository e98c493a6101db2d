use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "fleetcheck")]
#[command(about = "Remote GPU fleet diagnostics", long_about = None)]
pub struct Args {
    /// Orchestrator URL
    #[arg(long, env = "FLEETCHECK_SERVER_URL", default_value = "http://127.0.0.1:5000")]
    pub server_url: String,

    /// API token (Authorization: Bearer)
    #[arg(long, env = "FLEETCHECK_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// SSH login for a single machine.
#[derive(Debug, Clone, ClapArgs)]
pub struct ConnectionArgs {
    #[arg(long)]
    pub host: String,

    #[arg(long, default_value_t = 22)]
    pub port: u16,

    #[arg(long, default_value = "root")]
    pub user: String,

    #[arg(long, env = "FLEETCHECK_SSH_PASSWORD", conflicts_with = "key_file")]
    pub password: Option<String>,

    /// PEM private key file
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    #[arg(long)]
    pub passphrase: Option<String>,

    /// Password fed to sudo for non-root logins
    #[arg(long)]
    pub sudo_password: Option<String>,

    #[arg(long)]
    pub alias: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Test an SSH login and show the node's GPU inventory
    Probe {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Check that commands are available on a node
    Check {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Commands to look for
        #[arg(long, value_delimiter = ',', default_value = "nvidia-smi,dcgmi,mpirun")]
        commands: Vec<String>,
    },
    /// Start a diagnostic job
    Run {
        /// JSON array of connection descriptors
        #[arg(long)]
        nodes_file: PathBuf,
        #[arg(long, value_delimiter = ',', default_value = "nvbandwidth,p2p,nccl,dcgm,ib")]
        tests: Vec<String>,
        #[arg(long)]
        dcgm_level: Option<u8>,
        #[arg(long)]
        name: Option<String>,
        /// Poll until the job finishes
        #[arg(long)]
        watch: bool,
        /// Poll interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Show one job
    Job { id: String },
    /// List jobs
    Jobs,
    /// Stop a running job
    Stop { id: String },
    /// Multi-node collective bandwidth test
    MultiNode {
        #[command(subcommand)]
        subcommand: MultiNodeCommand,
    },
    /// Set up passwordless root SSH between nodes
    Trust {
        /// JSON array of connection descriptors
        #[arg(long)]
        nodes_file: PathBuf,
    },
    /// GPU burn-in jobs
    Burnin {
        #[command(subcommand)]
        subcommand: BurninCommand,
    },
    /// Show the GPU reference table
    Benchmarks,
    /// Show which hosts are busy
    NodeStatus,
}

#[derive(Debug, Subcommand)]
pub enum MultiNodeCommand {
    /// Start a run from a launcher node
    Start {
        #[command(flatten)]
        launcher: ConnectionArgs,
        /// Participant hosts
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,
        /// Hostfile to use instead of --hosts
        #[arg(long, conflicts_with = "hosts")]
        hostfile: Option<PathBuf>,
        #[arg(long, default_value_t = 8)]
        gpu_per_node: u32,
        #[arg(long)]
        btl_tcp_if: Option<String>,
        #[arg(long)]
        nccl_socket_ifname: Option<String>,
        #[arg(long)]
        nccl_ib_hca: Option<String>,
        /// Bandwidth parser (avg_bus_bandwidth, peak_bus_bandwidth)
        #[arg(long)]
        parser: Option<String>,
        #[arg(long)]
        watch: bool,
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Show a run
    Poll { id: String },
    /// Cancel a run
    Cancel { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MemoryKind {
    Percentage,
    Fixed,
}

#[derive(Debug, Subcommand)]
pub enum BurninCommand {
    /// Start a burn-in on one node
    Create {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(long, value_enum, default_value_t = MemoryKind::Percentage)]
        memory_type: MemoryKind,
        /// Percent of GPU memory, or megabytes with --memory-type fixed
        #[arg(long, default_value_t = 90)]
        memory_value: u64,
        /// Seconds
        #[arg(long, default_value_t = 3600)]
        duration: u64,
        #[arg(long)]
        node_name: Option<String>,
    },
    /// Show one burn-in
    Status { id: String },
    /// List burn-ins
    List,
    /// Stop a burn-in
    Stop { id: String },
}
