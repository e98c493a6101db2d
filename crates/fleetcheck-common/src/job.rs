use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDescriptor;
use crate::metric::Metric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Cancelling,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeRunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelling,
    Cancelled,
}

impl NodeRunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Cancelled)
    }
}

/// Diagnostic tests, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Nvbandwidth,
    P2p,
    Nccl,
    Dcgm,
    Ib,
}

impl TestKind {
    pub const ALL: [TestKind; 5] = [
        TestKind::Nvbandwidth,
        TestKind::P2p,
        TestKind::Nccl,
        TestKind::Dcgm,
        TestKind::Ib,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nvbandwidth => "nvbandwidth",
            Self::P2p => "p2p",
            Self::Nccl => "nccl",
            Self::Dcgm => "dcgm",
            Self::Ib => "ib",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown test '{s}'"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub status: NodeRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<usize>,
    #[serde(default)]
    pub results: BTreeMap<TestKind, Metric>,
    #[serde(default)]
    pub execution_log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeRecord {
    pub fn new(node_id: String, conn: &ConnectionDescriptor) -> Self {
        Self {
            node_id,
            alias: conn.display_name().to_string(),
            host: conn.host.clone(),
            port: conn.port,
            username: conn.username.clone(),
            status: NodeRunStatus::Pending,
            gpu_model: None,
            gpu_count: None,
            results: BTreeMap::new(),
            execution_log: Vec::new(),
            started_at: None,
            completed_at: None,
            message: None,
        }
    }

    /// Appends a `YYYY-MM-DD HH:MM:SS - message` line.
    pub fn log(&mut self, message: impl AsRef<str>) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.execution_log.push(format!("{ts} - {}", message.as_ref()));
    }

    pub fn finish(&mut self, status: NodeRunStatus, message: Option<String>) {
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    pub status: JobStatus,
    pub tests: Vec<TestKind>,
    pub dcgm_level: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stop_requested: bool,
    pub nodes: Vec<NodeRecord>,
}

impl Job {
    /// Recomputes the aggregate status from the node statuses.
    pub fn refresh_status(&mut self) {
        self.status = reduce_job_status(self.nodes.iter().map(|n| n.status), self.stop_requested);
        self.updated_at = Utc::now();
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeRecord> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }
}

/// Deterministic job status from node statuses.
///
/// While any node is still in flight the job is `cancelling` (stop requested),
/// `pending` (nothing started yet) or `running`. Once every node is terminal
/// the job is `cancelled` after a stop request, `completed` when every node
/// passed, and `failed` otherwise.
pub fn reduce_job_status<I>(statuses: I, stop_requested: bool) -> JobStatus
where
    I: IntoIterator<Item = NodeRunStatus>,
{
    let statuses: Vec<NodeRunStatus> = statuses.into_iter().collect();
    let in_flight = statuses.iter().any(|s| !s.is_terminal());

    if in_flight {
        if stop_requested {
            return JobStatus::Cancelling;
        }
        if statuses.iter().all(|s| *s == NodeRunStatus::Pending) {
            return JobStatus::Pending;
        }
        return JobStatus::Running;
    }

    if stop_requested {
        JobStatus::Cancelled
    } else if !statuses.is_empty() && statuses.iter().all(|s| *s == NodeRunStatus::Passed) {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}

/// Body of `POST /api/gpu-inspection/create-job`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<ConnectionDescriptor>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub dcgm_level: Option<u8>,
}
