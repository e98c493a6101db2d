use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a successful connection test learned about a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub hostname: String,
    pub gpus: Vec<String>,
    pub gpu_model: String,
    pub gpu_count: usize,
    pub driver_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    Idle,
    Busy,
}

/// Whether a host is currently occupied by a diagnostic workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeActivity {
    pub host: String,
    pub alias: String,
    pub status: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    pub last_seen: DateTime<Utc>,
}
