use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::connection::ConnectionDescriptor;

fn default_gpu_per_node() -> u32 {
    8
}

/// Accepts strings, numbers and booleans for free-form launcher settings.
fn scalar<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(d)?;
    Ok(match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(if b { "1" } else { "0" }.to_string()),
        _ => None,
    })
}

/// Tunables for the distributed launcher and the collective library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpiParams {
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub btl_tcp_if: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub nccl_socket_ifname: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub nccl_ib_hca: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub ucx_net_devices: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub nccl_ib_qps: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub nccl_pxn_disable: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub nccl_min_nchannels: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub nccl_nvls_enable: Option<String>,
    #[serde(default)]
    pub sharp_relaxed_ordering: bool,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(rename = "gpuPerNode", default = "default_gpu_per_node")]
    pub gpu_per_node: u32,
}

/// Body of `POST /api/gpu-inspection/multi-node-nccl`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiNodeRequest {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub hostfile_content: Option<String>,
    #[serde(default)]
    pub mpi_params: Option<MpiParams>,
    pub connection: Option<ConnectionDescriptor>,
    /// Bandwidth parser name; the coordinator default applies when absent.
    #[serde(default)]
    pub parser: Option<String>,
}

impl MultiNodeRequest {
    /// Host list from the hostfile when given, else from `hosts`.
    pub fn host_list(&self) -> Vec<String> {
        match self.hostfile_content.as_deref() {
            Some(content) if !content.trim().is_empty() => content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            _ => self
                .hosts
                .iter()
                .map(|h| h.trim())
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn uses_hostfile(&self) -> bool {
        self.hostfile_content
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MultiNodeStatus {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl MultiNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiNodeRun {
    pub test_id: String,
    pub hosts: Vec<String>,
    pub node_count: usize,
    pub launcher: String,
    pub command: String,
    pub params: MpiParams,
    pub parser: String,
    pub status: MultiNodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_accept_numbers_and_strings() {
        let p: MpiParams = serde_json::from_value(serde_json::json!({
            "btl_tcp_if": "bond0",
            "nccl_ib_qps": 4,
            "nccl_pxn_disable": 0,
            "nccl_nvls_enable": "",
            "gpuPerNode": 4
        }))
        .unwrap();
        assert_eq!(p.btl_tcp_if.as_deref(), Some("bond0"));
        assert_eq!(p.nccl_ib_qps.as_deref(), Some("4"));
        assert_eq!(p.nccl_pxn_disable.as_deref(), Some("0"));
        assert_eq!(p.nccl_nvls_enable, None);
        assert_eq!(p.gpu_per_node, 4);

        let p: MpiParams = serde_json::from_str("{}").unwrap();
        assert_eq!(p.gpu_per_node, 8);
    }

    #[test]
    fn test_host_list_prefers_hostfile() {
        let req: MultiNodeRequest = serde_json::from_value(serde_json::json!({
            "hosts": ["10.0.0.1"],
            "hostfileContent": "10.0.0.1 slots=8\n\n# spare\n10.0.0.2 slots=8\n",
            "connection": null
        }))
        .unwrap();
        assert!(req.uses_hostfile());
        assert_eq!(req.host_list(), vec!["10.0.0.1 slots=8", "10.0.0.2 slots=8"]);
    }
}
