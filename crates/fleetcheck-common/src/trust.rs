use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustStatus {
    PubkeyCollected,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustResult {
    pub host: String,
    pub status: TrustStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustReport {
    pub results: Vec<TrustResult>,
    pub success_count: usize,
    pub total_count: usize,
}

impl TrustReport {
    pub fn new(results: Vec<TrustResult>) -> Self {
        let success_count = results
            .iter()
            .filter(|r| r.status == TrustStatus::Success)
            .count();
        let total_count = results.len();
        Self {
            results,
            success_count,
            total_count,
        }
    }
}
