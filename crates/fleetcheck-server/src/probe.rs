use fleetcheck_common::{NodeSummary, ReferenceTable};
use fleetcheck_remote::{CancellationToken, ExecOptions, RemoteShell, SessionError};

use crate::bench::parse::gpu_lines;

/// Default-route source address, falling back to the first `hostname -I` entry.
pub const INTERNAL_IP_CMD: &str = "ip route get 1.1.1.1 2>/dev/null | grep -oP 'src \\K[0-9.]+' | head -n 1 \
     || hostname -I | awk '{print $1}'";

const DRIVER_CMD: &str =
    "nvidia-smi --query-gpu=driver_version --format=csv,noheader 2>/dev/null | head -n 1 || true";

#[derive(Debug, Clone, PartialEq)]
pub struct GpuInventory {
    pub gpus: Vec<String>,
    /// Reference-table key, or the cleaned raw name for unknown hardware.
    pub model: String,
}

impl GpuInventory {
    pub fn count(&self) -> usize {
        self.gpus.len()
    }
}

pub async fn gpu_inventory(
    shell: &dyn RemoteShell,
    refs: &ReferenceTable,
    cancel: &CancellationToken,
) -> Result<GpuInventory, SessionError> {
    let out = shell
        .exec("nvidia-smi -L 2>/dev/null || true", ExecOptions::default(), cancel)
        .await?;
    let gpus = gpu_lines(&out.stdout);
    let model = gpus
        .first()
        .map(|line| refs.normalize(line))
        .unwrap_or_else(|| "Unknown".to_string());
    Ok(GpuInventory { gpus, model })
}

pub async fn internal_ip(shell: &dyn RemoteShell, cancel: &CancellationToken) -> Option<String> {
    match shell.exec(INTERNAL_IP_CMD, ExecOptions::default(), cancel).await {
        Ok(out) => Some(out.stdout_trimmed().to_string()).filter(|ip| !ip.is_empty()),
        Err(e) => {
            tracing::debug!(host = shell.host(), error = %e, "internal ip lookup failed");
            None
        }
    }
}

/// Identity and GPU inventory of a freshly connected node.
pub async fn summarize(shell: &dyn RemoteShell, refs: &ReferenceTable) -> Result<NodeSummary, SessionError> {
    let cancel = CancellationToken::new();
    let hostname = shell.run("hostname").await?.stdout_trimmed().to_string();
    let inventory = gpu_inventory(shell, refs, &cancel).await?;
    let driver_version = shell.run(DRIVER_CMD).await?.stdout_trimmed().to_string();
    let internal_ip = internal_ip(shell, &cancel).await;

    Ok(NodeSummary {
        hostname,
        gpu_count: inventory.count(),
        gpu_model: inventory.model,
        gpus: inventory.gpus,
        driver_version,
        internal_ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_common::ConnectionDescriptor;
    use fleetcheck_remote::{Connector, ScriptedConnector};

    #[tokio::test]
    async fn test_summary_normalizes_model() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("10.0.0.5")
            .on("ip route get", "10.0.0.5\n")
            .on("hostname", "gpu-a100-05\n")
            .on(
                "nvidia-smi -L",
                "GPU 0: NVIDIA A100-SXM4-80GB (UUID: GPU-aaa)\nGPU 1: NVIDIA A100-SXM4-80GB (UUID: GPU-bbb)\n",
            )
            .on("driver_version", "535.104.05\n");
        let shell = fleet
            .connect(&ConnectionDescriptor::password("10.0.0.5", "root", "pw"))
            .await
            .unwrap();

        let summary = summarize(&*shell, &ReferenceTable::fallback()).await.unwrap();
        assert_eq!(summary.hostname, "gpu-a100-05");
        assert_eq!(summary.gpu_model, "A100");
        assert_eq!(summary.gpu_count, 2);
        assert_eq!(summary.driver_version, "535.104.05");
        assert_eq!(summary.internal_ip.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_no_gpus_is_unknown() {
        let fleet = ScriptedConnector::new();
        let shell = fleet
            .connect(&ConnectionDescriptor::password("cpu-1", "root", "pw"))
            .await
            .unwrap();
        let inv = gpu_inventory(&*shell, &ReferenceTable::fallback(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(inv.count(), 0);
        assert_eq!(inv.model, "Unknown");
    }
}
