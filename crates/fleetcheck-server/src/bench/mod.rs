//! Single-node GPU benchmarks and their judgment against the reference table.

pub mod parse;

use std::time::Duration;

use fleetcheck_common::{Dimension, Metric, ReferenceTable, TestKind};
use fleetcheck_remote::command::quote;
use fleetcheck_remote::{CancellationToken, CommandOutput, ExecOptions, RemoteShell, SessionError};
use serde_json::json;
use thiserror::Error;

use crate::assets::{Asset, ToolStager};

const NVBANDWIDTH_TIMEOUT: Duration = Duration::from_secs(600);
const P2P_TIMEOUT: Duration = Duration::from_secs(900);
const NCCL_TIMEOUT: Duration = Duration::from_secs(600);
const IB_TIMEOUT: Duration = Duration::from_secs(900);

/// Upper bound for `dcgmi diag -r <level>`.
pub fn dcgm_timeout(level: u8) -> Duration {
    let secs = match level {
        1 => 1_800,
        2 => 3_600,
        3 => 7_200,
        _ => 14_400,
    };
    Duration::from_secs(secs)
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("tool missing: {0}")]
    ToolMissing(String),

    #[error("{tool} exited with code {code}: {detail}")]
    ToolExecution {
        tool: String,
        code: i32,
        detail: String,
    },

    #[error("could not parse {tool} output: {reason}")]
    Parse { tool: String, reason: String },

    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl BenchError {
    fn execution(tool: &str, out: &CommandOutput) -> Self {
        let detail = if out.stderr.trim().is_empty() {
            fleetcheck_common::metric::tail(out.stdout.trim(), 512).to_string()
        } else {
            fleetcheck_common::metric::tail(out.stderr.trim(), 512).to_string()
        };
        Self::ToolExecution {
            tool: tool.to_string(),
            code: out.exit_code,
            detail,
        }
    }

    fn parse(tool: &str, reason: &str) -> Self {
        Self::Parse {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// What a node reported about itself before the tests start.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub gpu_model: String,
    pub gpu_count: usize,
}

#[derive(Debug, Clone)]
pub struct BenchmarkRunner {
    stager: ToolStager,
}

impl BenchmarkRunner {
    pub fn new(stager: ToolStager) -> Self {
        Self { stager }
    }

    pub fn stager(&self) -> &ToolStager {
        &self.stager
    }

    /// Runs one test and folds every failure into the returned metric.
    pub async fn run(
        &self,
        shell: &dyn RemoteShell,
        test: TestKind,
        node: &NodeContext,
        refs: &ReferenceTable,
        dcgm_level: u8,
        cancel: &CancellationToken,
    ) -> Metric {
        let result = match test {
            TestKind::Nvbandwidth => self.nvbandwidth(shell, node, refs, cancel).await,
            TestKind::P2p => self.p2p(shell, node, refs, cancel).await,
            TestKind::Nccl => self.nccl(shell, node, refs, cancel).await,
            TestKind::Dcgm => self.dcgm(shell, dcgm_level, cancel).await,
            TestKind::Ib => self.ib(shell, cancel).await,
        };
        match result {
            Ok(metric) => metric,
            Err(BenchError::Session(SessionError::Cancelled)) => Metric::skipped("cancelled"),
            Err(e) => {
                tracing::warn!(host = shell.host(), test = %test, error = %e, "benchmark failed");
                Metric::error(e.to_string())
            }
        }
    }

    async fn nvbandwidth(
        &self,
        shell: &dyn RemoteShell,
        node: &NodeContext,
        refs: &ReferenceTable,
        cancel: &CancellationToken,
    ) -> Result<Metric, BenchError> {
        let bin = quote(
            &self
                .stager
                .ensure_executable(shell, Asset::Nvbandwidth, cancel)
                .await?,
        )?;
        let opts = ExecOptions::with_timeout(NVBANDWIDTH_TIMEOUT).elevated();

        let mut raw = String::new();
        let mut directions = [0.0f64; 2];
        for (slot, testcase) in ["host_to_device_memcpy_ce", "device_to_host_memcpy_ce"]
            .into_iter()
            .enumerate()
        {
            let out = shell.exec(&format!("{bin} -t {testcase}"), opts, cancel).await?;
            if !out.success() {
                return Err(BenchError::execution("nvbandwidth", &out));
            }
            directions[slot] = parse::parse_nvbandwidth(&out.stdout)
                .ok_or_else(|| BenchError::parse("nvbandwidth", &format!("no {testcase} bandwidth")))?;
            raw.push_str(&out.stdout);
        }

        let [h2d, d2h] = directions;
        let threshold = refs.threshold(&node.gpu_model, Dimension::Bw);
        Ok(Metric::numeric(h2d.min(d2h), "GB/s", threshold)
            .with_details(json!({ "h2d": h2d, "d2h": d2h }))
            .with_raw_output(&raw))
    }

    async fn p2p(
        &self,
        shell: &dyn RemoteShell,
        node: &NodeContext,
        refs: &ReferenceTable,
        cancel: &CancellationToken,
    ) -> Result<Metric, BenchError> {
        let bin = self
            .stager
            .ensure_executable(shell, Asset::P2pBandwidthLatency, cancel)
            .await?;
        let cmd = format!("cd {} && {}", quote(self.stager.workdir())?, quote(&bin)?);
        let out = shell
            .exec(&cmd, ExecOptions::with_timeout(P2P_TIMEOUT).elevated(), cancel)
            .await?;
        if !out.success() {
            return Err(BenchError::execution("p2pBandwidthLatencyTest", &out));
        }
        let value = parse::parse_p2p(&out.stdout)
            .ok_or_else(|| BenchError::parse("p2pBandwidthLatencyTest", "no bidirectional bandwidth matrix"))?;
        let threshold = refs.threshold(&node.gpu_model, Dimension::P2p);
        Ok(Metric::numeric(value, "GB/s", threshold).with_raw_output(&out.stdout))
    }

    async fn nccl(
        &self,
        shell: &dyn RemoteShell,
        node: &NodeContext,
        refs: &ReferenceTable,
        cancel: &CancellationToken,
    ) -> Result<Metric, BenchError> {
        if node.gpu_count == 0 {
            return Err(BenchError::Precondition(
                "no GPUs detected, cannot run nccl-tests".into(),
            ));
        }
        let dir = self
            .stager
            .ensure_unpacked(shell, Asset::NcclTests, cancel)
            .await?;
        let cmd = format!(
            "{}/build/all_reduce_perf -b 1024 -e 1G -f 2 -g {}",
            quote(&dir)?,
            node.gpu_count
        );
        let out = shell
            .exec(&cmd, ExecOptions::with_timeout(NCCL_TIMEOUT).elevated(), cancel)
            .await?;
        if !out.success() {
            return Err(BenchError::execution("all_reduce_perf", &out));
        }
        let value = parse::parse_avg_busbw(&out.stdout)
            .ok_or_else(|| BenchError::parse("all_reduce_perf", "no average bus bandwidth"))?;
        let threshold = refs.threshold(&node.gpu_model, Dimension::Nccl);
        Ok(Metric::numeric(value, "GB/s", threshold)
            .with_details(json!({ "gpus": node.gpu_count }))
            .with_raw_output(&out.stdout))
    }

    async fn dcgm(
        &self,
        shell: &dyn RemoteShell,
        level: u8,
        cancel: &CancellationToken,
    ) -> Result<Metric, BenchError> {
        let probe = shell
            .exec(
                "command -v dcgmi >/dev/null 2>&1 && echo OK || echo MISSING",
                ExecOptions::default(),
                cancel,
            )
            .await?;
        if probe.stdout_trimmed() != "OK" {
            return Err(BenchError::ToolMissing("dcgmi".into()));
        }
        let out = shell
            .exec(
                &format!("dcgmi diag -r {level}"),
                ExecOptions::with_timeout(dcgm_timeout(level)).elevated(),
                cancel,
            )
            .await?;
        let output = out.combined();
        let token = parse::dcgm_token(&output, out.exit_code);
        let mut metric = Metric::token(token)
            .with_level(level)
            .with_raw_output(&output);
        if !metric.passed {
            metric = metric.with_message(format!("dcgmi diag exited with code {}", out.exit_code));
        }
        Ok(metric)
    }

    async fn ib(&self, shell: &dyn RemoteShell, cancel: &CancellationToken) -> Result<Metric, BenchError> {
        let script = self
            .stager
            .ensure_executable(shell, Asset::IbHealthCheck, cancel)
            .await?;
        let cmd = format!("TERM=xterm bash {}", quote(&script)?);
        let out = shell
            .exec(&cmd, ExecOptions::with_timeout(IB_TIMEOUT).elevated(), cancel)
            .await?;
        let output = out.combined();
        Ok(Metric::token(parse::ib_token(&output, out.exit_code)).with_raw_output(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_common::{ConnectionDescriptor, MetricStatus, MetricValue};
    use fleetcheck_remote::{Connector, ScriptedConnector};

    fn a100() -> NodeContext {
        NodeContext {
            gpu_model: "A100".into(),
            gpu_count: 8,
        }
    }

    async fn shell_for(fleet: &ScriptedConnector, host: &str) -> Box<dyn RemoteShell> {
        fleet
            .connect(&ConnectionDescriptor::password(host, "root", "pw"))
            .await
            .unwrap()
    }

    fn runner() -> BenchmarkRunner {
        BenchmarkRunner::new(ToolStager::new(None, "/tmp/fleetcheck"))
    }

    #[tokio::test]
    async fn test_nccl_below_reference_fails() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n1")
            .on("test -x", "OK")
            .on("all_reduce_perf", "# Avg bus bandwidth    : 12.5\n");
        let shell = shell_for(&fleet, "n1").await;

        let m = runner()
            .run(&*shell, TestKind::Nccl, &a100(), &ReferenceTable::fallback(), 2, &CancellationToken::new())
            .await;
        assert_eq!(m.status, MetricStatus::Failed);
        assert!(!m.passed);
        assert_eq!(m.value, Some(MetricValue::Number(12.5)));
        assert!(fleet.host("n1").ran("-g 8"));
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_failed() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n2")
            .on("test -x", "OK")
            .on("all_reduce_perf", "# Avg bus bandwidth    : 12.5\n");
        let shell = shell_for(&fleet, "n2").await;
        let node = NodeContext {
            gpu_model: "Tesla T4".into(),
            gpu_count: 1,
        };

        let m = runner()
            .run(&*shell, TestKind::Nccl, &node, &ReferenceTable::fallback(), 2, &CancellationToken::new())
            .await;
        assert_eq!(m.status, MetricStatus::Unknown);
        assert!(m.status.is_acceptable());
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_error_metric() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n3")
            .on("test -x", "OK")
            .on_output("p2pBandwidthLatencyTest", CommandOutput::new(1, "", "cudaErrorNoDevice"));
        let shell = shell_for(&fleet, "n3").await;

        let m = runner()
            .run(&*shell, TestKind::P2p, &a100(), &ReferenceTable::fallback(), 2, &CancellationToken::new())
            .await;
        assert_eq!(m.status, MetricStatus::Error);
        assert!(m.message.unwrap().contains("cudaErrorNoDevice"));
    }

    #[tokio::test]
    async fn test_dcgm_uses_level_and_token() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n4")
            .on("command -v", "OK")
            .on("dcgmi diag", "| Deployment | Pass |\n");
        let shell = shell_for(&fleet, "n4").await;

        let m = runner()
            .run(&*shell, TestKind::Dcgm, &a100(), &ReferenceTable::fallback(), 3, &CancellationToken::new())
            .await;
        assert_eq!(m.status, MetricStatus::Passed);
        assert_eq!(m.level, Some(3));
        let exec = fleet.host("n4").executed();
        let diag = exec.iter().find(|c| c.command.contains("dcgmi diag -r 3")).unwrap();
        assert!(diag.elevated);
    }

    #[tokio::test]
    async fn test_missing_tool_reports_error() {
        let fleet = ScriptedConnector::new();
        fleet.host("n5").on("test -x", "MISSING");
        let shell = shell_for(&fleet, "n5").await;

        let m = runner()
            .run(&*shell, TestKind::Ib, &a100(), &ReferenceTable::fallback(), 2, &CancellationToken::new())
            .await;
        assert_eq!(m.status, MetricStatus::Error);
        assert_eq!(m.message.as_deref(), Some("tool missing: ib_health_check.sh"));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_skipped() {
        let fleet = ScriptedConnector::new();
        let shell = shell_for(&fleet, "n6").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let m = runner()
            .run(&*shell, TestKind::Nvbandwidth, &a100(), &ReferenceTable::fallback(), 2, &cancel)
            .await;
        assert_eq!(m.status, MetricStatus::Skipped);
        assert_eq!(m.message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_dcgm_timeout_scales_with_level() {
        assert_eq!(dcgm_timeout(1), Duration::from_secs(1800));
        assert_eq!(dcgm_timeout(4), Duration::from_secs(14_400));
    }
}
