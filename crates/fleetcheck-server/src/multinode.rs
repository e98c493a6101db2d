//! Cross-node NCCL all-reduce runs launched with `mpirun` from one node.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleetcheck_common::{
    ConnectionDescriptor, MpiParams, MultiNodeRequest, MultiNodeRun, MultiNodeStatus,
};
use fleetcheck_remote::command::quote;
use fleetcheck_remote::{CancellationToken, Connector, ExecOptions, RemoteShell, SessionError};
use parking_lot::RwLock;

use crate::assets::{Asset, ToolStager};
use crate::bench::{parse, BenchError};
use crate::error::OrchestratorError;
use crate::metrics::Metrics;

pub const RUN_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_PARSER: &str = "avg_bus_bandwidth";
const OUTPUT_LIMIT: usize = 256 * 1024;

/// Extracts the headline bus bandwidth (GB/s) from an all_reduce_perf log.
pub trait BandwidthParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, stdout: &str) -> Option<f64>;
}

/// The `# Avg bus bandwidth` summary line.
pub struct AvgBusBandwidth;

impl BandwidthParser for AvgBusBandwidth {
    fn name(&self) -> &'static str {
        "avg_bus_bandwidth"
    }

    fn parse(&self, stdout: &str) -> Option<f64> {
        parse::parse_avg_busbw(stdout)
    }
}

/// Highest busbw across the result table rows.
pub struct PeakBusBandwidth;

impl BandwidthParser for PeakBusBandwidth {
    fn name(&self) -> &'static str {
        "peak_busbw"
    }

    fn parse(&self, stdout: &str) -> Option<f64> {
        parse::parse_peak_busbw(stdout)
    }
}

pub fn parse_parser(name: &str) -> Result<Arc<dyn BandwidthParser>, String> {
    match name.trim().to_lowercase().as_str() {
        "" | "avg_bus_bandwidth" | "avg" => Ok(Arc::new(AvgBusBandwidth)),
        "peak_busbw" | "peak" => Ok(Arc::new(PeakBusBandwidth)),
        other => Err(format!(
            "unknown bandwidth parser '{other}', expected avg_bus_bandwidth or peak_busbw"
        )),
    }
}

/// First token of a host or hostfile line (`10.0.0.1 slots=8` -> `10.0.0.1`).
fn host_name(entry: &str) -> &str {
    entry.split_whitespace().next().unwrap_or(entry)
}

fn push_env(parts: &mut Vec<String>, key: &str, value: Option<&str>) -> Result<(), SessionError> {
    if let Some(v) = value {
        parts.push(format!("-x {}", quote(&format!("{key}={v}"))?));
    }
    Ok(())
}

/// Single-line `mpirun` invocation of all_reduce_perf across `hosts`.
pub fn build_mpirun_command(
    hosts: &[String],
    hostfile: Option<&str>,
    params: &MpiParams,
    nccl_dir: &str,
) -> Result<String, SessionError> {
    let mut parts = vec![
        "mpirun".to_string(),
        format!("-np {}", hosts.len()),
        "--allow-run-as-root".to_string(),
        "-N 1".to_string(),
    ];
    match hostfile {
        Some(path) => parts.push(format!("-hostfile {}", quote(path)?)),
        None => {
            let list: Vec<&str> = hosts.iter().map(|h| host_name(h)).collect();
            parts.push(format!("-host {}", quote(&list.join(","))?));
        }
    }
    if let Some(iface) = params.btl_tcp_if.as_deref() {
        let iface = quote(iface)?;
        parts.push(format!("--mca btl_tcp_if_include {iface}"));
        parts.push(format!("--mca oob_tcp_if_include {iface}"));
    }
    push_env(&mut parts, "NCCL_SOCKET_IFNAME", params.nccl_socket_ifname.as_deref())?;
    push_env(&mut parts, "NCCL_IB_HCA", params.nccl_ib_hca.as_deref())?;
    push_env(&mut parts, "UCX_NET_DEVICES", params.ucx_net_devices.as_deref())?;
    push_env(&mut parts, "NCCL_IB_QPS_PER_CONNECTION", params.nccl_ib_qps.as_deref())?;
    push_env(&mut parts, "NCCL_PXN_DISABLE", params.nccl_pxn_disable.as_deref())?;
    push_env(&mut parts, "NCCL_MIN_NCHANNELS", params.nccl_min_nchannels.as_deref())?;
    push_env(&mut parts, "NCCL_NVLS_ENABLE", params.nccl_nvls_enable.as_deref())?;
    if params.sharp_relaxed_ordering {
        parts.push("-x SHARP_COLL_ENABLE_PCI_RELAXED_ORDERING=1".to_string());
    }
    if let Some(extra) = params.extra.as_deref() {
        parts.push(extra.to_string());
    }
    parts.push(format!(
        "{}/build/all_reduce_perf -b 128M -e 16G -f 2 -g {}",
        quote(nccl_dir)?,
        params.gpu_per_node
    ));
    Ok(parts.join(" "))
}

struct RunHandle {
    record: RwLock<MultiNodeRun>,
    cancel: CancellationToken,
}

impl RunHandle {
    fn update(&self, f: impl FnOnce(&mut MultiNodeRun)) {
        f(&mut self.record.write());
    }
}

struct LaunchPlan {
    conn: ConnectionDescriptor,
    /// Remote path and content of this run's hostfile.
    hostfile: Option<(String, String)>,
    params: MpiParams,
    parser: Arc<dyn BandwidthParser>,
}

pub struct MultiNodeCoordinator {
    connector: Arc<dyn Connector>,
    stager: ToolStager,
    metrics: Arc<Metrics>,
    runs: DashMap<String, Arc<RunHandle>>,
    timeout: Duration,
}

impl MultiNodeCoordinator {
    pub fn new(connector: Arc<dyn Connector>, stager: ToolStager, metrics: Arc<Metrics>) -> Self {
        Self {
            connector,
            stager,
            metrics,
            runs: DashMap::new(),
            timeout: RUN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validates and registers a run, then launches it in the background.
    pub fn start(self: &Arc<Self>, req: MultiNodeRequest) -> Result<String, OrchestratorError> {
        let hosts = req.host_list();
        if hosts.len() < 2 {
            return Err(OrchestratorError::Validation(
                "multi-node test requires at least 2 hosts".into(),
            ));
        }
        let conn = req.connection.clone().ok_or_else(|| {
            OrchestratorError::Validation("launcher connection is required".into())
        })?;
        conn.validate()
            .map_err(|e| OrchestratorError::Validation(format!("connection: {e}")))?;
        let parser = parse_parser(req.parser.as_deref().unwrap_or(DEFAULT_PARSER))
            .map_err(OrchestratorError::Validation)?;
        let params = req.mpi_params.clone().unwrap_or_else(|| MpiParams {
            gpu_per_node: 8,
            ..Default::default()
        });
        if params.gpu_per_node == 0 {
            return Err(OrchestratorError::Validation("gpuPerNode must be at least 1".into()));
        }

        let test_id = format!("mn-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let hostfile = req
            .uses_hostfile()
            .then(|| self.stager.remote_path(&format!("hostfile-{test_id}")));
        let nccl_dir = self.stager.remote_path("nccl-tests");
        let command = build_mpirun_command(&hosts, hostfile.as_deref(), &params, &nccl_dir)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        let run = MultiNodeRun {
            test_id: test_id.clone(),
            hosts: hosts.iter().map(|h| host_name(h).to_string()).collect(),
            node_count: hosts.len(),
            launcher: conn.display_name().to_string(),
            command: command.clone(),
            params: params.clone(),
            parser: parser.name().to_string(),
            status: MultiNodeStatus::Pending,
            bandwidth: None,
            passed: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let handle = Arc::new(RunHandle {
            record: RwLock::new(run),
            cancel: CancellationToken::new(),
        });
        self.runs.insert(test_id.clone(), handle.clone());
        Metrics::incr(&self.metrics.multi_node_runs_total);
        tracing::info!(test_id = %test_id, hosts = hosts.len(), launcher = %conn.host, "multi-node run accepted");

        let plan = LaunchPlan {
            conn,
            hostfile: hostfile.map(|path| {
                let mut content = req.hostfile_content.clone().unwrap_or_default();
                if !content.ends_with('\n') {
                    content.push('\n');
                }
                (path, content)
            }),
            params,
            parser,
        };
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.execute(handle, command, plan).await });
        Ok(test_id)
    }

    async fn execute(self: Arc<Self>, handle: Arc<RunHandle>, command: String, plan: LaunchPlan) {
        let cancel = handle.cancel.clone();
        let result = self.launch(&handle, &command, &plan, &cancel).await;
        let test_id = handle.record.read().test_id.clone();

        handle.update(|run| {
            run.completed_at = Some(Utc::now());
            match result {
                Ok((exit_code, stdout, stderr)) => {
                    run.bandwidth = plan.parser.parse(&stdout);
                    run.passed = run.bandwidth.map(|_| exit_code == 0);
                    run.exit_code = Some(exit_code);
                    run.stdout = fleetcheck_common::metric::tail(&stdout, OUTPUT_LIMIT).to_string();
                    run.stderr = fleetcheck_common::metric::tail(&stderr, OUTPUT_LIMIT).to_string();
                    if exit_code == 0 {
                        run.status = MultiNodeStatus::Completed;
                        if run.bandwidth.is_none() {
                            run.message = Some("no bus bandwidth found in output".into());
                        }
                    } else {
                        run.status = MultiNodeStatus::Failed;
                        run.message = Some(format!("mpirun exited with code {exit_code}"));
                    }
                }
                Err(BenchError::Session(SessionError::Cancelled)) => {
                    run.status = MultiNodeStatus::Cancelled;
                    run.message = Some("cancelled by request".into());
                }
                Err(e) => {
                    run.status = MultiNodeStatus::Failed;
                    run.message = Some(e.to_string());
                }
            }
        });
        let run = handle.record.read().clone();
        tracing::info!(test_id = %test_id, status = ?run.status, bandwidth = ?run.bandwidth, "multi-node run finished");
    }

    async fn launch(
        &self,
        handle: &RunHandle,
        command: &str,
        plan: &LaunchPlan,
        cancel: &CancellationToken,
    ) -> Result<(i32, String, String), BenchError> {
        let shell = tokio::select! {
            r = self.connector.connect(&plan.conn) => r?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled.into()),
        };
        let result = async {
            self.stager.prepare_workdir(&*shell, cancel).await?;
            if let Some((path, content)) = &plan.hostfile {
                let write = format!("printf '%s' {} > {}", quote(content)?, quote(path)?);
                shell.exec(&write, ExecOptions::default(), cancel).await?;
            }
            self.stager
                .ensure_unpacked(&*shell, Asset::NcclTests, cancel)
                .await?;

            handle.update(|run| {
                if run.status == MultiNodeStatus::Pending {
                    run.status = MultiNodeStatus::Running;
                    run.started_at = Some(Utc::now());
                }
            });
            tracing::debug!(gpu_per_node = plan.params.gpu_per_node, "launching mpirun");
            let out = shell
                .exec(command, ExecOptions::with_timeout(self.timeout).elevated(), cancel)
                .await?;
            Ok::<_, BenchError>((out.exit_code, out.stdout, out.stderr))
        }
        .await;
        if let Some((path, _)) = &plan.hostfile {
            self.remove_hostfile(&*shell, path).await;
        }
        shell.close().await;
        result
    }

    /// Runs even after cancellation, so it gets its own token.
    async fn remove_hostfile(&self, shell: &dyn RemoteShell, path: &str) {
        let cleanup = match quote(path) {
            Ok(q) => format!("rm -f {q}"),
            Err(e) => {
                tracing::warn!(path, error = %e, "unquotable hostfile path");
                return;
            }
        };
        if let Err(e) = shell
            .exec(&cleanup, ExecOptions::default(), &CancellationToken::new())
            .await
        {
            tracing::warn!(host = shell.host(), path, error = %e, "hostfile cleanup failed");
        }
    }

    pub fn poll(&self, test_id: &str) -> Result<MultiNodeRun, OrchestratorError> {
        self.runs
            .get(test_id)
            .map(|h| h.record.read().clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("multi-node test {test_id} not found")))
    }

    pub fn list(&self) -> Vec<MultiNodeRun> {
        let mut runs: Vec<MultiNodeRun> = self.runs.iter().map(|h| h.record.read().clone()).collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn cancel(&self, test_id: &str) -> Result<MultiNodeRun, OrchestratorError> {
        let handle = self
            .runs
            .get(test_id)
            .map(|h| h.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("multi-node test {test_id} not found")))?;
        let snapshot = {
            let mut run = handle.record.write();
            if run.status.is_terminal() {
                return Err(OrchestratorError::Conflict(format!(
                    "multi-node test {test_id} has already finished"
                )));
            }
            run.status = MultiNodeStatus::Cancelling;
            run.clone()
        };
        handle.cancel.cancel();
        tracing::info!(test_id = %test_id, "multi-node cancel requested");
        Ok(snapshot)
    }

    /// `(host, test id)` for every participant of a run still in flight.
    pub fn active_hosts(&self) -> Vec<(String, String)> {
        let mut busy = Vec::new();
        for h in self.runs.iter() {
            let run = h.record.read();
            if run.status.is_terminal() {
                continue;
            }
            for host in &run.hosts {
                busy.push((host.clone(), run.test_id.clone()));
            }
        }
        busy
    }
}
