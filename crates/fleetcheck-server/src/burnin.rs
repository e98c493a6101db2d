//! Long-running gpu_burn stress jobs, one node each.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fleetcheck_common::{BurninJob, BurninStatus, CreateBurninRequest, MemoryType};
use fleetcheck_remote::command::quote;
use fleetcheck_remote::{CancellationToken, Connector, ExecOptions, SessionError};
use parking_lot::RwLock;

use crate::assets::{Asset, ToolStager};
use crate::bench::BenchError;
use crate::error::OrchestratorError;
use crate::metrics::Metrics;

const TIMEOUT_SLACK: Duration = Duration::from_secs(300);

struct BurninHandle {
    record: RwLock<BurninJob>,
    cancel: CancellationToken,
}

impl BurninHandle {
    fn snapshot(&self) -> BurninJob {
        let mut job = self.record.read().clone();
        job.progress = job.progress_at(Utc::now());
        job
    }
}

/// `-m` argument understood by gpu_burn: megabytes, or a percentage of
/// free memory.
fn memory_arg(memory_type: MemoryType, value: u64) -> String {
    match memory_type {
        MemoryType::Percentage => format!("{value}%"),
        MemoryType::Fixed => value.to_string(),
    }
}

/// Per-GPU verdict lines from the final gpu_burn report, e.g. `GPU 0: OK`.
pub fn gpu_verdicts(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("GPU ") && (l.ends_with(": OK") || l.ends_with(": FAULTY")))
        .map(str::to_string)
        .collect()
}

pub struct BurninManager {
    connector: Arc<dyn Connector>,
    stager: ToolStager,
    metrics: Arc<Metrics>,
    jobs: DashMap<String, Arc<BurninHandle>>,
}

impl BurninManager {
    pub fn new(connector: Arc<dyn Connector>, stager: ToolStager, metrics: Arc<Metrics>) -> Self {
        Self {
            connector,
            stager,
            metrics,
            jobs: DashMap::new(),
        }
    }

    pub fn create(self: &Arc<Self>, req: CreateBurninRequest) -> Result<String, OrchestratorError> {
        req.validate().map_err(OrchestratorError::Validation)?;

        let now = Utc::now();
        let job_id = format!(
            "burnin-{}-{}",
            now.timestamp(),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );
        let job = BurninJob {
            job_id: job_id.clone(),
            node_name: req
                .node_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| req.connection.display_name().to_string()),
            host: req.connection.host.clone(),
            memory_type: req.memory_type,
            memory_value: req.memory_value,
            memory_param: req.memory_param(),
            duration: req.duration,
            status: BurninStatus::Creating,
            progress: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            exit_code: None,
            gpu_results: Vec::new(),
            message: None,
        };
        let handle = Arc::new(BurninHandle {
            record: RwLock::new(job),
            cancel: CancellationToken::new(),
        });
        self.jobs.insert(job_id.clone(), handle.clone());
        Metrics::incr(&self.metrics.burnin_jobs_total);
        tracing::info!(job_id = %job_id, host = %req.connection.host, duration = req.duration, "burn-in created");

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.execute(handle, req).await });
        Ok(job_id)
    }

    async fn execute(self: Arc<Self>, handle: Arc<BurninHandle>, req: CreateBurninRequest) {
        let cancel = handle.cancel.clone();
        let result = self.burn(&handle, &req, &cancel).await;

        let mut job = handle.record.write();
        job.completed_at = Some(Utc::now());
        match result {
            Ok((exit_code, output)) => {
                job.exit_code = Some(exit_code);
                job.gpu_results = gpu_verdicts(&output);
                let faulty = job.gpu_results.iter().any(|r| r.ends_with("FAULTY"));
                if exit_code == 0 && !faulty {
                    job.status = BurninStatus::Completed;
                } else {
                    job.status = BurninStatus::Failed;
                    job.message = Some(if faulty {
                        "faulty GPUs detected".to_string()
                    } else {
                        format!("gpu_burn exited with code {exit_code}")
                    });
                }
            }
            Err(BenchError::Session(SessionError::Cancelled)) => {
                job.status = BurninStatus::Stopped;
                job.message = Some("stopped by request".into());
            }
            Err(e) => {
                job.status = BurninStatus::Failed;
                job.message = Some(e.to_string());
            }
        }
        job.progress = job.progress_at(Utc::now());
        tracing::info!(job_id = %job.job_id, status = ?job.status, "burn-in finished");
    }

    async fn burn(
        &self,
        handle: &BurninHandle,
        req: &CreateBurninRequest,
        cancel: &CancellationToken,
    ) -> Result<(i32, String), BenchError> {
        let shell = tokio::select! {
            r = self.connector.connect(&req.connection) => r?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled.into()),
        };
        let result = async {
            let dir = self
                .stager
                .ensure_unpacked(&*shell, Asset::GpuBurn, cancel)
                .await?;
            {
                let mut job = handle.record.write();
                job.status = BurninStatus::Running;
                job.started_at = Some(Utc::now());
            }
            let cmd = format!(
                "cd {} && ./gpu_burn -m {} {}",
                quote(&dir)?,
                quote(&memory_arg(req.memory_type, req.memory_value))?,
                req.duration
            );
            let timeout = Duration::from_secs(req.duration) + TIMEOUT_SLACK;
            let out = shell
                .exec(&cmd, ExecOptions::with_timeout(timeout).elevated(), cancel)
                .await?;
            Ok::<_, BenchError>((out.exit_code, out.combined()))
        }
        .await;
        shell.close().await;
        result
    }

    pub fn get(&self, job_id: &str) -> Result<BurninJob, OrchestratorError> {
        self.jobs
            .get(job_id)
            .map(|h| h.snapshot())
            .ok_or_else(|| OrchestratorError::NotFound(format!("burn-in job {job_id} not found")))
    }

    /// Newest first.
    pub fn list(&self) -> Vec<BurninJob> {
        let mut jobs: Vec<BurninJob> = self.jobs.iter().map(|h| h.snapshot()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn stop(&self, job_id: &str) -> Result<BurninJob, OrchestratorError> {
        let handle = self
            .jobs
            .get(job_id)
            .map(|h| h.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("burn-in job {job_id} not found")))?;
        {
            let mut job = handle.record.write();
            if job.status.is_terminal() {
                return Err(OrchestratorError::Conflict(format!(
                    "burn-in job {job_id} has already finished"
                )));
            }
            job.status = BurninStatus::Stopping;
        }
        handle.cancel.cancel();
        tracing::info!(job_id = %job_id, "burn-in stop requested");
        Ok(handle.snapshot())
    }

    /// `(host, node name, job id)` of every burn-in still in flight.
    pub fn active_hosts(&self) -> Vec<(String, String, String)> {
        self.jobs
            .iter()
            .filter_map(|h| {
                let job = h.record.read();
                (!job.status.is_terminal())
                    .then(|| (job.host.clone(), job.node_name.clone(), job.job_id.clone()))
            })
            .collect()
    }
}
