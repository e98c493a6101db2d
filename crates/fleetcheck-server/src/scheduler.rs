//! Diagnostic job lifecycle: validation, per-node fan-out, cancellation,
//! status reduction and persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use fleetcheck_common::{
    ConnectionDescriptor, CreateJobRequest, Job, JobStatus, Metric, MetricStatus, NodeActivity,
    NodeRecord, NodeRunStatus, NodeState, ReferenceTable, TestKind,
};
use fleetcheck_remote::{CancellationToken, Connector, RemoteShell, SessionError};
use fleetcheck_store::JobArchive;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::bench::{BenchmarkRunner, NodeContext};
use crate::error::OrchestratorError;
use crate::metrics::Metrics;
use crate::prereq::PrereqChecker;
use crate::probe;
use crate::reference::ReferenceStore;

pub const DEFAULT_DCGM_LEVEL: u8 = 2;
const GATE_COMMAND: &str = "nvidia-smi";
const RESTART_MESSAGE: &str = "interrupted by orchestrator restart";

struct JobHandle {
    record: RwLock<Job>,
    cancel: CancellationToken,
}

impl JobHandle {
    fn new(job: Job) -> Self {
        Self {
            record: RwLock::new(job),
            cancel: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> Job {
        self.record.read().clone()
    }

    fn update_node(&self, node_id: &str, f: impl FnOnce(&mut NodeRecord)) {
        let mut job = self.record.write();
        if let Some(node) = job.node_mut(node_id) {
            f(node);
        }
        job.refresh_status();
    }
}

enum NodeOutcome {
    Finished,
    Cancelled,
    Failed(String),
}

pub struct JobScheduler {
    connector: Arc<dyn Connector>,
    runner: BenchmarkRunner,
    prereq: PrereqChecker,
    references: Arc<ReferenceStore>,
    archive: JobArchive,
    metrics: Arc<Metrics>,
    permits: Arc<Semaphore>,
    jobs: DashMap<String, Arc<JobHandle>>,
}

impl JobScheduler {
    pub fn new(
        connector: Arc<dyn Connector>,
        runner: BenchmarkRunner,
        references: Arc<ReferenceStore>,
        archive: JobArchive,
        metrics: Arc<Metrics>,
        max_parallel_nodes: usize,
    ) -> Self {
        Self {
            connector,
            runner,
            prereq: PrereqChecker,
            references,
            archive,
            metrics,
            permits: Arc::new(Semaphore::new(max_parallel_nodes.max(1))),
            jobs: DashMap::new(),
        }
    }

    /// Validates the request, registers the job and starts it in the
    /// background. Nothing remote happens before this returns.
    pub fn create_job(self: &Arc<Self>, req: CreateJobRequest) -> Result<String, OrchestratorError> {
        let tests = validate_tests(&req.tests)?;
        if req.nodes.is_empty() {
            return Err(OrchestratorError::Validation("at least one node is required".into()));
        }
        for (idx, node) in req.nodes.iter().enumerate() {
            node.validate()
                .map_err(|e| OrchestratorError::Validation(format!("node {}: {e}", idx + 1)))?;
        }
        let dcgm_level = req.dcgm_level.unwrap_or(DEFAULT_DCGM_LEVEL);
        if !(1..=4).contains(&dcgm_level) {
            return Err(OrchestratorError::Validation(format!(
                "dcgmLevel must be between 1 and 4, got {dcgm_level}"
            )));
        }

        let job_id = format!("job-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let targets: Vec<(String, ConnectionDescriptor)> = req
            .nodes
            .into_iter()
            .enumerate()
            .map(|(idx, conn)| (format!("node-{}", idx + 1), conn))
            .collect();
        let now = Utc::now();
        let job = Job {
            job_id: job_id.clone(),
            job_name: req.job_name.filter(|n| !n.trim().is_empty()),
            status: JobStatus::Pending,
            tests: tests.clone(),
            dcgm_level,
            created_at: now,
            updated_at: now,
            stop_requested: false,
            nodes: targets
                .iter()
                .map(|(id, conn)| NodeRecord::new(id.clone(), conn))
                .collect(),
        };
        let handle = Arc::new(JobHandle::new(job));
        self.jobs.insert(job_id.clone(), handle.clone());
        Metrics::incr(&self.metrics.jobs_created_total);
        tracing::info!(job_id = %job_id, nodes = targets.len(), tests = ?tests, "job created");

        let sched = Arc::clone(self);
        let refs = self.references.snapshot();
        tokio::spawn(async move { sched.supervise(handle, targets, refs).await });
        Ok(job_id)
    }

    async fn supervise(
        self: Arc<Self>,
        handle: Arc<JobHandle>,
        targets: Vec<(String, ConnectionDescriptor)>,
        refs: Arc<ReferenceTable>,
    ) {
        let mut set = JoinSet::new();
        for (node_id, conn) in targets {
            let sched = self.clone();
            let handle = handle.clone();
            let refs = refs.clone();
            set.spawn(async move { sched.run_node(handle, node_id, conn, refs).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "node task aborted");
            }
        }

        let job = {
            let mut job = handle.record.write();
            for node in job.nodes.iter_mut().filter(|n| !n.status.is_terminal()) {
                node.log("node task ended without a result");
                node.finish(NodeRunStatus::Failed, Some("node task aborted".into()));
            }
            job.refresh_status();
            job.clone()
        };

        let counter = match job.status {
            JobStatus::Completed => &self.metrics.jobs_completed_total,
            JobStatus::Cancelled => &self.metrics.jobs_cancelled_total,
            _ => &self.metrics.jobs_failed_total,
        };
        Metrics::incr(counter);
        tracing::info!(job_id = %job.job_id, status = ?job.status, "job finished");
        self.persist(&job).await;
    }

    async fn run_node(
        self: Arc<Self>,
        handle: Arc<JobHandle>,
        node_id: String,
        conn: ConnectionDescriptor,
        refs: Arc<ReferenceTable>,
    ) {
        let cancel = handle.cancel.clone();
        let permit = tokio::select! {
            p = self.permits.clone().acquire_owned() => p.ok(),
            _ = cancel.cancelled() => None,
        };
        let Some(_permit) = permit else {
            handle.update_node(&node_id, |n| {
                n.log("cancelled before start");
                n.finish(NodeRunStatus::Cancelled, None);
            });
            self.persist(&handle.snapshot()).await;
            return;
        };

        let (tests, dcgm_level) = {
            let job = handle.record.read();
            (job.tests.clone(), job.dcgm_level)
        };
        handle.update_node(&node_id, |n| {
            if n.status == NodeRunStatus::Pending {
                n.status = NodeRunStatus::Running;
            }
            n.started_at = Some(Utc::now());
            n.log(format!("connecting to {} as {}", conn.endpoint(), conn.username));
        });

        let connected = tokio::select! {
            r = self.connector.connect(&conn) => r,
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        };
        let outcome = match connected {
            Ok(shell) => {
                handle.update_node(&node_id, |n| n.log("connected"));
                let outcome = self
                    .node_flow(&handle, &node_id, &*shell, &tests, dcgm_level, &refs, &cancel)
                    .await;
                shell.close().await;
                outcome
            }
            Err(SessionError::Cancelled) => NodeOutcome::Cancelled,
            Err(e) => {
                tracing::warn!(host = %conn.host, error = %e, "node unreachable");
                let reason = format!("connection failed: {e}");
                handle.update_node(&node_id, |n| skip_all(n, &tests, &reason));
                NodeOutcome::Failed(reason)
            }
        };

        handle.update_node(&node_id, |n| match outcome {
            NodeOutcome::Cancelled => {
                n.log("cancelled");
                n.finish(NodeRunStatus::Cancelled, Some("cancelled by request".into()));
            }
            NodeOutcome::Failed(reason) => {
                n.log(&reason);
                n.finish(NodeRunStatus::Failed, Some(reason));
            }
            NodeOutcome::Finished => {
                let failing: Vec<&str> = n
                    .results
                    .iter()
                    .filter(|(_, m)| !m.status.is_acceptable())
                    .map(|(t, _)| t.as_str())
                    .collect();
                if failing.is_empty() {
                    n.log("all tests passed");
                    n.finish(NodeRunStatus::Passed, None);
                } else {
                    let msg = format!("failed tests: {}", failing.join(", "));
                    n.log(&msg);
                    n.finish(NodeRunStatus::Failed, Some(msg));
                }
            }
        });

        let snapshot = handle.snapshot();
        if snapshot
            .nodes
            .iter()
            .any(|n| n.node_id == node_id && n.status == NodeRunStatus::Failed)
        {
            Metrics::incr(&self.metrics.nodes_failed_total);
        }
        self.persist(&snapshot).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn node_flow(
        &self,
        handle: &JobHandle,
        node_id: &str,
        shell: &dyn RemoteShell,
        tests: &[TestKind],
        dcgm_level: u8,
        refs: &ReferenceTable,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let gate = self
            .prereq
            .probe_all(shell, &[GATE_COMMAND.to_string()], cancel)
            .await;
        if cancel.is_cancelled() {
            return NodeOutcome::Cancelled;
        }
        let missing: Vec<&str> = gate
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect();
        if !missing.is_empty() {
            let reason = format!("prerequisite missing: {}", missing.join(", "));
            handle.update_node(node_id, |n| skip_all(n, tests, &reason));
            return NodeOutcome::Failed(reason);
        }

        let inventory = match probe::gpu_inventory(shell, refs, cancel).await {
            Ok(inv) => inv,
            Err(SessionError::Cancelled) => return NodeOutcome::Cancelled,
            Err(e) => return NodeOutcome::Failed(format!("GPU query failed: {e}")),
        };
        handle.update_node(node_id, |n| {
            n.gpu_model = Some(inventory.model.clone());
            n.gpu_count = Some(inventory.count());
            n.log(format!("detected {} x {}", inventory.count(), inventory.model));
        });

        let ctx = NodeContext {
            gpu_count: inventory.count(),
            gpu_model: inventory.model,
        };
        for (idx, &test) in tests.iter().enumerate() {
            if cancel.is_cancelled() {
                handle.update_node(node_id, |n| skip_all(n, &tests[idx..], "cancelled"));
                return NodeOutcome::Cancelled;
            }
            handle.update_node(node_id, |n| {
                n.results.insert(test, Metric::running());
                n.log(format!("running {test}"));
            });

            let metric = self
                .runner
                .run(shell, test, &ctx, refs, dcgm_level, cancel)
                .await;
            tracing::info!(host = shell.host(), test = %test, status = ?metric.status, "test finished");
            handle.update_node(node_id, |n| {
                n.log(format!("{test} finished: {}", describe(&metric)));
                n.results.insert(test, metric);
            });
        }
        if cancel.is_cancelled() {
            return NodeOutcome::Cancelled;
        }
        NodeOutcome::Finished
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.jobs
            .get(job_id)
            .map(|h| h.snapshot())
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id} not found")))
    }

    /// Newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|h| h.snapshot()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn stop_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let handle = self
            .jobs
            .get(job_id)
            .map(|h| h.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id} not found")))?;
        let snapshot = {
            let mut job = handle.record.write();
            if job.status.is_terminal() {
                return Err(OrchestratorError::Conflict(format!(
                    "job {job_id} has already finished"
                )));
            }
            job.stop_requested = true;
            for node in job.nodes.iter_mut().filter(|n| !n.status.is_terminal()) {
                node.status = NodeRunStatus::Cancelling;
                node.log("stop requested");
            }
            job.refresh_status();
            job.clone()
        };
        handle.cancel.cancel();
        tracing::info!(job_id = %job_id, "stop requested");
        Ok(snapshot)
    }

    /// Busy/idle view over every host known from jobs.
    pub fn node_activity(&self) -> Vec<NodeActivity> {
        let mut hosts: BTreeMap<String, NodeActivity> = BTreeMap::new();
        for handle in self.jobs.iter() {
            let job = handle.record.read();
            for node in &job.nodes {
                let busy = matches!(
                    node.status,
                    NodeRunStatus::Running | NodeRunStatus::Cancelling
                );
                let entry = NodeActivity {
                    host: node.host.clone(),
                    alias: node.alias.clone(),
                    status: if busy { NodeState::Busy } else { NodeState::Idle },
                    activity: busy.then(|| {
                        let current = node
                            .results
                            .iter()
                            .find(|(_, m)| m.status == MetricStatus::Running)
                            .map(|(t, _)| t.as_str())
                            .unwrap_or("connecting");
                        format!("{}: {current}", job.job_id)
                    }),
                    last_seen: job.updated_at,
                };
                match hosts.get(&node.host) {
                    Some(prev) if prev.status == NodeState::Busy && !busy => {}
                    Some(prev) if prev.status == entry.status && prev.last_seen >= entry.last_seen => {}
                    _ => {
                        hosts.insert(node.host.clone(), entry);
                    }
                }
            }
        }
        hosts.into_values().collect()
    }

    /// Reloads persisted jobs. Jobs that were still in flight when the
    /// previous process stopped are closed out as failed.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let jobs = self.archive.load_all().await?;
        let count = jobs.len();
        for mut job in jobs {
            if !job.status.is_terminal() {
                for node in job.nodes.iter_mut().filter(|n| !n.status.is_terminal()) {
                    node.log(RESTART_MESSAGE);
                    node.finish(NodeRunStatus::Failed, Some(RESTART_MESSAGE.into()));
                }
                job.stop_requested = false;
                job.refresh_status();
                tracing::warn!(job_id = %job.job_id, "job interrupted by restart");
                self.persist(&job).await;
            }
            self.jobs.insert(job.job_id.clone(), Arc::new(JobHandle::new(job)));
        }
        Ok(count)
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.archive.save(job).await {
            Metrics::incr(&self.metrics.persist_errors_total);
            tracing::warn!(job_id = %job.job_id, error = %e, "failed to persist job snapshot");
        }
    }
}

fn validate_tests(raw: &[String]) -> Result<Vec<TestKind>, OrchestratorError> {
    if raw.is_empty() {
        return Err(OrchestratorError::Validation("at least one test is required".into()));
    }
    let tests: BTreeSet<TestKind> = raw
        .iter()
        .map(|t| t.parse::<TestKind>())
        .collect::<Result<_, _>>()
        .map_err(OrchestratorError::Validation)?;
    Ok(tests.into_iter().collect())
}

fn skip_all(node: &mut NodeRecord, tests: &[TestKind], reason: &str) {
    for test in tests {
        node.results.insert(*test, Metric::skipped(reason));
    }
}

fn describe(metric: &Metric) -> String {
    let status = metric.status.as_str();
    match (metric.number(), &metric.message) {
        (Some(v), _) => format!("{status} ({v:.2} {})", metric.unit.as_deref().unwrap_or("")),
        (None, Some(msg)) => format!("{status} ({msg})"),
        _ => status.to_string(),
    }
}
