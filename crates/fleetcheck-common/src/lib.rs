pub mod api;
pub mod benchmark;
pub mod burnin;
pub mod connection;
pub mod job;
pub mod metric;
pub mod multinode;
pub mod node;
pub mod prereq;
pub mod trust;

pub use api::{ApiResponse, ErrorCode};
pub use benchmark::{normalize_gpu_name, Dimension, GpuReference, ReferenceTable};
pub use burnin::{BurninJob, BurninStatus, CreateBurninRequest, MemoryType};
pub use connection::{AuthKind, AuthMethod, ConnectionDescriptor};
pub use job::{
    reduce_job_status, CreateJobRequest, Job, JobStatus, NodeRecord, NodeRunStatus, TestKind,
};
pub use metric::{Metric, MetricStatus, MetricValue};
pub use multinode::{MpiParams, MultiNodeRequest, MultiNodeRun, MultiNodeStatus};
pub use node::{NodeActivity, NodeState, NodeSummary};
pub use prereq::{PrerequisiteReport, VersionInfo};
pub use trust::{TrustReport, TrustResult, TrustStatus};

pub mod auth;
pub mod telemetry;
