use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleetcheck_common::auth::AuthConfig;
use fleetcheck_remote::Connector;
use fleetcheck_store::{JobArchive, MetaStore};

use crate::assets::ToolStager;
use crate::bench::BenchmarkRunner;
use crate::burnin::BurninManager;
use crate::metrics::Metrics;
use crate::multinode::MultiNodeCoordinator;
use crate::prereq::PrereqChecker;
use crate::reference::ReferenceStore;
use crate::scheduler::JobScheduler;
use crate::trust::TrustProvisioner;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub assets_dir: Option<PathBuf>,
    pub remote_workdir: String,
    pub max_parallel_nodes: usize,
    pub job_retention: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            assets_dir: None,
            remote_workdir: "/tmp/fleetcheck".into(),
            max_parallel_nodes: 32,
            job_retention: None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub connector: Arc<dyn Connector>,
    pub references: Arc<ReferenceStore>,
    pub scheduler: Arc<JobScheduler>,
    pub multinode: Arc<MultiNodeCoordinator>,
    pub trust: Arc<TrustProvisioner>,
    pub burnin: Arc<BurninManager>,
    pub prereq: PrereqChecker,
    pub metrics: Arc<Metrics>,
    pub auth: AuthConfig,
}

impl AsRef<AuthConfig> for AppState {
    fn as_ref(&self) -> &AuthConfig {
        &self.auth
    }
}

impl AppState {
    /// Wires every workflow component onto one connector and one store.
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn MetaStore>,
        references: Arc<ReferenceStore>,
        auth: AuthConfig,
        config: &ServerConfig,
    ) -> Self {
        let metrics = Arc::new(Metrics::default());
        let stager = ToolStager::new(config.assets_dir.clone(), config.remote_workdir.clone());
        let archive = JobArchive::new(store, config.job_retention);

        let scheduler = JobScheduler::new(
            connector.clone(),
            BenchmarkRunner::new(stager.clone()),
            references.clone(),
            archive,
            metrics.clone(),
            config.max_parallel_nodes,
        );
        let multinode = MultiNodeCoordinator::new(connector.clone(), stager.clone(), metrics.clone());
        let burnin = BurninManager::new(connector.clone(), stager, metrics.clone());

        Self {
            trust: Arc::new(TrustProvisioner::new(connector.clone())),
            connector,
            references,
            scheduler: Arc::new(scheduler),
            multinode: Arc::new(multinode),
            burnin: Arc::new(burnin),
            prereq: PrereqChecker,
            metrics,
            auth,
        }
    }
}
