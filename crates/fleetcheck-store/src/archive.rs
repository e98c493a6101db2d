use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetcheck_common::Job;

use crate::types::MetaStore;

const JOB_PREFIX: &str = "/jobs/";

/// Typed access to persisted job snapshots.
#[derive(Clone)]
pub struct JobArchive {
    store: Arc<dyn MetaStore>,
    retention: Option<Duration>,
}

impl JobArchive {
    pub fn new(store: Arc<dyn MetaStore>, retention: Option<Duration>) -> Self {
        Self { store, retention }
    }

    fn key(job_id: &str) -> String {
        format!("{JOB_PREFIX}{job_id}")
    }

    pub async fn save(&self, job: &Job) -> Result<u64> {
        let bytes = serde_json::to_vec(job).context("serialize job snapshot")?;
        let ttl_ms = self.retention.map(|d| d.as_millis() as u64);
        self.store.put(&Self::key(&job.job_id), bytes, ttl_ms).await
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let Some((bytes, _)) = self.store.get(&Self::key(job_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes).context("decode job snapshot")?))
    }

    /// All decodable snapshots. Corrupt entries are logged and skipped.
    pub async fn load_all(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for (key, bytes, _) in self.store.list_prefix(JOB_PREFIX).await? {
            match serde_json::from_slice::<Job>(&bytes) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(key=%key, error=%e, "skipping undecodable job snapshot"),
            }
        }
        Ok(jobs)
    }

    pub async fn remove(&self, job_id: &str) -> Result<()> {
        self.store.delete(&Self::key(job_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryMetaStore;
    use chrono::Utc;
    use fleetcheck_common::{JobStatus, TestKind};

    fn make_job(id: &str) -> Job {
        Job {
            job_id: id.to_string(),
            job_name: Some("nightly".into()),
            status: JobStatus::Completed,
            tests: vec![TestKind::P2p],
            dcgm_level: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            stop_requested: false,
            nodes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_all() {
        let store = Arc::new(MemoryMetaStore::new());
        let archive = JobArchive::new(store.clone(), None);
        archive.save(&make_job("job-1")).await.unwrap();
        archive.save(&make_job("job-2")).await.unwrap();
        store.put("/jobs/garbage", b"not json".to_vec(), None).await.unwrap();

        let mut ids: Vec<String> = archive
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["job-1", "job-2"]);

        let one = archive.load("job-1").await.unwrap().unwrap();
        assert_eq!(one.job_name.as_deref(), Some("nightly"));

        archive.remove("job-1").await.unwrap();
        assert!(archive.load("job-1").await.unwrap().is_none());
    }
}
