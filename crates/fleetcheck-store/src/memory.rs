use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::types::MetaStore;

/// Process-local store. Used when no etcd endpoint is configured and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| t > now)
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(inner: &mut Inner) -> u64 {
        inner.revision = inner.revision.saturating_add(1);
        inner.revision
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        inner.kv.retain(|_, e| e.live(now));
        let revision = Self::next_revision(&mut inner);
        let expires_at = ttl_ms.map(|ms| now + Duration::from_millis(ms));
        inner.kv.insert(
            key.to_string(),
            Entry {
                value,
                revision,
                expires_at,
            },
        );
        Ok(revision)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        Ok(inner
            .kv
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| (e.value.clone(), e.revision)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        inner.kv.remove(key);
        Ok(Self::next_revision(&mut inner))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.live(now))
            .map(|(k, e)| (k.clone(), e.value.clone(), e.revision))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryMetaStore::new();
        let r1 = store.put("/jobs/a", b"one".to_vec(), None).await.unwrap();
        let r2 = store.put("/jobs/a", b"two".to_vec(), None).await.unwrap();
        assert!(r2 > r1);

        let (v, rev) = store.get("/jobs/a").await.unwrap().unwrap();
        assert_eq!(v, b"two");
        assert_eq!(rev, r2);

        store.delete("/jobs/a").await.unwrap();
        assert!(store.get("/jobs/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_is_scoped() {
        let store = MemoryMetaStore::new();
        store.put("/jobs/a", vec![1], None).await.unwrap();
        store.put("/jobs/b", vec![2], None).await.unwrap();
        store.put("/jobsx/c", vec![3], None).await.unwrap();
        store.put("/runs/d", vec![4], None).await.unwrap();

        let keys: Vec<String> = store
            .list_prefix("/jobs/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(keys, vec!["/jobs/a", "/jobs/b"]);
    }

    #[tokio::test]
    async fn test_ttl_expires_entries() {
        let store = MemoryMetaStore::new();
        store.put("/jobs/short", vec![1], Some(20)).await.unwrap();
        store.put("/jobs/long", vec![2], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get("/jobs/short").await.unwrap().is_none());
        assert_eq!(store.list_prefix("/jobs/").await.unwrap().len(), 1);
    }
}
