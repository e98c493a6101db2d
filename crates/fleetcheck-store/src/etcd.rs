use std::sync::Arc;

use anyhow::Result;
use etcd_client::{Client, GetOptions, PutOptions};
use tokio::sync::Mutex;

use crate::types::MetaStore;

#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }

    fn ttl_to_seconds(ttl_ms: u64) -> i64 {
        (ttl_ms.div_ceil(1000) as i64).max(1)
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64> {
        let mut cli = self.client.lock().await;

        let mut opts = PutOptions::new();
        if let Some(ttl_ms) = ttl_ms {
            let lease = cli.lease_grant(Self::ttl_to_seconds(ttl_ms), None).await?;
            opts = opts.with_lease(lease.id());
        }

        let resp = cli.put(key, value, Some(opts)).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or_default() as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    kv.value().to_vec(),
                    kv.mod_revision() as u64,
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_whole_seconds() {
        assert_eq!(EtcdMetaStore::ttl_to_seconds(1), 1);
        assert_eq!(EtcdMetaStore::ttl_to_seconds(0), 1);
        assert_eq!(EtcdMetaStore::ttl_to_seconds(1500), 2);
        assert_eq!(EtcdMetaStore::ttl_to_seconds(3_600_000), 3600);
    }
}
