use anyhow::Result;
use async_trait::async_trait;

/// Revisioned key/value store holding durable orchestrator state.
///
/// Values are opaque bytes; callers serialize. Every mutation returns the
/// store revision it produced.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>>;
    async fn delete(&self, key: &str) -> Result<u64>;
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>>;
}
