// =============================================================================
// Audit wrapper — structured log line per cache operation, semantics-preserving
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CacheBackend, CacheValue};

pub struct AuditedCache<B: CacheBackend> {
    inner: B,
}

impl<B: CacheBackend> AuditedCache<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for AuditedCache<B> {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<CacheValue> {
        let result = self.inner.get(namespace, key).await;
        debug!(
            op = "get",
            namespace,
            key,
            hit = result.as_ref().map(|v| v.is_some()).unwrap_or(false),
            "cache operation"
        );
        result
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let bytes = value.len();
        let result = self.inner.set(namespace, key, value, ttl).await;
        debug!(
            op = "set",
            namespace,
            key,
            bytes,
            ok = result.is_ok(),
            "cache operation"
        );
        result
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        let result = self.inner.delete(namespace, key).await;
        debug!(op = "delete", namespace, key, ok = result.is_ok(), "cache operation");
        result
    }

    async fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        let result = self.inner.clear(namespace).await;
        debug!(op = "clear", namespace, ok = result.is_ok(), "cache operation");
        result
    }

    async fn size(&self, namespace: &str) -> anyhow::Result<usize> {
        self.inner.size(namespace).await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;

    #[tokio::test]
    async fn passthrough_semantics_unchanged() {
        let cache = AuditedCache::new(MemoryBackend::new(10));
        cache.set("ns", "k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("ns", "k").await.unwrap(), Some(b"v".to_vec()));
        cache.delete("ns", "k").await.unwrap();
        assert_eq!(cache.get("ns", "k").await.unwrap(), None);
    }
}
