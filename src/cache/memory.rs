// =============================================================================
// In-memory cache backend — bounded, DashMap-backed, with per-item TTL
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{CacheBackend, CacheValue};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if Instant::now() >= t)
    }
}

/// Bounded LRU+TTL in-memory backend. One `DashMap` per namespace, plus a
/// per-namespace insertion-order queue used for LRU-style eviction once the
/// configured capacity is exceeded.
pub struct MemoryBackend {
    capacity: usize,
    tables: DashMap<String, Arc<DashMap<String, Entry>>>,
    order: DashMap<String, Arc<Mutex<Vec<String>>>>,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tables: DashMap::new(),
            order: DashMap::new(),
        }
    }

    fn table(&self, namespace: &str) -> Arc<DashMap<String, Entry>> {
        self.tables
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone()
    }

    fn order_queue(&self, namespace: &str) -> Arc<Mutex<Vec<String>>> {
        self.order
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    fn touch(&self, namespace: &str, key: &str) {
        let queue = self.order_queue(namespace);
        let mut q = queue.lock();
        q.retain(|k| k != key);
        q.push(key.to_string());
    }

    fn evict_if_needed(&self, namespace: &str) {
        let table = self.table(namespace);
        if table.len() <= self.capacity {
            return;
        }
        let queue = self.order_queue(namespace);
        let mut q = queue.lock();
        while table.len() > self.capacity {
            if let Some(oldest) = q.first().cloned() {
                q.remove(0);
                table.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<CacheValue> {
        let table = self.table(namespace);
        let hit = table.get(key).and_then(|e| {
            if e.is_expired() {
                None
            } else {
                Some(e.value.clone())
            }
        });
        if hit.is_some() {
            self.touch(namespace, key);
        } else {
            table.remove(key);
        }
        Ok(hit)
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let table = self.table(namespace);
        let expires_at = ttl.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);
        table.insert(key.to_string(), Entry { value, expires_at });
        self.touch(namespace, key);
        self.evict_if_needed(namespace);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        self.table(namespace).remove(key);
        let queue = self.order_queue(namespace);
        queue.lock().retain(|k| k != key);
        Ok(())
    }

    async fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        self.table(namespace).clear();
        self.order_queue(namespace).lock().clear();
        Ok(())
    }

    async fn size(&self, namespace: &str) -> anyhow::Result<usize> {
        Ok(self.table(namespace).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let c = MemoryBackend::new(10);
        c.set("ns", "a", b"hello".to_vec(), None).await.unwrap();
        assert_eq!(c.get("ns", "a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let c = MemoryBackend::new(10);
        assert_eq!(c.get("ns", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expiry() {
        let c = MemoryBackend::new(10);
        c.set("ns", "a", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.get("ns", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn eviction_respects_capacity() {
        let c = MemoryBackend::new(2);
        c.set("ns", "a", b"1".to_vec(), None).await.unwrap();
        c.set("ns", "b", b"2".to_vec(), None).await.unwrap();
        c.set("ns", "c", b"3".to_vec(), None).await.unwrap();
        assert_eq!(c.size("ns").await.unwrap(), 2);
        // "a" was least-recently-used and should have been evicted.
        assert_eq!(c.get("ns", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_empties_namespace_only() {
        let c = MemoryBackend::new(10);
        c.set("ns1", "a", b"1".to_vec(), None).await.unwrap();
        c.set("ns2", "a", b"1".to_vec(), None).await.unwrap();
        c.clear("ns1").await.unwrap();
        assert_eq!(c.size("ns1").await.unwrap(), 0);
        assert_eq!(c.size("ns2").await.unwrap(), 1);
    }
}
