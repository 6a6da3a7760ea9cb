// =============================================================================
// Cache backend — pluggable key/value store with TTL
// =============================================================================
//
// Every persistent concern in the engine (auth state, symbol tables, active
// trades, scheduled alerts, sandbox books) goes through this one interface.
// Values are opaque bytes; callers own serialization.  See `memory`, `disk`,
// and `distributed` for the three backends, and `encrypt`/`audit` for the
// decorators that compose over any of them.
// =============================================================================

pub mod audit;
pub mod disk;
pub mod distributed;
pub mod encrypt;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

/// Namespace constants — also used as the on-disk filename / distributed key
/// prefix for each logical cache.
pub mod namespace {
    pub const AUTH: &str = "auth";
    pub const API_KEYS: &str = "api_keys";
    pub const TOKENS: &str = "tokens";
    pub const SYMBOLS: &str = "symbols";
    pub const SETTINGS: &str = "settings";
    pub const STRATEGIES: &str = "strategies";
    pub const ACTIVE_TRADES: &str = "active_trades";
    pub const SCHEDULED_ALERTS: &str = "scheduled_alerts";
    pub const TRIGGER_HISTORY: &str = "trigger_history";
    pub const SANDBOX_ORDERS: &str = "sandbox_orders";
    pub const SANDBOX_POSITIONS: &str = "sandbox_positions";
    pub const SANDBOX_FUNDS: &str = "sandbox_funds";
    /// Short-lived idempotency records for `place`/`smart_close` replays.
    /// Not part of the persisted-state layout — entries expire
    /// within the dedup window and are never expected to survive a restart.
    pub const ORDER_DEDUP: &str = "order_dedup";

    /// Namespaces that the encryption wrapper must apply to.
    pub const ENCRYPTED: &[&str] = &[AUTH, API_KEYS, TOKENS];
}

/// A cache entry returned by `get`/`get_many`: `None` means absent or expired.
pub type CacheValue = Option<Vec<u8>>;

/// Pluggable key/value store with per-item TTL.
///
/// `ttl = None` (or `Duration::ZERO`) means "no expiry". Concurrent `set` on
/// the same key is last-writer-wins; there are no cross-key transactions.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<CacheValue>;
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;
    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;
    async fn exists(&self, namespace: &str, key: &str) -> anyhow::Result<bool> {
        Ok(self.get(namespace, key).await?.is_some())
    }
    async fn get_many(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> anyhow::Result<Vec<(String, CacheValue)>> {
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            out.push((k.clone(), self.get(namespace, k).await?));
        }
        Ok(out)
    }
    async fn set_many(
        &self,
        namespace: &str,
        items: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        for (k, v) in items {
            self.set(namespace, &k, v, ttl).await?;
        }
        Ok(())
    }
    async fn clear(&self, namespace: &str) -> anyhow::Result<()>;
    async fn size(&self, namespace: &str) -> anyhow::Result<usize>;

    /// Flush any buffered writes to stable storage (no-op for backends that
    /// are already write-through). Called on clean shutdown.
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// JSON convenience helpers layered over the raw-bytes trait. Kept as free
/// functions rather than trait defaults so `CacheBackend` stays object-safe
/// and usable as `Arc<dyn CacheBackend>`.
pub mod json {
    use super::CacheBackend;
    use serde::{de::DeserializeOwned, Serialize};
    use std::time::Duration;

    pub async fn get<T: DeserializeOwned>(
        backend: &dyn CacheBackend,
        namespace: &str,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match backend.get(namespace, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(
        backend: &dyn CacheBackend,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value)?;
        backend.set(namespace, key, bytes, ttl).await
    }
}

/// Lets a trait object be composed inside the `Encrypted`/`Audited`
/// decorators, which are generic over `B: CacheBackend` rather than over
/// `dyn CacheBackend` directly — delegating every method keeps the
/// decorators reusable over both concrete backends and an already-erased
/// `Arc<dyn CacheBackend>`.
#[async_trait]
impl CacheBackend for std::sync::Arc<dyn CacheBackend> {
    async fn get(&self, namespace: &str, key: &str) -> anyhow::Result<CacheValue> {
        (**self).get(namespace, key).await
    }
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        (**self).set(namespace, key, value, ttl).await
    }
    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()> {
        (**self).delete(namespace, key).await
    }
    async fn exists(&self, namespace: &str, key: &str) -> anyhow::Result<bool> {
        (**self).exists(namespace, key).await
    }
    async fn get_many(
        &self,
        namespace: &str,
        keys: &[String],
    ) -> anyhow::Result<Vec<(String, CacheValue)>> {
        (**self).get_many(namespace, keys).await
    }
    async fn set_many(
        &self,
        namespace: &str,
        items: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        (**self).set_many(namespace, items, ttl).await
    }
    async fn clear(&self, namespace: &str) -> anyhow::Result<()> {
        (**self).clear(namespace).await
    }
    async fn size(&self, namespace: &str) -> anyhow::Result<usize> {
        (**self).size(namespace).await
    }
    async fn flush(&self) -> anyhow::Result<()> {
        (**self).flush().await
    }
}

/// Backend selection policy: explicit config wins; otherwise probe a
/// distributed endpoint with a 2s health ping, falling back to on-disk.
/// Multi-instance deployments force distributed and fail startup if it is
/// unavailable.
async fn select_base_backend(
    cfg: &crate::runtime_config::CacheConfig,
) -> anyhow::Result<std::sync::Arc<dyn CacheBackend>> {
    use std::sync::Arc;

    match cfg.backend.as_str() {
        "memory" => Ok(Arc::new(memory::MemoryBackend::new(cfg.memory_capacity))),
        "disk" => Ok(Arc::new(disk::DiskBackend::new(&cfg.disk_dir)?)),
        "distributed" => {
            let backend = distributed::DistributedBackend::new(&cfg.distributed_endpoint);
            backend.health_check(Duration::from_secs(2)).await?;
            Ok(Arc::new(backend))
        }
        "auto" => {
            if !cfg.distributed_endpoint.is_empty() {
                let backend = distributed::DistributedBackend::new(&cfg.distributed_endpoint);
                if backend.health_check(Duration::from_secs(2)).await.is_ok() {
                    tracing::info!(endpoint = %cfg.distributed_endpoint, "cache: using distributed backend");
                    return Ok(Arc::new(backend));
                }
                tracing::warn!("cache: distributed endpoint unresponsive, falling back to disk");
            }
            if cfg.multi_instance {
                anyhow::bail!("multi-instance mode requires a reachable distributed cache backend");
            }
            Ok(Arc::new(disk::DiskBackend::new(&cfg.disk_dir)?))
        }
        other => anyhow::bail!("unknown cache backend selector: {other}"),
    }
}

/// Select a backend per `select_base_backend` and layer the security
/// wrappers over it: audit always applies, encryption applies when an
/// encryption key was loaded (development deployments may run without one,
/// at the cost of storing `auth`/`api_keys`/`tokens` in the clear — `main`
/// logs a warning in that case).
pub async fn build_cache(
    cfg: &crate::runtime_config::CacheConfig,
    encryption_key: Option<[u8; 32]>,
) -> anyhow::Result<std::sync::Arc<dyn CacheBackend>> {
    use std::sync::Arc;

    let base = select_base_backend(cfg).await?;
    let audited = audit::AuditedCache::new(base);
    let composed: Arc<dyn CacheBackend> = match encryption_key {
        Some(key) => Arc::new(encrypt::EncryptedCache::new(audited, &key)),
        None => Arc::new(audited),
    };
    Ok(composed)
}
