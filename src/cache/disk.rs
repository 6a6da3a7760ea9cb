// =============================================================================
// On-disk cache backend — one JSON file per namespace, atomic tmp+rename
// =============================================================================
//
// Single-writer local store. Every write updates an in-memory mirror (for
// read performance) and schedules the namespace's file to be rewritten in
// full using the same atomic tmp+rename pattern as `RuntimeConfig::save`, so
// a crash mid-write never corrupts the file on disk.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{CacheBackend, CacheValue};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    /// Base64-encoded value bytes (JSON has no native byte-string type).
    value_b64: String,
    /// Unix epoch millis; `None` means no expiry.
    expires_at_ms: Option<u64>,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        match self.expires_at_ms {
            Some(exp) => now_ms() >= exp,
            None => false,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

type NamespaceTable = HashMap<String, StoredEntry>;

pub struct DiskBackend {
    dir: PathBuf,
    tables: RwLock<HashMap<String, NamespaceTable>>,
}

impl DiskBackend {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self {
            dir,
            tables: RwLock::new(HashMap::new()),
        })
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn load_namespace(&self, namespace: &str) -> Result<NamespaceTable> {
        let path = self.namespace_path(namespace);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache namespace {}", path.display()))?;
        let table: NamespaceTable = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse cache namespace {}", path.display()))?;
        Ok(table)
    }

    fn ensure_loaded(&self, namespace: &str) -> Result<()> {
        if self.tables.read().contains_key(namespace) {
            return Ok(());
        }
        let table = self.load_namespace(namespace)?;
        self.tables.write().insert(namespace.to_string(), table);
        Ok(())
    }

    fn persist_namespace(&self, namespace: &str) -> Result<()> {
        let path = self.namespace_path(namespace);
        let tmp_path = path.with_extension("json.tmp");
        let table = self.tables.read().get(namespace).cloned().unwrap_or_default();
        let content = serde_json::to_string_pretty(&table)
            .context("failed to serialise cache namespace")?;
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp cache file {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp cache file to {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<CacheValue> {
        self.ensure_loaded(namespace)?;
        let tables = self.tables.read();
        let Some(table) = tables.get(namespace) else {
            return Ok(None);
        };
        let Some(entry) = table.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            return Ok(None);
        }
        let bytes = base64_decode(&entry.value_b64)
            .context("corrupt cache entry: invalid base64")?;
        Ok(Some(bytes))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_loaded(namespace)?;
        let expires_at_ms = ttl
            .filter(|d| !d.is_zero())
            .map(|d| now_ms() + d.as_millis() as u64);
        {
            let mut tables = self.tables.write();
            let table = tables.entry(namespace.to_string()).or_default();
            table.insert(
                key.to_string(),
                StoredEntry {
                    value_b64: base64_encode(&value),
                    expires_at_ms,
                },
            );
        }
        self.persist_namespace(namespace)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.ensure_loaded(namespace)?;
        {
            let mut tables = self.tables.write();
            if let Some(table) = tables.get_mut(namespace) {
                table.remove(key);
            }
        }
        self.persist_namespace(namespace)
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        {
            let mut tables = self.tables.write();
            tables.insert(namespace.to_string(), HashMap::new());
        }
        self.persist_namespace(namespace)
    }

    async fn size(&self, namespace: &str) -> Result<usize> {
        self.ensure_loaded(namespace)?;
        Ok(self
            .tables
            .read()
            .get(namespace)
            .map(|t| t.len())
            .unwrap_or(0))
    }

    async fn flush(&self) -> Result<()> {
        let namespaces: Vec<String> = self.tables.read().keys().cloned().collect();
        for ns in namespaces {
            self.persist_namespace(&ns)?;
        }
        Ok(())
    }
}

pub(crate) fn base64_encode(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub(crate) fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.decode(s).context("invalid base64")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_through_disk() {
        let dir = tempdir();
        let backend = DiskBackend::new(&dir).unwrap();
        backend
            .set("symbols", "RELIANCE.NSE", b"payload".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(
            backend.get("symbols", "RELIANCE.NSE").await.unwrap(),
            Some(b"payload".to_vec())
        );
    }

    #[tokio::test]
    async fn survives_reload_from_a_fresh_handle() {
        let dir = tempdir();
        {
            let backend = DiskBackend::new(&dir).unwrap();
            backend.set("auth", "u1", b"tok".to_vec(), None).await.unwrap();
        }
        let backend2 = DiskBackend::new(&dir).unwrap();
        assert_eq!(backend2.get("auth", "u1").await.unwrap(), Some(b"tok".to_vec()));
    }

    #[test]
    fn base64_roundtrip() {
        let data = b"the quick brown fox \x00\x01\x02";
        let encoded = base64_encode(data);
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("aurora-cache-test-{}", uuid::Uuid::new_v4()));
        p
    }
}
