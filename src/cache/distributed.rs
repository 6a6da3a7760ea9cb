// =============================================================================
// Distributed cache backend — remote KV store over HTTP
// =============================================================================
//
// Used when `multi_instance` deployments require all engine instances to
// observe the same cache. Keys are namespaced `openalgo:<namespace>:<key>`
// per the persisted-state layout. The wire format mirrors the
// signed-request style already used by `binance::client::BinanceClient`:
// a small `reqwest::Client`, explicit timeouts, structured `#[instrument]`
// logging.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{CacheBackend, CacheValue};

pub struct DistributedBackend {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PutRequest {
    value_b64: String,
    ttl_ms: Option<u64>,
}

#[derive(Deserialize)]
struct GetResponse {
    value_b64: Option<String>,
}

#[derive(Deserialize)]
struct SizeResponse {
    size: usize,
}

impl DistributedBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("failed to build distributed cache HTTP client"),
        }
    }

    fn remote_key(namespace: &str, key: &str) -> String {
        format!("openalgo:{namespace}:{key}")
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self, timeout: Duration) -> Result<()> {
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .context("distributed cache health check failed")?
            .error_for_status()
            .context("distributed cache health check returned an error status")?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for DistributedBackend {
    #[instrument(skip(self))]
    async fn get(&self, namespace: &str, key: &str) -> Result<CacheValue> {
        let remote_key = Self::remote_key(namespace, key);
        let resp = self
            .client
            .get(format!("{}/kv/{}", self.base_url, remote_key))
            .send()
            .await
            .context("distributed cache get failed")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: GetResponse = resp
            .error_for_status()
            .context("distributed cache get returned an error status")?
            .json()
            .await
            .context("distributed cache get returned malformed JSON")?;

        match body.value_b64 {
            Some(b64) => {
                let bytes = super::disk::base64_decode(&b64)?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, value))]
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let remote_key = Self::remote_key(namespace, key);
        let req = PutRequest {
            value_b64: super::disk::base64_encode(&value),
            ttl_ms: ttl.filter(|d| !d.is_zero()).map(|d| d.as_millis() as u64),
        };
        self.client
            .put(format!("{}/kv/{}", self.base_url, remote_key))
            .json(&req)
            .send()
            .await
            .context("distributed cache set failed")?
            .error_for_status()
            .context("distributed cache set returned an error status")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let remote_key = Self::remote_key(namespace, key);
        let resp = self
            .client
            .delete(format!("{}/kv/{}", self.base_url, remote_key))
            .send()
            .await
            .context("distributed cache delete failed")?;
        if resp.status() != reqwest::StatusCode::NOT_FOUND {
            resp.error_for_status()
                .context("distributed cache delete returned an error status")?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self, namespace: &str) -> Result<()> {
        self.client
            .delete(format!("{}/ns/openalgo:{}", self.base_url, namespace))
            .send()
            .await
            .context("distributed cache clear failed")?
            .error_for_status()
            .context("distributed cache clear returned an error status")?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn size(&self, namespace: &str) -> Result<usize> {
        let body: SizeResponse = self
            .client
            .get(format!("{}/ns/openalgo:{}/size", self.base_url, namespace))
            .send()
            .await
            .context("distributed cache size failed")?
            .error_for_status()
            .context("distributed cache size returned an error status")?
            .json()
            .await
            .context("distributed cache size returned malformed JSON")?;
        Ok(body.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_key_uses_openalgo_prefix() {
        assert_eq!(
            DistributedBackend::remote_key("auth", "user-1"),
            "openalgo:auth:user-1"
        );
    }
}
