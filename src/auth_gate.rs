// =============================================================================
// Auth & API-key gate (C3)
// =============================================================================
//
// Validates API keys per request; maps key -> user, broker, and broker-level
// credentials. Two C1-backed caches bound the cost of probing: a positive
// cache (api-key -> context, long TTL, capped by the daily forced-logout
// time) and a negative cache (invalid-key -> rejection, short TTL).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::cache::{namespace, CacheBackend};
use crate::error::EngineError;
use crate::runtime_config::market_now;

/// Result of a successful `validate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub active_broker: String,
    /// Opaque to the engine — whatever the broker client needs.
    pub broker_credentials: String,
    pub granted_at: String,
}

const POSITIVE_TTL: Duration = Duration::from_secs(12 * 3600);
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// O(1) validation gate backed by the cache, with daily forced expiry.
pub struct AuthGate {
    cache: Arc<dyn CacheBackend>,
}

fn hash_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

impl AuthGate {
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self { cache }
    }

    /// Register (or replace) a user's derived API key with its context.
    /// Normally called from user/account administration (out of scope here);
    /// exposed so the engine can seed/rotate keys without a second store.
    pub async fn register(&self, api_key: &str, ctx: &AuthContext) -> anyhow::Result<()> {
        let key_hash = hash_key(api_key);
        crate::cache::json::set(
            self.cache.as_ref(),
            namespace::API_KEYS,
            &key_hash,
            ctx,
            Some(POSITIVE_TTL),
        )
        .await?;
        // A freshly registered key can't also be in the negative cache.
        self.cache.delete(namespace::API_KEYS, &format!("neg:{key_hash}")).await?;
        Ok(())
    }

    /// O(1) validation via the positive/negative cache pair.
    pub async fn validate(&self, api_key: &str) -> anyhow::Result<Result<AuthContext, EngineError>> {
        let key_hash = hash_key(api_key);

        if self
            .cache
            .exists(namespace::API_KEYS, &format!("neg:{key_hash}"))
            .await?
        {
            return Ok(Err(EngineError::InvalidApiKey));
        }

        match crate::cache::json::get::<AuthContext>(self.cache.as_ref(), namespace::API_KEYS, &key_hash)
            .await?
        {
            Some(ctx) => Ok(Ok(ctx)),
            None => {
                self.cache
                    .set(
                        namespace::API_KEYS,
                        &format!("neg:{key_hash}"),
                        Vec::new(),
                        Some(NEGATIVE_TTL),
                    )
                    .await?;
                Ok(Err(EngineError::InvalidApiKey))
            }
        }
    }

    /// Invalidate a single user's positive cache entry (manual logout / key
    /// rotation).
    pub async fn invalidate(&self, api_key: &str) -> anyhow::Result<()> {
        let key_hash = hash_key(api_key);
        self.cache.delete(namespace::API_KEYS, &key_hash).await
    }

    /// Force-expire every positive cache entry (daily logout). In a
    /// single-instance deployment this simply clears the namespace; in
    /// multi-instance mode each instance runs this against the same
    /// distributed backend so the effect is global.
    pub async fn expire_all(&self) -> anyhow::Result<()> {
        self.cache.clear(namespace::API_KEYS).await?;
        info!("auth gate: forced daily logout — all positive cache entries invalidated");
        Ok(())
    }

    /// Whether `now` (in the market timezone) has just crossed
    /// `forced_logout_time` (HH:MM). Intended to be polled once a minute by
    /// the forced-logout background loop; `last_checked_minute` lets the
    /// caller avoid firing twice within the same minute.
    pub fn is_forced_logout_minute(forced_logout_time: &str, now: chrono::NaiveTime) -> bool {
        let Ok(target) = NaiveTime::parse_from_str(forced_logout_time, "%H:%M") else {
            return false;
        };
        now.hour() == target.hour() && now.minute() == target.minute()
    }
}

/// Background loop: once a minute, check whether the configured
/// forced-logout wall-clock time has just ticked over and if so expire all
/// positive auth cache entries. Follows the base engine's
/// `loop { ...; sleep(...).await }` idiom for long-running background
/// workers.
pub async fn run_forced_logout_loop(gate: Arc<AuthGate>, forced_logout_time: String, market_timezone: String) {
    let mut last_fired_minute: Option<(u32, u32)> = None;
    loop {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let now = market_now(&market_timezone).time();
        if AuthGate::is_forced_logout_minute(&forced_logout_time, now) {
            let marker = (now.hour(), now.minute());
            if last_fired_minute != Some(marker) {
                if let Err(e) = gate.expire_all().await {
                    tracing::error!(error = %e, "forced logout sweep failed");
                }
                last_fired_minute = Some(marker);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryBackend;
    use chrono::Utc;

    fn gate() -> AuthGate {
        AuthGate::new(Arc::new(MemoryBackend::new(100)))
    }

    #[tokio::test]
    async fn unknown_key_is_rejected_and_cached_negatively() {
        let gate = gate();
        let result = gate.validate("nope").await.unwrap();
        assert!(matches!(result, Err(EngineError::InvalidApiKey)));
    }

    #[tokio::test]
    async fn registered_key_validates() {
        let gate = gate();
        let ctx = AuthContext {
            user_id: "u1".to_string(),
            active_broker: "binance".to_string(),
            broker_credentials: "opaque".to_string(),
            granted_at: Utc::now().to_rfc3339(),
        };
        gate.register("my-key", &ctx).await.unwrap();
        let result = gate.validate("my-key").await.unwrap();
        assert_eq!(result.unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn expire_all_forces_relookup() {
        let gate = gate();
        let ctx = AuthContext {
            user_id: "u1".to_string(),
            active_broker: "binance".to_string(),
            broker_credentials: "opaque".to_string(),
            granted_at: Utc::now().to_rfc3339(),
        };
        gate.register("my-key", &ctx).await.unwrap();
        gate.expire_all().await.unwrap();
        let result = gate.validate("my-key").await.unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn forced_logout_minute_matches_hh_mm() {
        let t = NaiveTime::from_hms_opt(3, 0, 17).unwrap();
        assert!(AuthGate::is_forced_logout_minute("03:00", t));
        assert!(!AuthGate::is_forced_logout_minute("03:01", t));
    }
}
