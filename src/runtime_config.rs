// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Aurora bridge. Every tunable parameter
// lives here so that the engine can be reconfigured at runtime without a
// restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["RELIANCE".to_string(), "INFY".to_string(), "TCS".to_string()]
}

fn default_max_concurrent_positions() -> u32 {
    20
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_trades_per_day() -> u32 {
    200
}

fn default_cache_backend() -> String {
    "auto".to_string()
}

fn default_memory_capacity() -> usize {
    50_000
}

fn default_disk_dir() -> String {
    "./data/cache".to_string()
}

fn default_market_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_forced_logout_time() -> String {
    "03:00".to_string()
}

fn default_rest_rate_limit_per_sec() -> u32 {
    50
}

fn default_order_dedup_window_secs() -> u64 {
    2
}

fn default_sandbox_starting_capital() -> f64 {
    10_000_000.0
}

fn default_sandbox_reset_weekday() -> String {
    "Sunday".to_string()
}

fn default_sandbox_reset_time() -> String {
    "00:00".to_string()
}

fn default_sandbox_square_off() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("NSE".to_string(), "15:15".to_string());
    m.insert("NFO".to_string(), "15:15".to_string());
    m.insert("MCX".to_string(), "23:30".to_string());
    m
}

fn default_alert_worker_pool_size() -> usize {
    10
}

// =============================================================================
// CacheConfig
// =============================================================================

/// Selects and configures the C1 cache backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// One of "memory", "disk", "distributed", or "auto".
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    /// Bounded-LRU capacity for the in-memory backend.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    /// Directory for the on-disk backend's namespace files.
    #[serde(default = "default_disk_dir")]
    pub disk_dir: String,
    /// Base URL of the distributed KV endpoint, empty if unconfigured.
    #[serde(default)]
    pub distributed_endpoint: String,
    /// Forces a distributed backend; startup fails if unreachable.
    #[serde(default)]
    pub multi_instance: bool,
    /// Path to the 32-byte key file used by the encryption wrapper over the
    /// `auth` / `api_keys` / `tokens` namespaces. Empty disables encryption
    /// (development only).
    #[serde(default)]
    pub encryption_key_path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            memory_capacity: default_memory_capacity(),
            disk_dir: default_disk_dir(),
            distributed_endpoint: String::new(),
            multi_instance: false,
            encryption_key_path: String::new(),
        }
    }
}

// =============================================================================
// SandboxConfig
// =============================================================================

/// Settings for the C6 sandbox execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_starting_capital")]
    pub starting_capital: f64,
    /// Auto square-off time (HH:MM, market timezone) keyed by exchange code.
    #[serde(default = "default_sandbox_square_off")]
    pub square_off_times: HashMap<String, String>,
    /// Weekday the weekly daily-reset runs on.
    #[serde(default = "default_sandbox_reset_weekday")]
    pub reset_weekday: String,
    /// Wall-clock time (HH:MM, market timezone) the reset runs at.
    #[serde(default = "default_sandbox_reset_time")]
    pub reset_time: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            starting_capital: default_sandbox_starting_capital(),
            square_off_times: default_sandbox_square_off(),
            reset_weekday: default_sandbox_reset_weekday(),
            reset_time: default_sandbox_reset_time(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Aurora bridge.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against real funds or simulated: Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Symbols & limits ---------------------------------------------------
    /// Default watch symbols for freshly created subscriptions.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Maximum number of concurrent open positions, per user.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    /// Maximum cumulative daily loss allowed as a percentage of allocated
    /// capital (e.g. 3.0 means 3 %).
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,

    /// Maximum consecutive losing trades before the circuit breaker trips.
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    /// Maximum total trades per day, per user.
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    // --- Cache ----------------------------------------------------------------
    #[serde(default)]
    pub cache: CacheConfig,

    // --- Market / scheduling ---------------------------------------------------
    /// IANA timezone used for schedule gates and forced-logout.
    #[serde(default = "default_market_timezone")]
    pub market_timezone: String,

    /// Wall-clock time (HH:MM, market timezone) at which C3 invalidates all
    /// positive auth cache entries across every instance.
    #[serde(default = "default_forced_logout_time")]
    pub forced_logout_time: String,

    /// Global REST rate limit, requests/second, enforced by the order
    /// router's token bucket.
    #[serde(default = "default_rest_rate_limit_per_sec")]
    pub rest_rate_limit_per_sec: u32,

    /// `place`/`smart_close` idempotency dedup window.
    #[serde(default = "default_order_dedup_window_secs")]
    pub order_dedup_window_secs: u64,

    /// Path to a JSON file mapping broker symbol to a per-leg freeze
    /// quantity; absent entries are treated as unlimited.
    #[serde(default)]
    pub freeze_quantity_table_path: String,

    /// Worker-pool size for C8's per-tick condition evaluation.
    #[serde(default = "default_alert_worker_pool_size")]
    pub alert_worker_pool_size: usize,

    // --- Sandbox ---------------------------------------------------------------
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            cache: CacheConfig::default(),
            market_timezone: default_market_timezone(),
            forced_logout_time: default_forced_logout_time(),
            rest_rate_limit_per_sec: default_rest_rate_limit_per_sec(),
            order_dedup_window_secs: default_order_dedup_window_secs(),
            freeze_quantity_table_path: String::new(),
            alert_worker_pool_size: default_alert_worker_pool_size(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            cache_backend = %config.cache.backend,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

/// Current time in the configured market timezone (e.g. `"Asia/Kolkata"`).
/// All schedule/forced-logout/square-off gating must go through this instead
/// of `Utc::now()`/`Local::now()`, which reflect the server's own clock, not
/// the market's. Falls back to UTC (with a warning) if the configured zone
/// name doesn't parse.
pub fn market_now(market_timezone: &str) -> chrono::DateTime<chrono_tz::Tz> {
    match market_timezone.parse::<chrono_tz::Tz>() {
        Ok(tz) => chrono::Utc::now().with_timezone(&tz),
        Err(_) => {
            tracing::warn!(market_timezone, "unrecognised market timezone, falling back to UTC");
            chrono::Utc::now().with_timezone(&chrono_tz::UTC)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.max_concurrent_positions, 20);
        assert_eq!(cfg.cache.backend, "auto");
        assert_eq!(cfg.market_timezone, "Asia/Kolkata");
        assert!(cfg.sandbox.square_off_times.contains_key("NSE"));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.rest_rate_limit_per_sec, 50);
        assert_eq!(cfg.order_dedup_window_secs, 2);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "cache": { "backend": "memory" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.cache.backend, "memory");
        assert_eq!(cfg.cache.memory_capacity, default_memory_capacity());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.sandbox.starting_capital, cfg2.sandbox.starting_capital);
    }
}
