// =============================================================================
// Shared application state — wires the nine engine components together
// =============================================================================
//
// Every background loop and every REST handler reaches the rest of the
// engine through this struct. Construction order matters: the cache comes
// first (everything else persists through it), then the pieces with no
// cross-dependencies (symbols, auth gate, hub), then the order router (needs
// a broker-selection closure), then the two things that place orders through
// it (sandbox already built, strategy router, alert engine), and finally the
// trade monitor, which needs to look portfolio risk up from strategies.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::active_trade::{ActiveTradeStore, SharedActiveTradeStore};
use crate::alerts::AlertEngine;
use crate::auth_gate::AuthGate;
use crate::binance::client::BinanceClient;
use crate::broker::Broker;
use crate::cache::{build_cache, CacheBackend};
use crate::error::EngineError;
use crate::exit::monitor::{PortfolioLookup, TradeMonitor};
use crate::market_data::hub::MarketDataHub;
use crate::order_router::{FreezeQuantityTable, OrderRouter};
use crate::runtime_config::RuntimeConfig;
use crate::sandbox::{SandboxBroker, SandboxEngine};
use crate::symbols::SymbolResolver;
use crate::types::{AccountMode, TradingMode};
use crate::webhook_router::StrategyRouter;

const MARKET_DATA_CHANNEL_CAPACITY: usize = 256;

/// A record of an operational error surfaced through `/api/v1/health`-style
/// diagnostics. Deliberately small and bounded; it is not an audit log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub code: String,
    pub message: String,
}

pub struct AppState {
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub cache: Arc<dyn CacheBackend>,
    pub symbols: Arc<SymbolResolver>,
    pub auth_gate: Arc<AuthGate>,
    pub market_data_hub: Arc<MarketDataHub>,
    pub order_router: Arc<OrderRouter>,
    pub sandbox: Arc<SandboxEngine>,
    pub strategy_router: Arc<StrategyRouter>,
    pub alert_engine: Arc<AlertEngine>,
    pub active_trades: SharedActiveTradeStore,
    pub trade_monitor: Arc<TradeMonitor>,
    pub binance: Arc<BinanceClient>,
    pub trading_mode: RwLock<TradingMode>,
    pub start_time: Instant,
    state_version: AtomicU64,
    recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl AppState {
    /// Construct the full engine graph. Async because building the cache may
    /// ping a distributed backend's health endpoint.
    pub async fn new(config: RuntimeConfig, binance: BinanceClient) -> anyhow::Result<Arc<Self>> {
        let encryption_key = load_encryption_key(&config.cache.encryption_key_path)?;
        let cache = build_cache(&config.cache, encryption_key).await?;

        let symbols = Arc::new(SymbolResolver::new());
        let auth_gate = Arc::new(AuthGate::new(cache.clone()));
        let market_data_hub = Arc::new(MarketDataHub::new(MARKET_DATA_CHANNEL_CAPACITY));
        let binance = Arc::new(binance);
        let sandbox = SandboxEngine::new(
            cache.clone(),
            market_data_hub.clone(),
            config.sandbox.clone(),
            config.market_timezone.clone(),
        );

        let freeze_table = match load_freeze_quantity_table(&config.freeze_quantity_table_path) {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "no freeze-quantity table loaded, orders will never be split into legs");
                FreezeQuantityTable::from_map(HashMap::new())
            }
        };

        let account_mode = config.account_mode;
        let sandbox_for_router = sandbox.clone();
        let binance_for_router = binance.clone();
        let broker_for_user: Arc<dyn Fn(&str) -> Arc<dyn Broker> + Send + Sync> =
            Arc::new(move |_user_id: &str| -> Arc<dyn Broker> {
                match account_mode {
                    AccountMode::Demo => Arc::new(SandboxBroker {
                        user_id: "default".to_string(),
                        product: "MIS".to_string(),
                        engine: sandbox_for_router.clone(),
                    }) as Arc<dyn Broker>,
                    AccountMode::Live => binance_for_router.clone() as Arc<dyn Broker>,
                }
            });

        let order_router = Arc::new(OrderRouter::new(
            broker_for_user,
            cache.clone(),
            freeze_table,
            Duration::from_secs(config.order_dedup_window_secs),
        ));

        let active_trades: SharedActiveTradeStore = Arc::new(ActiveTradeStore::new());

        let strategy_router = StrategyRouter::new(
            cache.clone(),
            order_router.clone(),
            symbols.clone(),
            active_trades.clone(),
            config.market_timezone.clone(),
        );
        let alert_engine = AlertEngine::new(
            cache.clone(),
            market_data_hub.clone(),
            order_router.clone(),
            config.alert_worker_pool_size,
            config.market_timezone.clone(),
        );

        let portfolio_strategy_router = strategy_router.clone();
        let portfolio_lookup: PortfolioLookup =
            Arc::new(move |strategy_id: &str| portfolio_strategy_router.portfolio_risk(strategy_id));

        let trade_monitor = TradeMonitor::new(
            active_trades.clone(),
            market_data_hub.clone(),
            cache.clone(),
            order_router.clone(),
            portfolio_lookup,
        );

        Ok(Arc::new(Self {
            runtime_config: Arc::new(RwLock::new(config)),
            cache,
            symbols,
            auth_gate,
            market_data_hub,
            order_router,
            sandbox,
            strategy_router,
            alert_engine,
            active_trades,
            trade_monitor,
            binance,
            trading_mode: RwLock::new(TradingMode::Paused),
            start_time: Instant::now(),
            state_version: AtomicU64::new(0),
            recent_errors: RwLock::new(Vec::new()),
        }))
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn push_error(&self, err: &EngineError) {
        let record = ErrorRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            code: err.code().to_string(),
            message: err.to_string(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        if errors.len() > 200 {
            let overflow = errors.len() - 200;
            errors.drain(0..overflow);
        }
        self.increment_version();
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Load a 32-byte AES-256-GCM key from disk. Accepts either a raw 32-byte
/// file or a 64-character hex string; returns `None` if no path is configured.
fn load_encryption_key(path: &str) -> anyhow::Result<Option<[u8; 32]>> {
    if path.is_empty() {
        return Ok(None);
    }
    let raw = std::fs::read(path)?;
    let bytes = if raw.len() == 64 {
        hex::decode(String::from_utf8_lossy(&raw).trim())?
    } else {
        raw
    };
    if bytes.len() != 32 {
        anyhow::bail!("encryption key at {path} is not 32 bytes (got {})", bytes.len());
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    info!(path, "cache encryption key loaded");
    Ok(Some(key))
}

/// Load the freeze-quantity table: a JSON object mapping broker symbol to a
/// maximum per-leg order quantity.
fn load_freeze_quantity_table(path: &str) -> anyhow::Result<FreezeQuantityTable> {
    if path.is_empty() {
        anyhow::bail!("no freeze_quantity_table_path configured");
    }
    let raw = std::fs::read_to_string(path)?;
    let map: HashMap<String, u32> = serde_json::from_str(&raw)?;
    Ok(FreezeQuantityTable::from_map(map))
}
