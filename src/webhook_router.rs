// =============================================================================
// Webhook / strategy router (C7)
// =============================================================================
//
// Each strategy instance exposes one opaque webhook id. An inbound POST is
// authenticated against that id (plus an HMAC over the body when a secret is
// configured), normalised from its TradingView- or Chartink-shaped payload,
// pushed through six ordered gate checks, and — if it survives all six —
// turned into an `OrderIntent` for `OrderRouter::place`. Every run is
// recorded as a `DecisionEnvelope` regardless of outcome.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveTime, Timelike, Weekday};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, instrument, warn};

use crate::active_trade::SharedActiveTradeStore;
use crate::broker::{OrderType, Side as BrokerSide};
use crate::cache::{json, namespace, CacheBackend};
use crate::decision_envelope::{DecisionEnvelope, GateVerdict};
use crate::error::EngineError;
use crate::exit::monitor::PortfolioRiskConfig;
use crate::order_router::{OrderIntent, OrderRouter, PlaceResult};
use crate::runtime_config::market_now;
use crate::symbols::SymbolResolver;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    Webhook,
    Chartink,
    Python,
    TradingView,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PositionSizing {
    FixedQty(f64),
    FixedValue(f64),
    Percent(f64),
}

impl PositionSizing {
    fn quantity(&self, allocated_funds: f64, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        match self {
            Self::FixedQty(q) => *q,
            Self::FixedValue(v) => (v / price).floor(),
            Self::Percent(p) => ((allocated_funds * p / 100.0) / price).floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySchedule {
    /// HH:MM, market timezone.
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub weekdays: Vec<u8>,
    pub square_off_time: Option<String>,
    pub intraday: bool,
}

impl StrategySchedule {
    fn weekday_allowed(&self, day: Weekday) -> bool {
        self.weekdays.is_empty() || self.weekdays.contains(&(day.num_days_from_monday() as u8))
    }

    fn within_window<Tz: chrono::TimeZone>(&self, now: chrono::DateTime<Tz>) -> bool {
        if !self.weekday_allowed(now.weekday()) {
            return false;
        }
        let parse = |s: &str| NaiveTime::parse_from_str(s, "%H:%M").ok();
        match (parse(&self.start), parse(&self.end)) {
            (Some(start), Some(end)) => {
                let t = now.time();
                t >= start && t <= end
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub id: String,
    pub user_id: String,
    pub kind: StrategyKind,
    pub schedule: StrategySchedule,
    pub allocated_funds: f64,
    pub position_sizing: PositionSizing,
    pub max_open_positions: u32,
    pub daily_loss_limit: f64,
    #[serde(default)]
    pub current_day_pnl: f64,
    pub portfolio_risk: Option<PortfolioRiskConfig>,
    pub webhook_id: String,
    pub webhook_secret: Option<String>,
    /// Scanner-style symbol map: keyword/alias -> (symbol, exchange).
    #[serde(default)]
    pub symbol_map: HashMap<String, (String, String)>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub panic: bool,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    pub product: String,
}

fn default_true() -> bool {
    true
}
fn default_dedup_window() -> u64 {
    60
}

/// A normalised signal once the TradingView/Chartink payload shape has been
/// collapsed to what the gate pipeline needs.
#[derive(Debug, Clone)]
struct NormalizedSignal {
    symbol: String,
    exchange: String,
    action: BrokerSide,
    price: Option<f64>,
    signal_timestamp: i64,
}

const SCANNER_KEYWORDS: [&str; 4] = ["BUY", "SELL", "SHORT", "COVER"];

fn parse_chartink(body: &serde_json::Value) -> anyhow::Result<Vec<NormalizedSignal>> {
    let scan_name = body
        .get("scan_name")
        .or_else(|| body.get("alert_name"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let upper = scan_name.to_uppercase();
    let hits: Vec<&str> = SCANNER_KEYWORDS.iter().filter(|k| upper.contains(*k)).copied().collect();
    if hits.len() != 1 {
        anyhow::bail!("scanner alert name must contain exactly one of BUY/SELL/SHORT/COVER, found {}", hits.len());
    }
    let action = match hits[0] {
        "BUY" | "COVER" => BrokerSide::Buy,
        _ => BrokerSide::Sell,
    };

    let stocks = body
        .get("stocks")
        .and_then(|v| v.as_str())
        .map(|s| s.split(',').map(|t| t.trim().to_string()).collect::<Vec<_>>())
        .unwrap_or_default();
    let trigger_prices: Vec<f64> = body
        .get("trigger_prices")
        .and_then(|v| v.as_str())
        .map(|s| s.split(',').filter_map(|t| t.trim().parse().ok()).collect())
        .unwrap_or_default();

    let now = chrono::Utc::now().timestamp();
    Ok(stocks
        .into_iter()
        .enumerate()
        .map(|(i, symbol)| NormalizedSignal {
            symbol,
            exchange: "NSE".to_string(),
            action,
            price: trigger_prices.get(i).copied(),
            signal_timestamp: now,
        })
        .collect())
}

fn parse_tradingview(body: &serde_json::Value) -> anyhow::Result<NormalizedSignal> {
    let symbol = body
        .get("symbol")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing 'symbol'"))?
        .to_string();
    let exchange = body
        .get("exchange")
        .and_then(|v| v.as_str())
        .unwrap_or("NSE")
        .to_string();
    let action_str = body
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing 'action'"))?
        .to_uppercase();
    let action = match action_str.as_str() {
        "BUY" | "COVER" => BrokerSide::Buy,
        "SELL" | "SHORT" => BrokerSide::Sell,
        other => anyhow::bail!("unrecognised action: {other}"),
    };
    let price = body.get("price").and_then(|v| v.as_f64());
    let signal_timestamp = body.get("timestamp").and_then(|v| v.as_i64()).unwrap_or_else(|| chrono::Utc::now().timestamp());

    Ok(NormalizedSignal { symbol, exchange, action, price, signal_timestamp })
}

fn verify_hmac(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    expected.eq_ignore_ascii_case(signature_hex)
}

pub struct StrategyRouter {
    strategies: RwLock<HashMap<String, StrategyInstance>>,
    webhook_index: RwLock<HashMap<String, String>>,
    cache: Arc<dyn CacheBackend>,
    order_router: Arc<OrderRouter>,
    symbols: Arc<SymbolResolver>,
    active_trades: SharedActiveTradeStore,
    /// LTP cache fed by whatever component tracks recent ticks (trade
    /// monitor, sandbox engine); used only as a fallback when the inbound
    /// payload carries no price.
    ltp_cache: RwLock<HashMap<String, f64>>,
    seen_signals: Mutex<HashMap<String, Instant>>,
    global_panic: std::sync::atomic::AtomicBool,
    market_timezone: String,
}

impl StrategyRouter {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        order_router: Arc<OrderRouter>,
        symbols: Arc<SymbolResolver>,
        active_trades: SharedActiveTradeStore,
        market_timezone: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            strategies: RwLock::new(HashMap::new()),
            webhook_index: RwLock::new(HashMap::new()),
            cache,
            order_router,
            symbols,
            active_trades,
            ltp_cache: RwLock::new(HashMap::new()),
            seen_signals: Mutex::new(HashMap::new()),
            global_panic: std::sync::atomic::AtomicBool::new(false),
            market_timezone,
        })
    }

    pub fn set_global_panic(&self, value: bool) {
        self.global_panic.store(value, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn note_ltp(&self, symbol: &str, exchange: &str, ltp: f64) {
        self.ltp_cache.write().insert(format!("{symbol}.{exchange}"), ltp);
    }

    /// Portfolio-risk config for a strategy, if it carries one — the trade
    /// monitor looks this up per strategy rather than holding its own copy.
    pub fn portfolio_risk(&self, strategy_id: &str) -> Option<PortfolioRiskConfig> {
        self.strategies.read().get(strategy_id).and_then(|s| s.portfolio_risk)
    }

    pub fn list_strategies(&self, user_id: &str) -> Vec<StrategyInstance> {
        self.strategies.read().values().filter(|s| s.user_id == user_id).cloned().collect()
    }

    pub fn get_strategy(&self, strategy_id: &str) -> Option<StrategyInstance> {
        self.strategies.read().get(strategy_id).cloned()
    }

    pub async fn register_strategy(&self, strategy: StrategyInstance) -> anyhow::Result<()> {
        self.webhook_index.write().insert(strategy.webhook_id.clone(), strategy.id.clone());
        json::set(self.cache.as_ref(), namespace::STRATEGIES, &strategy.id, &strategy, None).await?;
        self.strategies.write().insert(strategy.id.clone(), strategy);
        self.persist_index().await?;
        Ok(())
    }

    pub async fn load_all(&self) -> anyhow::Result<()> {
        // Strategy ids are unknown ahead of time; the index namespace stores
        // them under the same key shape `active_trades` uses — a single
        // `__index__` record listing ids persisted alongside each strategy.
        let ids: Vec<String> = json::get(self.cache.as_ref(), namespace::STRATEGIES, "__index__")
            .await?
            .unwrap_or_default();
        for id in ids {
            if let Some(s) = json::get::<StrategyInstance>(self.cache.as_ref(), namespace::STRATEGIES, &id).await? {
                self.webhook_index.write().insert(s.webhook_id.clone(), s.id.clone());
                self.strategies.write().insert(s.id.clone(), s);
            }
        }
        Ok(())
    }

    async fn persist_index(&self) -> anyhow::Result<()> {
        let ids: Vec<String> = self.strategies.read().keys().cloned().collect();
        json::set(self.cache.as_ref(), namespace::STRATEGIES, "__index__", &ids, None).await
    }

    /// Flip `active`/`panic` on an existing strategy and persist the change.
    pub async fn set_strategy_state(
        &self,
        strategy_id: &str,
        active: Option<bool>,
        panic: Option<bool>,
    ) -> anyhow::Result<Option<StrategyInstance>> {
        let updated = {
            let mut strategies = self.strategies.write();
            let Some(s) = strategies.get_mut(strategy_id) else {
                return Ok(None);
            };
            if let Some(a) = active {
                s.active = a;
            }
            if let Some(p) = panic {
                s.panic = p;
            }
            s.clone()
        };
        json::set(self.cache.as_ref(), namespace::STRATEGIES, strategy_id, &updated, None).await?;
        Ok(Some(updated))
    }

    /// Remove a strategy entirely; persists the updated index.
    pub async fn delete_strategy(&self, strategy_id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut strategies = self.strategies.write();
            strategies.remove(strategy_id)
        };
        let Some(removed) = removed else {
            return Ok(false);
        };
        self.webhook_index.write().remove(&removed.webhook_id);
        self.cache.delete(namespace::STRATEGIES, strategy_id).await?;
        self.persist_index().await?;
        Ok(true)
    }

    /// Inbound POST handler: `webhook_id` from the URL path, `signature`
    /// from an `X-Signature` header (hex HMAC-SHA256 of the raw body), `body`
    /// the raw request bytes.
    #[instrument(skip(self, body), fields(webhook_id))]
    pub async fn handle_webhook(
        &self,
        webhook_id: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> anyhow::Result<Vec<Result<PlaceResult, EngineError>>> {
        let strategy_id = self
            .webhook_index
            .read()
            .get(webhook_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown webhook id"))?;

        let strategy = self
            .strategies
            .read()
            .get(&strategy_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("strategy not found"))?;

        if let Some(secret) = &strategy.webhook_secret {
            let sig = signature.ok_or_else(|| anyhow::anyhow!("missing signature"))?;
            if !verify_hmac(secret, body, sig) {
                anyhow::bail!("signature mismatch");
            }
        }

        let payload: serde_json::Value = serde_json::from_slice(body)?;
        let signals = if payload.get("scan_name").is_some() || payload.get("stocks").is_some() {
            parse_chartink(&payload)?
        } else {
            vec![parse_tradingview(&payload)?]
        };

        let mut results = Vec::with_capacity(signals.len());
        for signal in signals {
            results.push(self.process_signal(&strategy_id, signal).await);
        }
        Ok(results)
    }

    async fn process_signal(
        &self,
        strategy_id: &str,
        signal: NormalizedSignal,
    ) -> Result<PlaceResult, EngineError> {
        let strategy = self
            .strategies
            .read()
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidParameters("unknown strategy".into()))?;

        let side_str = signal.action.to_string();
        let mut gates = Vec::new();

        // Gate 1: active + panic.
        if !strategy.active || strategy.panic || self.global_panic.load(std::sync::atomic::Ordering::SeqCst) {
            gates.push(GateVerdict::fail("active_and_not_panicked", "strategy inactive or panicked"));
            self.log_blocked(&strategy, &signal, gates, "active_and_not_panicked", "strategy inactive or panicked");
            return Err(EngineError::RiskRejected("strategy inactive or panicked".into()));
        }
        gates.push(GateVerdict::pass("active_and_not_panicked"));

        // Gate 2: schedule window (intraday only).
        if strategy.schedule.intraday && !strategy.schedule.within_window(market_now(&self.market_timezone)) {
            gates.push(GateVerdict::fail("schedule_window", "outside strategy trading window"));
            self.log_blocked(&strategy, &signal, gates, "schedule_window", "outside trading window");
            return Err(EngineError::RiskRejected("outside strategy trading window".into()));
        }
        gates.push(GateVerdict::pass("schedule_window"));

        // Gate 3: symbol resolution.
        let (broker_symbol, exchange) = if let Some((sym, exch)) = strategy.symbol_map.get(&signal.symbol).cloned() {
            (sym, exch)
        } else {
            match self.symbols.resolve(&signal.symbol, &signal.exchange) {
                Some(rec) => (rec.broker_symbol, rec.exchange),
                None => {
                    gates.push(GateVerdict::fail("symbol_resolution", "symbol not resolvable"));
                    self.log_blocked(&strategy, &signal, gates, "symbol_resolution", "symbol not resolvable");
                    return Err(crate::symbols::lookup_miss(&signal.symbol, &signal.exchange));
                }
            }
        };
        gates.push(GateVerdict::pass("symbol_resolution"));

        // Gate 4: duplicate suppression.
        let dedup_bucket = signal.signal_timestamp / strategy.dedup_window_secs.max(1) as i64;
        let dedup_key = format!("{strategy_id}:{}:{}:{}", signal.symbol, side_str, dedup_bucket);
        {
            let mut seen = self.seen_signals.lock();
            seen.retain(|_, at| at.elapsed() < Duration::from_secs(strategy.dedup_window_secs.max(1) * 10));
            if seen.contains_key(&dedup_key) {
                gates.push(GateVerdict::fail("duplicate_suppression", "duplicate signal within dedup window"));
                self.log_blocked(&strategy, &signal, gates, "duplicate_suppression", "duplicate signal");
                return Err(EngineError::DuplicateOrder);
            }
            seen.insert(dedup_key, Instant::now());
        }
        gates.push(GateVerdict::pass("duplicate_suppression"));

        // Gate 5: position sizing + risk limits.
        let price = signal.price.or_else(|| self.ltp_cache.read().get(&format!("{}.{}", signal.symbol, exchange)).copied());
        let price = match price {
            Some(p) if p > 0.0 => p,
            _ => {
                gates.push(GateVerdict::fail("position_sizing", "no price available for sizing"));
                self.log_blocked(&strategy, &signal, gates, "position_sizing", "no price available");
                return Err(EngineError::InvalidParameters("no price available for sizing".into()));
            }
        };
        if strategy.current_day_pnl <= -strategy.daily_loss_limit.abs() {
            gates.push(GateVerdict::fail("position_sizing", "daily loss limit breached"));
            self.log_blocked(&strategy, &signal, gates, "position_sizing", "daily loss limit breached");
            return Err(EngineError::RiskRejected("daily loss limit breached".into()));
        }
        if strategy.max_open_positions > 0 {
            let open = self.active_trades.for_strategy_active(strategy_id).len() as u32;
            if open >= strategy.max_open_positions {
                gates.push(GateVerdict::fail("position_sizing", "max open positions reached"));
                self.log_blocked(&strategy, &signal, gates, "position_sizing", "max open positions reached");
                return Err(EngineError::RiskRejected("max open positions reached".into()));
            }
        }
        let qty = strategy.position_sizing.quantity(strategy.allocated_funds, price);
        if qty <= 0.0 {
            gates.push(GateVerdict::fail("position_sizing", "computed quantity is zero"));
            self.log_blocked(&strategy, &signal, gates, "position_sizing", "computed quantity is zero");
            return Err(EngineError::InvalidParameters("computed order quantity is zero".into()));
        }
        gates.push(GateVerdict::pass("position_sizing"));

        // Gate 6 (square-off) runs out-of-band on a timer — see
        // `run_square_off_loop` — not on the inbound signal path.
        gates.push(GateVerdict::pass("square_off_not_applicable"));

        let envelope = DecisionEnvelope::allow(strategy_id, &signal.symbol, &side_str, gates);
        info!(decision_id = %envelope.id, strategy_id, symbol = %signal.symbol, "signal passed all gates");

        let intent = OrderIntent {
            user_id: strategy.user_id.clone(),
            broker_symbol,
            symbol: signal.symbol.clone(),
            exchange,
            product: strategy.product.clone(),
            side: signal.action,
            order_type: OrderType::Market,
            quantity: qty,
            price: None,
            trigger_price: None,
            strategy: Some(strategy_id.to_string()),
            client_order_id: None,
        };

        self.order_router.place(intent).await.map_err(|e| EngineError::UpstreamError(e.to_string()))
    }

    fn log_blocked(
        &self,
        strategy: &StrategyInstance,
        signal: &NormalizedSignal,
        gates: Vec<GateVerdict>,
        blocking_gate: &str,
        reason: &str,
    ) {
        let envelope = DecisionEnvelope::blocked(&strategy.id, &signal.symbol, signal.action.to_string(), gates, blocking_gate, reason);
        warn!(decision_id = %envelope.id, strategy_id = %strategy.id, blocking_gate, reason, "signal rejected at gate");
    }

    /// Gate 6: at each intraday strategy's configured square-off minute,
    /// before any new signal is processed in that minute, close every MIS
    /// position attributable to it and cancel its pending orders.
    pub async fn run_square_off_loop(self: Arc<Self>) {
        let mut last_fired: HashMap<String, (u32, u32, u32)> = HashMap::new();
        let mut interval = tokio::time::interval(Duration::from_secs(20));
        loop {
            interval.tick().await;
            let now = market_now(&self.market_timezone);
            let now_key = (now.hour(), now.minute(), now.day());
            let strategies: Vec<StrategyInstance> = self.strategies.read().values().cloned().collect();
            for strategy in strategies {
                if !strategy.schedule.intraday {
                    continue;
                }
                let Some(hhmm) = &strategy.schedule.square_off_time else { continue };
                let matches = NaiveTime::parse_from_str(hhmm, "%H:%M")
                    .map(|t| t.hour() == now.hour() && t.minute() == now.minute())
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
                let marker = strategy.id.clone();
                if last_fired.get(&marker) == Some(&now_key) {
                    continue;
                }
                last_fired.insert(marker, now_key);

                for trade in self.active_trades.for_strategy_active(&strategy.id) {
                    if trade.product != "MIS" || trade.quantity == 0.0 {
                        continue;
                    }
                    let net_qty = match trade.side {
                        crate::active_trade::Side::Long => trade.quantity,
                        crate::active_trade::Side::Short => -trade.quantity,
                    };
                    match self
                        .order_router
                        .smart_close(
                            &strategy.user_id,
                            &trade.symbol,
                            &trade.broker_symbol,
                            &trade.exchange,
                            &trade.product,
                            net_qty,
                            "square_off",
                        )
                        .await
                    {
                        Ok(_) => info!(strategy_id = %strategy.id, symbol = %trade.symbol, "square-off: closed MIS position"),
                        Err(e) => warn!(strategy_id = %strategy.id, symbol = %trade.symbol, error = %e, "square-off: smart_close failed"),
                    }
                }

                match self.order_router.cancel_all(&strategy.user_id, None).await {
                    Ok(n) => info!(strategy_id = %strategy.id, cancelled = n, "square-off: cancelled pending orders"),
                    Err(e) => warn!(strategy_id = %strategy.id, error = %e, "square-off: cancel_all failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chartink_requires_exactly_one_keyword() {
        let ok = serde_json::json!({"scan_name": "Strong BUY setups", "stocks": "SBIN,TCS", "trigger_prices": "100,200"});
        assert!(parse_chartink(&ok).is_ok());

        let ambiguous = serde_json::json!({"scan_name": "BUY and SELL signals", "stocks": "SBIN"});
        assert!(parse_chartink(&ambiguous).is_err());

        let none = serde_json::json!({"scan_name": "momentum scan", "stocks": "SBIN"});
        assert!(parse_chartink(&none).is_err());
    }

    #[test]
    fn tradingview_parses_minimal_payload() {
        let body = serde_json::json!({"symbol": "RELIANCE", "exchange": "NSE", "action": "buy", "price": 2500.0});
        let sig = parse_tradingview(&body).unwrap();
        assert_eq!(sig.symbol, "RELIANCE");
        assert_eq!(sig.action, BrokerSide::Buy);
    }

    #[test]
    fn hmac_verification_round_trips() {
        let secret = "topsecret";
        let body = b"{\"symbol\":\"X\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_hmac(secret, body, &sig));
        assert!(!verify_hmac(secret, body, "deadbeef"));
    }

    #[test]
    fn position_sizing_variants() {
        assert_eq!(PositionSizing::FixedQty(10.0).quantity(0.0, 100.0), 10.0);
        assert_eq!(PositionSizing::FixedValue(1000.0).quantity(0.0, 100.0), 10.0);
        assert_eq!(PositionSizing::Percent(10.0).quantity(100_000.0, 100.0), 100.0);
    }
}
