// =============================================================================
// Sandbox execution engine (C6) — per-user virtual order book
// =============================================================================
//
// Every field the live broker would report (funds, margin, positions, order
// history) is simulated here against real ticks from the market-data hub, so
// a strategy can be pointed at this engine instead of `BinanceClient` without
// any call-site change — it implements the same `Broker` trait via
// `SandboxBroker`, following the pattern `OrderRouter` already uses to stay
// agnostic of the concrete execution target.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Timelike, Weekday};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, OrderAck, OrderRequest, OrderType, Side};
use crate::cache::{json, namespace, CacheBackend};
use crate::market_data::hub::{MarketDataHub, Mode};
use crate::runtime_config::{market_now, SandboxConfig};

pub const ORDER_ID_PREFIX: &str = "SB-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualOrderStatus {
    Open,
    Complete,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualOrder {
    pub id: String,
    pub symbol: String,
    pub exchange: String,
    pub product: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub status: VirtualOrderStatus,
    pub avg_fill_price: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualPosition {
    pub symbol: String,
    pub exchange: String,
    pub product: String,
    pub net_qty: f64,
    pub avg_price: f64,
    pub realized_pnl: f64,
}

impl VirtualPosition {
    fn key(symbol: &str, exchange: &str, product: &str) -> String {
        format!("{symbol}.{exchange}.{product}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBook {
    pub funds: f64,
    pub used_margin: f64,
    pub positions: HashMap<String, VirtualPosition>,
    pub orders: HashMap<String, VirtualOrder>,
}

impl UserBook {
    fn new(starting_capital: f64) -> Self {
        Self {
            funds: starting_capital,
            used_margin: 0.0,
            positions: HashMap::new(),
            orders: HashMap::new(),
        }
    }
}

/// Fixed leverage applied to equity MIS notional. Not exposed in
/// `SandboxConfig` because it mirrors a broker-side constant, not an
/// operator-tunable knob.
const EQUITY_MIS_LEVERAGE: f64 = 5.0;
/// Percentage of notional used when a broker-supplied lot margin is absent
/// for F&O NRML.
const FNO_NRML_MARGIN_PCT: f64 = 0.20;

fn margin_for(product: &str, notional: f64, lot_margin: Option<f64>) -> f64 {
    match product {
        "MIS" => notional / EQUITY_MIS_LEVERAGE,
        "CNC" => notional,
        "NRML" => lot_margin.unwrap_or(notional * FNO_NRML_MARGIN_PCT),
        _ => notional,
    }
}

pub struct SandboxEngine {
    cache: Arc<dyn CacheBackend>,
    hub: Arc<MarketDataHub>,
    config: SandboxConfig,
    books: RwLock<HashMap<String, UserBook>>,
    last_ltp: RwLock<HashMap<String, f64>>,
    watched: Mutex<std::collections::HashSet<String>>,
    market_timezone: String,
}

impl SandboxEngine {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        hub: Arc<MarketDataHub>,
        config: SandboxConfig,
        market_timezone: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            hub,
            config,
            books: RwLock::new(HashMap::new()),
            last_ltp: RwLock::new(HashMap::new()),
            watched: Mutex::new(std::collections::HashSet::new()),
            market_timezone,
        })
    }

    fn symbol_key(symbol: &str, exchange: &str) -> String {
        format!("{symbol}.{exchange}")
    }

    /// Approximate margin required for `quantity` at `price` for `product`,
    /// exposed for the basket-margin-calculator REST endpoint.
    pub fn margin_for(&self, product: &str, quantity: f64, price: f64, lot_margin: Option<f64>) -> f64 {
        margin_for(product, price * quantity, lot_margin)
    }

    async fn load_book(&self, user_id: &str) -> anyhow::Result<UserBook> {
        if let Some(book) = json::get::<UserBook>(self.cache.as_ref(), namespace::SANDBOX_FUNDS, user_id).await? {
            return Ok(book);
        }
        Ok(UserBook::new(self.config.starting_capital))
    }

    async fn persist_book(&self, user_id: &str, book: &UserBook) -> anyhow::Result<()> {
        json::set(self.cache.as_ref(), namespace::SANDBOX_FUNDS, user_id, book, None).await
    }

    async fn with_book<R>(&self, user_id: &str, f: impl FnOnce(&mut UserBook) -> R) -> anyhow::Result<R> {
        let needs_load = !self.books.read().contains_key(user_id);
        if needs_load {
            let loaded = self.load_book(user_id).await?;
            self.books.write().entry(user_id.to_string()).or_insert(loaded);
        }
        let (result, snapshot) = {
            let mut guard = self.books.write();
            let book = guard.get_mut(user_id).expect("just inserted");
            let result = f(book);
            (result, book.clone())
        };
        self.persist_book(user_id, &snapshot).await?;
        Ok(result)
    }

    fn watch(self: &Arc<Self>, symbol: &str, exchange: &str) {
        let key = Self::symbol_key(symbol, exchange);
        {
            let mut watched = self.watched.lock();
            if !watched.insert(key.clone()) {
                return;
            }
        }
        let (mut rx, _) = self.hub.subscribe(symbol, exchange, Mode::Ltp);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => this.on_tick(&tick).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_tick(&self, tick: &crate::market_data::hub::Tick) {
        let key = Self::symbol_key(&tick.symbol, &tick.exchange);
        self.last_ltp.write().insert(key.clone(), tick.ltp);

        let user_ids: Vec<String> = self.books.read().keys().cloned().collect();
        for user_id in user_ids {
            if let Err(e) = self.try_fill_resting_orders(&user_id, &tick.symbol, &tick.exchange, tick.ltp).await {
                warn!(user_id, error = %e, "sandbox: failed to evaluate resting orders on tick");
            }
        }
    }

    /// LIMIT fills when LTP crosses the price (≤ for BUY, ≥ for SELL); SL/SL-M
    /// become MARKET/LIMIT once LTP crosses the trigger, symmetric by side.
    async fn try_fill_resting_orders(
        &self,
        user_id: &str,
        symbol: &str,
        exchange: &str,
        ltp: f64,
    ) -> anyhow::Result<()> {
        self.with_book(user_id, |book| {
            let ready: Vec<String> = book
                .orders
                .values()
                .filter(|o| {
                    o.status == VirtualOrderStatus::Open
                        && o.symbol == symbol
                        && o.exchange == exchange
                        && order_crosses(o, ltp)
                })
                .map(|o| o.id.clone())
                .collect();

            for id in ready {
                let order = book.orders.get(&id).unwrap().clone();
                apply_fill(book, &order, ltp);
                if let Some(o) = book.orders.get_mut(&id) {
                    o.status = VirtualOrderStatus::Complete;
                    o.avg_fill_price = ltp;
                }
            }
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self, req), fields(user_id, symbol = %req.symbol))]
    pub async fn place_order(
        &self,
        user_id: &str,
        product: &str,
        req: &OrderRequest,
    ) -> anyhow::Result<OrderAck> {
        let id = format!("{ORDER_ID_PREFIX}{}", Uuid::new_v4());
        let last_ltp = self
            .last_ltp
            .read()
            .get(&Self::symbol_key(&req.symbol, &req.exchange))
            .copied();

        let notional_price = req.price.or(last_ltp).unwrap_or(0.0);
        let margin = margin_for(product, notional_price * req.quantity, None);

        let mut order = VirtualOrder {
            id: id.clone(),
            symbol: req.symbol.clone(),
            exchange: req.exchange.clone(),
            product: product.to_string(),
            side: req.side,
            order_type: req.order_type,
            quantity: req.quantity,
            price: req.price,
            trigger_price: req.trigger_price,
            status: VirtualOrderStatus::Open,
            avg_fill_price: 0.0,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let ack_status = self
            .with_book(user_id, |book| -> anyhow::Result<&'static str> {
                if book.funds - book.used_margin < margin {
                    order.status = VirtualOrderStatus::Rejected;
                    book.orders.insert(id.clone(), order.clone());
                    return Ok("REJECTED");
                }
                book.used_margin += margin;

                match req.order_type {
                    OrderType::Market => {
                        let fill_price = last_ltp.unwrap_or(notional_price);
                        apply_fill(book, &order, fill_price);
                        order.status = VirtualOrderStatus::Complete;
                        order.avg_fill_price = fill_price;
                        book.used_margin -= margin;
                    }
                    OrderType::Limit | OrderType::StopLoss | OrderType::StopLossMarket => {
                        if let Some(ltp) = last_ltp {
                            if order_crosses(&order, ltp) {
                                apply_fill(book, &order, ltp);
                                order.status = VirtualOrderStatus::Complete;
                                order.avg_fill_price = ltp;
                                book.used_margin -= margin;
                            }
                        }
                    }
                }
                book.orders.insert(id.clone(), order.clone());
                Ok(if order.status == VirtualOrderStatus::Complete {
                    "COMPLETE"
                } else {
                    "OPEN"
                })
            })
            .await??;

        self.watch(&req.symbol, &req.exchange);

        info!(order_id = %id, status = ack_status, "sandbox order placed");
        Ok(OrderAck {
            broker_order_id: id,
            status: ack_status.to_string(),
            raw: serde_json::json!({ "mode": "analyze" }),
        })
    }

    pub async fn cancel_order(&self, user_id: &str, broker_order_id: &str) -> anyhow::Result<()> {
        self.with_book(user_id, |book| {
            if let Some(o) = book.orders.get_mut(broker_order_id) {
                if o.status == VirtualOrderStatus::Open {
                    o.status = VirtualOrderStatus::Cancelled;
                }
            }
        })
        .await
    }

    pub async fn get_open_orders(&self, user_id: &str) -> anyhow::Result<Vec<VirtualOrder>> {
        let needs_load = !self.books.read().contains_key(user_id);
        if needs_load {
            let loaded = self.load_book(user_id).await?;
            self.books.write().entry(user_id.to_string()).or_insert(loaded);
        }
        Ok(self
            .books
            .read()
            .get(user_id)
            .map(|b| b.orders.values().filter(|o| o.status == VirtualOrderStatus::Open).cloned().collect())
            .unwrap_or_default())
    }

    pub async fn get_balance(&self, user_id: &str) -> anyhow::Result<f64> {
        let needs_load = !self.books.read().contains_key(user_id);
        if needs_load {
            let loaded = self.load_book(user_id).await?;
            self.books.write().entry(user_id.to_string()).or_insert(loaded);
        }
        Ok(self.books.read().get(user_id).map(|b| b.funds - b.used_margin).unwrap_or(0.0))
    }

    pub async fn net_position_qty(&self, user_id: &str, symbol: &str, exchange: &str, product: &str) -> f64 {
        let needs_load = !self.books.read().contains_key(user_id);
        if needs_load {
            if let Ok(loaded) = self.load_book(user_id).await {
                self.books.write().entry(user_id.to_string()).or_insert(loaded);
            }
        }
        let key = VirtualPosition::key(symbol, exchange, product);
        self.books
            .read()
            .get(user_id)
            .and_then(|b| b.positions.get(&key))
            .map(|p| p.net_qty)
            .unwrap_or(0.0)
    }

    /// All open MIS positions on `exchange` are closed at the prevailing LTP
    /// and pending MIS orders cancelled; CNC/NRML untouched.
    pub async fn auto_square_off(&self, exchange: &str) -> anyhow::Result<()> {
        let last_ltp = self.last_ltp.read().clone();
        let user_ids: Vec<String> = self.books.read().keys().cloned().collect();
        for user_id in user_ids {
            self.with_book(&user_id, |book| {
                let mis_positions: Vec<VirtualPosition> = book
                    .positions
                    .values()
                    .filter(|p| p.product == "MIS" && p.exchange == exchange && p.net_qty != 0.0)
                    .cloned()
                    .collect();

                for pos in mis_positions {
                    let key = Self::symbol_key(&pos.symbol, &pos.exchange);
                    let ltp = *last_ltp.get(&key).unwrap_or(&pos.avg_price);
                    let closing_side = if pos.net_qty > 0.0 { Side::Sell } else { Side::Buy };
                    let close_order = VirtualOrder {
                        id: format!("{ORDER_ID_PREFIX}{}", Uuid::new_v4()),
                        symbol: pos.symbol.clone(),
                        exchange: pos.exchange.clone(),
                        product: pos.product.clone(),
                        side: closing_side,
                        order_type: OrderType::Market,
                        quantity: pos.net_qty.abs(),
                        price: None,
                        trigger_price: None,
                        status: VirtualOrderStatus::Complete,
                        avg_fill_price: ltp,
                        created_at: chrono::Utc::now().to_rfc3339(),
                    };
                    apply_fill(book, &close_order, ltp);
                    book.orders.insert(close_order.id.clone(), close_order);
                }

                for order in book.orders.values_mut() {
                    if order.status == VirtualOrderStatus::Open
                        && order.product == "MIS"
                        && order.exchange == exchange
                    {
                        order.status = VirtualOrderStatus::Cancelled;
                    }
                }
            })
            .await?;
        }
        info!(exchange, "sandbox: auto square-off complete");
        Ok(())
    }

    /// Funds restored to `starting_capital`; positions and orders cleared;
    /// realised P&L is logged (not retained per-trade) before the reset.
    pub async fn daily_reset(&self) -> anyhow::Result<()> {
        let user_ids: Vec<String> = self.books.read().keys().cloned().collect();
        for user_id in user_ids {
            self.with_book(&user_id, |book| {
                let realized_total: f64 = book.positions.values().map(|p| p.realized_pnl).sum();
                info!(user_id = %user_id, realized_total, "sandbox: daily reset, prior P&L logged");
                book.funds = self.config.starting_capital;
                book.used_margin = 0.0;
                book.positions.clear();
                book.orders.clear();
            })
            .await?;
        }
        Ok(())
    }

    /// Polls wall-clock time against `square_off_times`/`reset_weekday`+
    /// `reset_time`, guarding each action with a last-fired-minute marker so a
    /// slow tick (not wall-clock drift) never double-fires it.
    pub async fn run_scheduler_loop(self: Arc<Self>) {
        let mut last_fired: HashMap<String, (u32, u32, u32)> = HashMap::new();
        let mut interval = tokio::time::interval(Duration::from_secs(20));
        loop {
            interval.tick().await;
            let now = market_now(&self.market_timezone);
            let now_key = (now.hour(), now.minute(), now.day());

            for (exchange, hhmm) in self.config.square_off_times.clone() {
                if hhmm_matches(&hhmm, now.hour(), now.minute()) {
                    let marker = format!("squareoff:{exchange}");
                    if last_fired.get(&marker) != Some(&now_key) {
                        last_fired.insert(marker, now_key);
                        if let Err(e) = self.auto_square_off(&exchange).await {
                            warn!(exchange, error = %e, "sandbox auto square-off failed");
                        }
                    }
                }
            }

            if now.weekday() == parse_weekday(&self.config.reset_weekday)
                && hhmm_matches(&self.config.reset_time, now.hour(), now.minute())
            {
                let marker = "daily_reset".to_string();
                if last_fired.get(&marker) != Some(&now_key) {
                    last_fired.insert(marker, now_key);
                    if let Err(e) = self.daily_reset().await {
                        warn!(error = %e, "sandbox daily reset failed");
                    }
                }
            }
        }
    }
}

fn order_crosses(order: &VirtualOrder, ltp: f64) -> bool {
    match order.order_type {
        OrderType::Market => true,
        OrderType::Limit => match (order.side, order.price) {
            (Side::Buy, Some(p)) => ltp <= p,
            (Side::Sell, Some(p)) => ltp >= p,
            _ => false,
        },
        OrderType::StopLoss | OrderType::StopLossMarket => match (order.side, order.trigger_price) {
            (Side::Buy, Some(t)) => ltp >= t,
            (Side::Sell, Some(t)) => ltp <= t,
            _ => false,
        },
    }
}

fn apply_fill(book: &mut UserBook, order: &VirtualOrder, fill_price: f64) {
    let key = VirtualPosition::key(&order.symbol, &order.exchange, &order.product);
    let signed_qty = match order.side {
        Side::Buy => order.quantity,
        Side::Sell => -order.quantity,
    };
    let notional = fill_price * signed_qty;

    let pos = book.positions.entry(key).or_insert_with(|| VirtualPosition {
        symbol: order.symbol.clone(),
        exchange: order.exchange.clone(),
        product: order.product.clone(),
        net_qty: 0.0,
        avg_price: fill_price,
        realized_pnl: 0.0,
    });

    let same_direction = pos.net_qty == 0.0 || pos.net_qty.signum() == signed_qty.signum();
    let mut realized_pnl_delta = 0.0;
    if same_direction {
        let total_cost = pos.avg_price * pos.net_qty + notional;
        pos.net_qty += signed_qty;
        pos.avg_price = if pos.net_qty != 0.0 { total_cost / pos.net_qty } else { 0.0 };
    } else {
        let closing_qty = signed_qty.abs().min(pos.net_qty.abs());
        let direction = pos.net_qty.signum();
        realized_pnl_delta = direction * (fill_price - pos.avg_price) * closing_qty;
        pos.realized_pnl += realized_pnl_delta;
        pos.net_qty += signed_qty;
        if pos.net_qty.signum() != direction && pos.net_qty != 0.0 {
            // Flipped through flat — remaining quantity opens a new position
            // at the fill price.
            pos.avg_price = fill_price;
        }
    }
    book.funds += realized_pnl_delta;
}

fn hhmm_matches(hhmm: &str, hour: u32, minute: u32) -> bool {
    let mut parts = hhmm.split(':');
    let h: Option<u32> = parts.next().and_then(|s| s.parse().ok());
    let m: Option<u32> = parts.next().and_then(|s| s.parse().ok());
    matches!((h, m), (Some(h), Some(m)) if h == hour && m == minute)
}

fn parse_weekday(name: &str) -> Weekday {
    match name.to_lowercase().as_str() {
        "monday" => Weekday::Mon,
        "tuesday" => Weekday::Tue,
        "wednesday" => Weekday::Wed,
        "thursday" => Weekday::Thu,
        "friday" => Weekday::Fri,
        "saturday" => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

/// Adapts one user's sandbox book to the [`Broker`] trait so `OrderRouter`
/// can route to it exactly as it would to `BinanceClient`.
pub struct SandboxBroker {
    pub user_id: String,
    pub product: String,
    pub engine: Arc<SandboxEngine>,
}

#[async_trait]
impl Broker for SandboxBroker {
    async fn place_order(&self, req: &OrderRequest) -> anyhow::Result<OrderAck> {
        self.engine.place_order(&self.user_id, &self.product, req).await
    }

    async fn cancel_order(&self, _symbol: &str, broker_order_id: &str) -> anyhow::Result<()> {
        self.engine.cancel_order(&self.user_id, broker_order_id).await
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<serde_json::Value>> {
        let orders = self.engine.get_open_orders(&self.user_id).await?;
        Ok(orders
            .into_iter()
            .filter(|o| symbol.map(|s| s == o.symbol).unwrap_or(true))
            .map(|o| serde_json::to_value(o).unwrap_or_default())
            .collect())
    }

    async fn get_balance(&self, _asset: &str) -> anyhow::Result<f64> {
        self.engine.get_balance(&self.user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(side: Side, order_type: OrderType, qty: f64, price: Option<f64>, trigger: Option<f64>) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".into(),
            exchange: "NSE".into(),
            side,
            order_type,
            quantity: qty,
            price,
            trigger_price: trigger,
            client_order_id: None,
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_last_ltp() {
        let cache: Arc<dyn CacheBackend> = Arc::new(crate::cache::memory::MemoryBackend::new(100));
        let hub = Arc::new(MarketDataHub::default());
        let engine = SandboxEngine::new(cache, hub.clone(), SandboxConfig::default(), "Asia/Kolkata".to_string());
        hub.publish(crate::market_data::hub::Tick {
            symbol: "BTCUSDT".into(),
            exchange: "NSE".into(),
            mode: Mode::Ltp,
            ltp: 100.0,
            timestamp: "1970-01-01T00:00:00Z".into(),
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            last_trade_qty: None,
            avg_price: None,
            depth_buy: None,
            depth_sell: None,
            requested_depth: None,
            actual_depth: None,
            is_fallback: None,
            oi: None,
        });
        engine.watch("BTCUSDT", "NSE");
        engine.last_ltp.write().insert("BTCUSDT.NSE".into(), 100.0);

        let ack = engine
            .place_order("u1", "MIS", &req(Side::Buy, OrderType::Market, 10.0, None, None))
            .await
            .unwrap();
        assert_eq!(ack.status, "COMPLETE");
        assert!(ack.broker_order_id.starts_with(ORDER_ID_PREFIX));

        let qty = engine.net_position_qty("u1", "BTCUSDT", "NSE", "MIS").await;
        assert_eq!(qty, 10.0);
    }

    #[test]
    fn margin_rules_by_product() {
        assert_eq!(margin_for("MIS", 1000.0, None), 200.0);
        assert_eq!(margin_for("CNC", 1000.0, None), 1000.0);
        assert_eq!(margin_for("NRML", 1000.0, None), 200.0);
        assert_eq!(margin_for("NRML", 1000.0, Some(50.0)), 50.0);
    }

    #[test]
    fn limit_order_crossing() {
        let mut o = VirtualOrder {
            id: "x".into(),
            symbol: "X".into(),
            exchange: "NSE".into(),
            product: "MIS".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: 1.0,
            price: Some(100.0),
            trigger_price: None,
            status: VirtualOrderStatus::Open,
            avg_fill_price: 0.0,
            created_at: String::new(),
        };
        assert!(order_crosses(&o, 99.0));
        assert!(!order_crosses(&o, 101.0));
        o.side = Side::Sell;
        assert!(order_crosses(&o, 101.0));
        assert!(!order_crosses(&o, 99.0));
    }
}
