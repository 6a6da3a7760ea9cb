// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Every endpoint is a POST carrying a JSON body whose first field is `apikey`
// (GET `/health` and the WebSocket upgrade at `/ws` are the only exceptions).
// Responses are `{"status":"success", ...}` or `{"status":"error","code":...,
// "message":...}`; HTTP status tracks `EngineError::http_status`.
//
// CORS is permissive — this engine sits behind a reverse proxy in every
// deployment this has been grounded against, same as the teacher's surface.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Bytes, Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::active_trade::{ActiveTrade, Side as TradeSide, TradeStatus, TrailingConfig};
use crate::alerts::{AlertAction, AlertOrderConfig, AlertSchedule, AlertStatus, ConditionType, ScheduledAlert, TriggerMode};
use crate::app_state::AppState;
use crate::auth_gate::AuthContext;
use crate::broker::{OrderType, Side as BrokerSide};
use crate::error::EngineError;
use crate::exit::monitor::PortfolioRiskConfig;
use crate::market_data::hub::Mode;
use crate::order_router::{OrderIntent, PlaceResult};
use crate::symbols::{format_wire_symbol, InstrumentType};
use crate::types::AccountMode;
use crate::webhook_router::{PositionSizing, StrategyInstance, StrategyKind, StrategySchedule};

// =============================================================================
// Error envelope
// =============================================================================

/// Wraps every engine-level failure into the `{"status":"error",...}` shape.
/// Internal (`anyhow`) failures are folded into `UPSTREAM_ERROR` — they carry
/// no client-actionable code of their own.
pub struct AppError(EngineError);

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self(EngineError::UpstreamError(err.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({ "status": "error", "code": self.0.code(), "message": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type HandlerResult = Result<Json<Value>, AppError>;

/// Fold a serializable value into `{"status":"success", ...}`. Object values
/// are merged at the top level; anything else is nested under `"data"`.
fn success<T: serde::Serialize>(value: T) -> Json<Value> {
    let mut obj = match serde_json::to_value(value).unwrap_or(Value::Null) {
        Value::Object(m) => m,
        other => {
            let mut m = Map::new();
            m.insert("data".to_string(), other);
            m
        }
    };
    obj.insert("status".to_string(), json!("success"));
    Json(Value::Object(obj))
}

async fn authenticate(state: &AppState, apikey: &str) -> Result<AuthContext, AppError> {
    let outcome = state.auth_gate.validate(apikey).await?;
    outcome.map_err(AppError::from)
}

fn parse_side(action: &str) -> Result<BrokerSide, AppError> {
    match action.to_uppercase().as_str() {
        "BUY" => Ok(BrokerSide::Buy),
        "SELL" => Ok(BrokerSide::Sell),
        other => Err(EngineError::InvalidParameters(format!("invalid action '{other}', expected BUY or SELL")).into()),
    }
}

fn parse_order_type(pricetype: &str) -> Result<OrderType, AppError> {
    match pricetype.to_uppercase().as_str() {
        "MARKET" => Ok(OrderType::Market),
        "LIMIT" => Ok(OrderType::Limit),
        "SL" => Ok(OrderType::StopLoss),
        "SL-M" => Ok(OrderType::StopLossMarket),
        other => Err(EngineError::InvalidParameters(format!("invalid pricetype '{other}'")).into()),
    }
}

fn default_product() -> String {
    "MIS".to_string()
}

/// Resolve a wire symbol to its broker symbol. Falls back to the symbol
/// itself, uppercased, when the master-contract table has no record for it —
/// this bridge's spot pairs are their own broker wire form, so an unpopulated
/// resolver table shouldn't block trading, only lose lot-size/tick-size
/// metadata for that leg.
fn resolve_broker_symbol(state: &AppState, symbol: &str, exchange: &str) -> (String, String) {
    match state.symbols.resolve(symbol, exchange) {
        Some(rec) => (rec.broker_symbol, rec.exchange),
        None => (symbol.to_uppercase(), exchange.to_string()),
    }
}

/// Net position quantity, mode-aware: the sandbox keeps exact simulated
/// positions; live trading only has the broker's own asset balance as an
/// approximation (see `OrderRouter::net_position_qty`).
async fn net_position_qty(
    state: &AppState,
    user_id: &str,
    symbol: &str,
    broker_symbol: &str,
    exchange: &str,
    product: &str,
) -> anyhow::Result<f64> {
    let mode = state.runtime_config.read().account_mode;
    match mode {
        AccountMode::Demo => Ok(state.sandbox.net_position_qty(user_id, symbol, exchange, product).await),
        AccountMode::Live => state.order_router.net_position_qty(user_id, broker_symbol).await,
    }
}

fn order_id_matches(order: &Value, id: &str) -> bool {
    match order.get("orderId") {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    }
}

fn summarize_webhook_results(results: Vec<Result<PlaceResult, EngineError>>) -> Vec<Value> {
    results
        .into_iter()
        .map(|r| match r {
            Ok(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            Err(e) => json!({ "error": e.code(), "message": e.to_string() }),
        })
        .collect()
}

// =============================================================================
// REST-layer rate limiter
// =============================================================================

/// Fixed one-second window atomic counter — the same idiom
/// `binance::rate_limit::RateLimitTracker` uses for Binance's own limits,
/// applied here to `runtime_config.rest_rate_limit_per_sec`. The limit is
/// snapshotted once at router construction; it does not follow a hot config
/// reload.
struct RestRateLimiter {
    limit_per_sec: u32,
    window_start_secs: AtomicI64,
    count_in_window: AtomicU32,
}

impl RestRateLimiter {
    fn new(limit_per_sec: u32) -> Self {
        Self {
            limit_per_sec: limit_per_sec.max(1),
            window_start_secs: AtomicI64::new(chrono::Utc::now().timestamp()),
            count_in_window: AtomicU32::new(0),
        }
    }

    fn check(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        let window = self.window_start_secs.load(Ordering::Relaxed);
        if now != window
            && self
                .window_start_secs
                .compare_exchange(window, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.count_in_window.store(0, Ordering::SeqCst);
        }
        self.count_in_window.fetch_add(1, Ordering::SeqCst) < self.limit_per_sec
    }
}

async fn rate_limit_guard(limiter: Arc<RestRateLimiter>, req: Request, next: Next) -> Response {
    if limiter.check() {
        next.run(req).await
    } else {
        AppError::from(EngineError::RateLimited).into_response()
    }
}

// =============================================================================
// Shared request shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct ApiKeyOnlyRequest {
    apikey: String,
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Deserialize)]
struct PlaceOrderRequest {
    apikey: String,
    #[serde(default)]
    strategy: Option<String>,
    symbol: String,
    exchange: String,
    action: String,
    #[serde(default = "default_product")]
    product: String,
    pricetype: String,
    quantity: f64,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    trigger_price: Option<f64>,
    #[serde(default)]
    client_order_id: Option<String>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    target: Option<f64>,
    #[serde(default)]
    trailing: Option<TrailingConfig>,
}

async fn place_order(State(state): State<Arc<AppState>>, Json(req): Json<PlaceOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let side = parse_side(&req.action)?;
    let order_type = parse_order_type(&req.pricetype)?;
    let (broker_symbol, exchange) = resolve_broker_symbol(&state, &req.symbol, &req.exchange);

    let intent = OrderIntent {
        user_id: ctx.user_id.clone(),
        broker_symbol: broker_symbol.clone(),
        symbol: req.symbol.clone(),
        exchange,
        product: req.product.clone(),
        side,
        order_type,
        quantity: req.quantity,
        price: req.price,
        trigger_price: req.trigger_price,
        strategy: req.strategy.clone(),
        client_order_id: req.client_order_id.clone(),
    };

    let result = state.order_router.place(intent).await?;

    let carries_risk = req.stop_loss.is_some() || req.target.is_some() || req.trailing.as_ref().is_some_and(TrailingConfig::is_enabled);
    if result.all_succeeded() && carries_risk {
        for leg in &result.legs {
            let Some(broker_order_id) = &leg.broker_order_id else { continue };
            let trade_side = match side {
                BrokerSide::Buy => TradeSide::Long,
                BrokerSide::Sell => TradeSide::Short,
            };
            let trade = ActiveTrade::new_pending_entry(
                Uuid::new_v4().to_string(),
                ctx.user_id.clone(),
                req.strategy.clone().unwrap_or_else(|| "manual".to_string()),
                req.symbol.clone(),
                req.exchange.clone(),
                req.product.clone(),
                broker_symbol.clone(),
                trade_side,
                leg.quantity,
                req.stop_loss,
                req.target,
                req.trailing.unwrap_or(TrailingConfig::None),
                broker_order_id.clone(),
            );
            if let Err(e) = state.trade_monitor.register(trade).await {
                warn!(error = %e, "failed to register active trade for supervised order");
            }
        }
    }

    Ok(success(result))
}

#[derive(Debug, Deserialize)]
struct SmartOrderRequest {
    apikey: String,
    #[serde(default)]
    strategy: Option<String>,
    symbol: String,
    exchange: String,
    #[serde(default = "default_product")]
    product: String,
    /// Target net position, signed — positive is long, negative is short.
    position_size: f64,
}

async fn place_smart_order(State(state): State<Arc<AppState>>, Json(req): Json<SmartOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let (broker_symbol, exchange) = resolve_broker_symbol(&state, &req.symbol, &req.exchange);
    let current = net_position_qty(&state, &ctx.user_id, &req.symbol, &broker_symbol, &exchange, &req.product).await?;
    let delta = req.position_size - current;
    if delta.abs() < 1e-9 {
        return Ok(success(json!({ "message": "already at target position", "net_qty": current })));
    }

    let side = if delta > 0.0 { BrokerSide::Buy } else { BrokerSide::Sell };
    let intent = OrderIntent {
        user_id: ctx.user_id,
        broker_symbol,
        symbol: req.symbol,
        exchange,
        product: req.product,
        side,
        order_type: OrderType::Market,
        quantity: delta.abs(),
        price: None,
        trigger_price: None,
        strategy: req.strategy,
        client_order_id: None,
    };
    let result = state.order_router.place(intent).await?;
    Ok(success(result))
}

#[derive(Debug, Deserialize)]
struct ModifyOrderRequest {
    apikey: String,
}

async fn modify_order(State(state): State<Arc<AppState>>, Json(req): Json<ModifyOrderRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    Err(EngineError::BrokerLimitation("order modification is not supported by this broker; cancel and re-place instead".into()).into())
}

#[derive(Debug, Deserialize)]
struct CancelOrderRequest {
    apikey: String,
    symbol: String,
    exchange: String,
    order_id: String,
}

async fn cancel_order(State(state): State<Arc<AppState>>, Json(req): Json<CancelOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let (broker_symbol, _) = resolve_broker_symbol(&state, &req.symbol, &req.exchange);
    state.order_router.cancel(&ctx.user_id, &broker_symbol, &req.order_id).await?;
    Ok(success(json!({ "order_id": req.order_id })))
}

#[derive(Debug, Deserialize)]
struct CancelAllOrderRequest {
    apikey: String,
    #[serde(default)]
    symbol: Option<String>,
}

async fn cancel_all_order(State(state): State<Arc<AppState>>, Json(req): Json<CancelAllOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let cancelled = state.order_router.cancel_all(&ctx.user_id, req.symbol.as_deref()).await?;
    Ok(success(json!({ "cancelled": cancelled })))
}

#[derive(Debug, Deserialize)]
struct ClosePositionRequest {
    apikey: String,
    symbol: String,
    exchange: String,
    #[serde(default = "default_product")]
    product: String,
}

async fn close_position(State(state): State<Arc<AppState>>, Json(req): Json<ClosePositionRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let (broker_symbol, exchange) = resolve_broker_symbol(&state, &req.symbol, &req.exchange);
    let net_qty = net_position_qty(&state, &ctx.user_id, &req.symbol, &broker_symbol, &exchange, &req.product).await?;
    let result = state
        .order_router
        .smart_close(&ctx.user_id, &req.symbol, &broker_symbol, &exchange, &req.product, net_qty, "MANUAL_CLOSE")
        .await?;
    match result {
        Some(r) => Ok(success(r)),
        None => Ok(success(json!({ "message": "already flat" }))),
    }
}

#[derive(Debug, Deserialize)]
struct OrderStatusRequest {
    apikey: String,
    #[serde(default)]
    symbol: Option<String>,
    order_id: String,
}

async fn order_status(State(state): State<Arc<AppState>>, Json(req): Json<OrderStatusRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let orders = state.order_router.open_orders(&ctx.user_id, req.symbol.as_deref()).await?;
    match orders.into_iter().find(|o| order_id_matches(o, &req.order_id)) {
        Some(order) => Ok(success(order)),
        None => Err(EngineError::InvalidParameters("order not found among open orders".into()).into()),
    }
}

#[derive(Debug, Deserialize)]
struct BasketOrderItem {
    symbol: String,
    exchange: String,
    action: String,
    #[serde(default = "default_product")]
    product: String,
    pricetype: String,
    quantity: f64,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    trigger_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BasketOrderRequest {
    apikey: String,
    #[serde(default)]
    strategy: Option<String>,
    orders: Vec<BasketOrderItem>,
}

async fn place_basket_item(
    state: &AppState,
    ctx: &AuthContext,
    strategy: Option<String>,
    item: BasketOrderItem,
) -> Result<PlaceResult, EngineError> {
    let side = parse_side(&item.action).map_err(|e| e.0)?;
    let order_type = parse_order_type(&item.pricetype).map_err(|e| e.0)?;
    let (broker_symbol, exchange) = resolve_broker_symbol(state, &item.symbol, &item.exchange);
    let intent = OrderIntent {
        user_id: ctx.user_id.clone(),
        broker_symbol,
        symbol: item.symbol,
        exchange,
        product: item.product,
        side,
        order_type,
        quantity: item.quantity,
        price: item.price,
        trigger_price: item.trigger_price,
        strategy,
        client_order_id: None,
    };
    state.order_router.place(intent).await.map_err(|e| EngineError::UpstreamError(e.to_string()))
}

async fn basket_order(State(state): State<Arc<AppState>>, Json(req): Json<BasketOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let mut results = Vec::with_capacity(req.orders.len());
    for item in req.orders {
        let outcome = place_basket_item(&state, &ctx, req.strategy.clone(), item).await;
        results.push(match outcome {
            Ok(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Err(e) => json!({ "error": e.code(), "message": e.to_string() }),
        });
    }
    Ok(success(json!({ "orders": results })))
}

#[derive(Debug, Deserialize)]
struct SplitOrderRequest {
    apikey: String,
    #[serde(default)]
    strategy: Option<String>,
    symbol: String,
    exchange: String,
    action: String,
    #[serde(default = "default_product")]
    product: String,
    pricetype: String,
    quantity: f64,
    splitsize: f64,
    #[serde(default)]
    price: Option<f64>,
}

async fn split_order(State(state): State<Arc<AppState>>, Json(req): Json<SplitOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    if req.splitsize <= 0.0 {
        return Err(EngineError::InvalidParameters("splitsize must be positive".into()).into());
    }
    let side = parse_side(&req.action)?;
    let order_type = parse_order_type(&req.pricetype)?;
    let (broker_symbol, exchange) = resolve_broker_symbol(&state, &req.symbol, &req.exchange);

    let mut remaining = req.quantity;
    let mut chunks = Vec::new();
    while remaining > 1e-9 {
        let qty = remaining.min(req.splitsize);
        let intent = OrderIntent {
            user_id: ctx.user_id.clone(),
            broker_symbol: broker_symbol.clone(),
            symbol: req.symbol.clone(),
            exchange: exchange.clone(),
            product: req.product.clone(),
            side,
            order_type,
            quantity: qty,
            price: req.price,
            trigger_price: None,
            strategy: req.strategy.clone(),
            client_order_id: None,
        };
        let r = state.order_router.place(intent).await?;
        chunks.push(r);
        remaining -= qty;
    }
    Ok(success(json!({ "chunks": chunks })))
}

#[derive(Debug, Deserialize)]
struct OptionsOrderRequest {
    apikey: String,
    #[serde(default)]
    strategy: Option<String>,
    underlying: String,
    exchange: String,
    expiry: String,
    strike: u64,
    option_type: String,
    action: String,
    pricetype: String,
    quantity: f64,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default = "default_product")]
    product: String,
}

async fn options_order(State(state): State<Arc<AppState>>, Json(req): Json<OptionsOrderRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let side = parse_side(&req.action)?;
    let order_type = parse_order_type(&req.pricetype)?;
    let is_call = match req.option_type.to_uppercase().as_str() {
        "CE" => true,
        "PE" => false,
        other => return Err(EngineError::InvalidParameters(format!("invalid option_type '{other}', expected CE or PE")).into()),
    };
    let wire_symbol = format_wire_symbol(&req.underlying, InstrumentType::Option, Some(&req.expiry), Some(req.strike), Some(is_call));
    let (broker_symbol, exchange) = resolve_broker_symbol(&state, &wire_symbol, &req.exchange);

    let intent = OrderIntent {
        user_id: ctx.user_id,
        broker_symbol,
        symbol: wire_symbol,
        exchange,
        product: req.product,
        side,
        order_type,
        quantity: req.quantity,
        price: req.price,
        trigger_price: None,
        strategy: req.strategy,
        client_order_id: None,
    };
    let result = state.order_router.place(intent).await?;
    Ok(success(result))
}

// =============================================================================
// Data
// =============================================================================

#[derive(Debug, Deserialize)]
struct QuoteRequest {
    apikey: String,
    symbol: String,
    exchange: String,
    /// Accepted for API-shape compatibility; actual depth served is whatever
    /// the upstream feed normalises to — this bridge doesn't renegotiate
    /// depth per REST request (see `market_data::upstream`).
    #[serde(default)]
    #[allow(dead_code)]
    depth_level: Option<u32>,
}

/// Serves the last cached tick for a topic, subscribing to the hub first if
/// nothing has arrived yet. A probe that triggers a fresh subscription is
/// left open deliberately — the REST layer has no session to tie an
/// unsubscribe to, so a symbol probed once just stays warm for later reads.
async fn fetch_tick(state: &AppState, symbol: &str, exchange: &str, mode: Mode) -> Result<crate::market_data::hub::Tick, AppError> {
    if let Some(tick) = state.market_data_hub.last_tick(symbol, exchange, mode) {
        return Ok((*tick).clone());
    }
    let (_rx, is_new) = state.market_data_hub.subscribe(symbol, exchange, mode);
    if is_new {
        info!(symbol, exchange, mode = %mode, "REST probe opened a new market data subscription; no tick cached yet");
    }
    Err(EngineError::UpstreamTimeout(format!("no tick cached yet for {symbol}.{exchange}")).into())
}

async fn get_quotes(State(state): State<Arc<AppState>>, Json(req): Json<QuoteRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let tick = fetch_tick(&state, &req.symbol, &req.exchange, Mode::Quote).await?;
    Ok(success(tick))
}

async fn get_ticker(State(state): State<Arc<AppState>>, Json(req): Json<QuoteRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let tick = fetch_tick(&state, &req.symbol, &req.exchange, Mode::Ltp).await?;
    Ok(success(tick))
}

async fn get_depth(State(state): State<Arc<AppState>>, Json(req): Json<QuoteRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let tick = fetch_tick(&state, &req.symbol, &req.exchange, Mode::Depth).await?;
    Ok(success(tick))
}

fn default_history_limit() -> u32 {
    500
}

#[derive(Debug, Deserialize)]
struct HistoryRequest {
    apikey: String,
    symbol: String,
    interval: String,
    #[serde(default = "default_history_limit")]
    limit: u32,
}

/// Always served from live Binance klines regardless of `account_mode` — the
/// sandbox has no historical candle store of its own.
async fn get_history(State(state): State<Arc<AppState>>, Json(req): Json<HistoryRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let candles = state.binance.get_klines(&req.symbol, &req.interval, req.limit).await?;
    Ok(success(json!({ "candles": candles })))
}

async fn get_intervals(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    Ok(success(json!({
        "intervals": ["1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M"],
    })))
}

fn default_search_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    apikey: String,
    query: String,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

async fn search_symbols(State(state): State<Arc<AppState>>, Json(req): Json<SearchRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let results = state.symbols.search(&req.query, req.exchange.as_deref(), req.limit);
    Ok(success(json!({ "symbols": results })))
}

// =============================================================================
// Portfolio
// =============================================================================

async fn get_orderbook(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let orders = state.order_router.open_orders(&ctx.user_id, None).await?;
    Ok(success(json!({ "orders": orders })))
}

async fn get_tradebook(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let trades = state.active_trades.for_user(&ctx.user_id);
    Ok(success(json!({ "trades": trades })))
}

async fn get_positionbook(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let positions: Vec<Value> = state
        .active_trades
        .for_user(&ctx.user_id)
        .into_iter()
        .filter(|t| matches!(t.status, TradeStatus::Active | TradeStatus::PendingEntry))
        .map(|t| {
            let pnl = t.unrealized_pnl();
            json!({ "trade": t, "unrealized_pnl": pnl })
        })
        .collect();
    Ok(success(json!({ "positions": positions })))
}

async fn get_holdings(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let holdings: Vec<ActiveTrade> = state
        .active_trades
        .for_user(&ctx.user_id)
        .into_iter()
        .filter(|t| t.product == "CNC" && t.status == TradeStatus::Active)
        .collect();
    Ok(success(json!({ "holdings": holdings })))
}

async fn get_funds(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let mode = state.runtime_config.read().account_mode;
    let available = match mode {
        AccountMode::Demo => state.sandbox.get_balance(&ctx.user_id).await?,
        AccountMode::Live => state.binance.get_balance("USDT").await?,
    };
    Ok(success(json!({ "available_balance": available, "account_mode": mode.to_string() })))
}

// =============================================================================
// Market
// =============================================================================

#[derive(Debug, Deserialize)]
struct MarginRequest {
    apikey: String,
    #[serde(default = "default_product")]
    product: String,
    quantity: f64,
    price: f64,
    #[serde(default)]
    lot_margin: Option<f64>,
}

async fn get_margin(State(state): State<Arc<AppState>>, Json(req): Json<MarginRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let margin = state.sandbox.margin_for(&req.product, req.quantity, req.price, req.lot_margin);
    Ok(success(json!({ "margin_required": margin })))
}

async fn market_timings(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    authenticate(&state, &req.apikey).await?;
    let cfg = state.runtime_config.read();
    Ok(success(json!({
        "timezone": cfg.market_timezone,
        "square_off_times": cfg.sandbox.square_off_times,
    })))
}

// =============================================================================
// Management: strategies
// =============================================================================

#[derive(Debug, Deserialize)]
struct RegisterStrategyRequest {
    apikey: String,
    kind: StrategyKind,
    schedule: StrategySchedule,
    allocated_funds: f64,
    position_sizing: PositionSizing,
    max_open_positions: u32,
    daily_loss_limit: f64,
    #[serde(default)]
    portfolio_risk: Option<PortfolioRiskConfig>,
    #[serde(default)]
    webhook_secret: Option<String>,
    #[serde(default)]
    symbol_map: HashMap<String, (String, String)>,
    #[serde(default = "default_dedup_secs")]
    dedup_window_secs: u64,
    #[serde(default = "default_product")]
    product: String,
}

fn default_dedup_secs() -> u64 {
    60
}

async fn register_strategy(State(state): State<Arc<AppState>>, Json(req): Json<RegisterStrategyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let id = Uuid::new_v4().to_string();
    let webhook_id = Uuid::new_v4().to_string();
    let instance = StrategyInstance {
        id: id.clone(),
        user_id: ctx.user_id,
        kind: req.kind,
        schedule: req.schedule,
        allocated_funds: req.allocated_funds,
        position_sizing: req.position_sizing,
        max_open_positions: req.max_open_positions,
        daily_loss_limit: req.daily_loss_limit,
        current_day_pnl: 0.0,
        portfolio_risk: req.portfolio_risk,
        webhook_id: webhook_id.clone(),
        webhook_secret: req.webhook_secret,
        symbol_map: req.symbol_map,
        active: true,
        panic: false,
        dedup_window_secs: req.dedup_window_secs,
        product: req.product,
    };
    state.strategy_router.register_strategy(instance).await?;
    Ok(success(json!({ "strategy_id": id, "webhook_id": webhook_id })))
}

async fn list_strategies(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    Ok(success(json!({ "strategies": state.strategy_router.list_strategies(&ctx.user_id) })))
}

fn owned_strategy(state: &AppState, ctx: &AuthContext, strategy_id: &str) -> Result<StrategyInstance, AppError> {
    let s = state
        .strategy_router
        .get_strategy(strategy_id)
        .ok_or_else(|| EngineError::InvalidParameters("strategy not found".into()))?;
    if s.user_id != ctx.user_id {
        return Err(EngineError::InvalidParameters("strategy not found".into()).into());
    }
    Ok(s)
}

async fn get_strategy(
    State(state): State<Arc<AppState>>,
    Path(strategy_id): Path<String>,
    Json(req): Json<ApiKeyOnlyRequest>,
) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let s = owned_strategy(&state, &ctx, &strategy_id)?;
    Ok(success(s))
}

#[derive(Debug, Deserialize)]
struct SetStrategyStateRequest {
    apikey: String,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    panic: Option<bool>,
}

async fn set_strategy_state(
    State(state): State<Arc<AppState>>,
    Path(strategy_id): Path<String>,
    Json(req): Json<SetStrategyStateRequest>,
) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    owned_strategy(&state, &ctx, &strategy_id)?;
    let updated = state.strategy_router.set_strategy_state(&strategy_id, req.active, req.panic).await?;
    Ok(success(updated))
}

async fn delete_strategy(
    State(state): State<Arc<AppState>>,
    Path(strategy_id): Path<String>,
    Json(req): Json<ApiKeyOnlyRequest>,
) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    owned_strategy(&state, &ctx, &strategy_id)?;
    let removed = state.strategy_router.delete_strategy(&strategy_id).await?;
    Ok(success(json!({ "deleted": removed })))
}

/// Authenticated alternate trigger path: same gate pipeline as the public
/// webhook endpoints, but gated by `apikey` instead of the webhook's own
/// HMAC secret — useful for in-house signal sources that already hold a
/// valid API key and would rather not manage a separate webhook secret.
async fn trigger_signal(State(state): State<Arc<AppState>>, Path(webhook_id): Path<String>, body: Bytes) -> HandlerResult {
    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| EngineError::InvalidParameters(format!("invalid JSON body: {e}")))?;
    let apikey = parsed
        .get("apikey")
        .and_then(Value::as_str)
        .ok_or(EngineError::AuthenticationRequired)?;
    authenticate(&state, apikey).await?;
    let results = state
        .strategy_router
        .handle_webhook(&webhook_id, None, &body)
        .await
        .map_err(|e| EngineError::InvalidParameters(e.to_string()))?;
    Ok(success(json!({ "results": summarize_webhook_results(results) })))
}

async fn not_implemented_stub(Path(path): Path<String>) -> Response {
    let body = json!({
        "status": "error",
        "code": "NOT_IMPLEMENTED",
        "message": format!("'{path}' is out of scope for this engine: backtesting and walk-forward analytics are not implemented"),
    });
    (StatusCode::NOT_IMPLEMENTED, Json(body)).into_response()
}

// =============================================================================
// Management: alerts
// =============================================================================

#[derive(Debug, Deserialize)]
struct RegisterAlertRequest {
    apikey: String,
    symbol: String,
    exchange: String,
    condition: ConditionType,
    #[serde(default)]
    schedule: Option<AlertSchedule>,
    action: AlertAction,
    #[serde(default)]
    order_config: Option<AlertOrderConfig>,
    #[serde(default = "default_trigger_mode")]
    trigger_mode: TriggerMode,
    #[serde(default)]
    cooldown_minutes: u32,
    #[serde(default = "default_max_triggers")]
    max_triggers: u32,
}

fn default_trigger_mode() -> TriggerMode {
    TriggerMode::Once
}
fn default_max_triggers() -> u32 {
    1
}
fn empty_schedule() -> AlertSchedule {
    AlertSchedule {
        start_date: None,
        end_date: None,
        start_time: None,
        end_time: None,
        weekdays: vec![],
        market_hours_only: false,
    }
}

async fn register_alert(State(state): State<Arc<AppState>>, Json(req): Json<RegisterAlertRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let id = Uuid::new_v4().to_string();
    let alert = ScheduledAlert {
        id: id.clone(),
        user_id: ctx.user_id,
        api_key: req.apikey,
        symbol: req.symbol,
        exchange: req.exchange,
        condition: req.condition,
        schedule: req.schedule.unwrap_or_else(empty_schedule),
        action: req.action,
        order_config: req.order_config,
        trigger_mode: req.trigger_mode,
        cooldown_minutes: req.cooldown_minutes,
        max_triggers: req.max_triggers,
        trigger_count: 0,
        last_triggered_at: None,
        last_ltp: None,
        previous_ltp: None,
        status: AlertStatus::Active,
    };
    state.alert_engine.register_alert(alert).await?;
    Ok(success(json!({ "alert_id": id })))
}

async fn list_alerts(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    Ok(success(json!({ "alerts": state.alert_engine.list_alerts(&ctx.user_id) })))
}

async fn owned_alert(state: &AppState, ctx: &AuthContext, alert_id: &str) -> Result<ScheduledAlert, AppError> {
    let alert = state
        .alert_engine
        .get_alert(alert_id)
        .await?
        .ok_or_else(|| EngineError::InvalidParameters("alert not found".into()))?;
    if alert.user_id != ctx.user_id {
        return Err(EngineError::InvalidParameters("alert not found".into()).into());
    }
    Ok(alert)
}

async fn get_alert(State(state): State<Arc<AppState>>, Path(alert_id): Path<String>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let alert = owned_alert(&state, &ctx, &alert_id).await?;
    Ok(success(alert))
}

#[derive(Debug, Deserialize)]
struct SetAlertStatusRequest {
    apikey: String,
    status: AlertStatus,
}

async fn set_alert_status(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<String>,
    Json(req): Json<SetAlertStatusRequest>,
) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    owned_alert(&state, &ctx, &alert_id).await?;
    let updated = state.alert_engine.set_alert_status(&alert_id, req.status).await?;
    Ok(success(updated))
}

async fn delete_alert(State(state): State<Arc<AppState>>, Path(alert_id): Path<String>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    owned_alert(&state, &ctx, &alert_id).await?;
    let deleted = state.alert_engine.delete_alert(&alert_id).await?;
    Ok(success(json!({ "deleted": deleted })))
}

async fn test_alert(State(state): State<Arc<AppState>>, Path(alert_id): Path<String>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    owned_alert(&state, &ctx, &alert_id).await?;
    let result = state
        .alert_engine
        .test_alert(&alert_id)
        .await
        .map_err(|e| EngineError::InvalidParameters(e.to_string()))?;
    Ok(success(json!({ "would_trigger": result.is_some(), "detail": result })))
}

// =============================================================================
// Management: risk
// =============================================================================

async fn get_risk(State(state): State<Arc<AppState>>, Json(req): Json<ApiKeyOnlyRequest>) -> HandlerResult {
    let ctx = authenticate(&state, &req.apikey).await?;
    let cfg = state.runtime_config.read();
    Ok(success(json!({
        "max_concurrent_positions": cfg.max_concurrent_positions,
        "max_daily_loss_pct": cfg.max_daily_loss_pct,
        "max_consecutive_losses": cfg.max_consecutive_losses,
        "max_trades_per_day": cfg.max_trades_per_day,
        "open_positions": state.active_trades.count_open_for_user(&ctx.user_id),
    })))
}

// =============================================================================
// Webhooks (strategy trigger, public — HMAC-gated per strategy, not apikey)
// =============================================================================

async fn webhook_handler(State(state): State<Arc<AppState>>, Path(webhook_id): Path<String>, headers: HeaderMap, body: Bytes) -> HandlerResult {
    let signature = headers.get("X-Signature").and_then(|v| v.to_str().ok());
    let results = state
        .strategy_router
        .handle_webhook(&webhook_id, signature, &body)
        .await
        .map_err(|e| EngineError::InvalidParameters(e.to_string()))?;
    Ok(success(json!({ "results": summarize_webhook_results(results) })))
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let cfg = state.runtime_config.read();
    Json(json!({
        "status": "success",
        "uptime_secs": state.uptime_secs(),
        "trading_mode": cfg.trading_mode.to_string(),
        "account_mode": cfg.account_mode.to_string(),
    }))
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let rate_limit_per_sec = state.runtime_config.read().rest_rate_limit_per_sec;
    let limiter = Arc::new(RestRateLimiter::new(rate_limit_per_sec));

    let api = Router::new()
        .route("/health", get(health))
        .route("/orders/placeorder", post(place_order))
        .route("/orders/placesmartorder", post(place_smart_order))
        .route("/orders/modifyorder", post(modify_order))
        .route("/orders/cancelorder", post(cancel_order))
        .route("/orders/cancelallorder", post(cancel_all_order))
        .route("/orders/closeposition", post(close_position))
        .route("/orders/orderstatus", post(order_status))
        .route("/orders/basketorder", post(basket_order))
        .route("/orders/splitorder", post(split_order))
        .route("/orders/optionsorder", post(options_order))
        .route("/data/quotes", post(get_quotes))
        .route("/data/depth", post(get_depth))
        .route("/data/history", post(get_history))
        .route("/data/ticker", post(get_ticker))
        .route("/data/intervals", post(get_intervals))
        .route("/data/search", post(search_symbols))
        .route("/portfolio/orderbook", post(get_orderbook))
        .route("/portfolio/tradebook", post(get_tradebook))
        .route("/portfolio/positionbook", post(get_positionbook))
        .route("/portfolio/holdings", post(get_holdings))
        .route("/portfolio/funds", post(get_funds))
        .route("/market/margin", post(get_margin))
        .route("/market/timings", post(market_timings))
        .route("/strategies/new", post(register_strategy))
        .route("/strategies/list", post(list_strategies))
        .route("/strategies/:strategy_id", get(get_strategy).delete(delete_strategy))
        .route("/strategies/:strategy_id/state", post(set_strategy_state))
        .route("/signals/:webhook_id", post(trigger_signal))
        .route("/algos/*path", any(not_implemented_stub))
        .route("/walkforward/*path", any(not_implemented_stub))
        .route("/alerts/new", post(register_alert))
        .route("/alerts/list", post(list_alerts))
        .route("/alerts/:alert_id", get(get_alert).delete(delete_alert))
        .route("/alerts/:alert_id/status", post(set_alert_status))
        .route("/alerts/:alert_id/test", post(test_alert))
        .route("/risk", post(get_risk))
        .route("/webhooks/tradingview/:webhook_id", post(webhook_handler))
        .route("/webhooks/custom/:webhook_id", post(webhook_handler))
        .route("/ws", get(crate::api::ws::ws_handler));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .nest("/api/v1", api)
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            let limiter = limiter.clone();
            async move { rate_limit_guard(limiter, req, next).await }
        }))
        .layer(cors)
        .with_state(state)
}
