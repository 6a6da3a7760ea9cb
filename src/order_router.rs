// =============================================================================
// Order router (C5)
// =============================================================================
//
// Holds an `Arc<dyn Broker>` chosen per-user at construction time (the live
// client or the sandbox engine's virtual book), so the
// place/modify/cancel/smart_close bodies below are mode-agnostic.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, OrderAck, OrderRequest, OrderType, Side};
use crate::cache::{namespace, CacheBackend};
use crate::error::EngineError;

/// Broker-defined per-leg ceiling for F&O symbols. Keyed by broker symbol;
/// absent entries are unlimited.
#[derive(Debug, Clone, Default)]
pub struct FreezeQuantityTable {
    limits: std::collections::HashMap<String, u32>,
}

impl FreezeQuantityTable {
    pub fn from_map(limits: std::collections::HashMap<String, u32>) -> Self {
        Self { limits }
    }

    pub fn limit_for(&self, broker_symbol: &str) -> Option<u32> {
        self.limits.get(broker_symbol).copied()
    }

    /// Split `quantity` into legs of at most the freeze limit for
    /// `broker_symbol`. No limit configured ⇒ a single leg.
    pub fn split(&self, broker_symbol: &str, quantity: f64) -> Vec<f64> {
        let Some(limit) = self.limit_for(broker_symbol) else {
            return vec![quantity];
        };
        let limit = limit as f64;
        if quantity <= limit {
            return vec![quantity];
        }
        let mut legs = Vec::new();
        let mut remaining = quantity;
        while remaining > 0.0 {
            let leg = remaining.min(limit);
            legs.push(leg);
            remaining -= leg;
        }
        legs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegResult {
    pub quantity: f64,
    pub broker_order_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceResult {
    pub parent_client_order_id: String,
    pub legs: Vec<LegResult>,
    /// Set by sandbox routing: `"analyze"` when routed to the sandbox
    /// engine, omitted in live mode for bit-compat with existing clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl PlaceResult {
    pub fn all_succeeded(&self) -> bool {
        self.legs.iter().all(|l| l.error.is_none())
    }
}

/// One order intent as accepted from strategy/alert/direct API callers, pre
/// client-order-id assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub user_id: String,
    pub broker_symbol: String,
    pub symbol: String,
    pub exchange: String,
    pub product: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub strategy: Option<String>,
    pub client_order_id: Option<String>,
}

/// Unified order/modify/cancel/smart-close interface over broker clients.
pub struct OrderRouter {
    broker_for_user: Arc<dyn Fn(&str) -> Arc<dyn Broker> + Send + Sync>,
    cache: Arc<dyn CacheBackend>,
    freeze_table: FreezeQuantityTable,
    dedup_window: Duration,
    /// Per-dedup-key lock so two concurrent `place()` calls for the same
    /// client-order-id can't both pass the cache check before either writes
    /// the dedup record — without it a replay race could submit to the
    /// broker twice.
    dedup_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl OrderRouter {
    pub fn new(
        broker_for_user: Arc<dyn Fn(&str) -> Arc<dyn Broker> + Send + Sync>,
        cache: Arc<dyn CacheBackend>,
        freeze_table: FreezeQuantityTable,
        dedup_window: Duration,
    ) -> Self {
        Self {
            broker_for_user,
            cache,
            freeze_table,
            dedup_window,
            dedup_locks: DashMap::new(),
        }
    }

    fn dedup_key(user_id: &str, client_order_id: &str) -> String {
        format!("{user_id}:{client_order_id}")
    }

    /// Assigns a client-order-id if the caller didn't supply one, splits F&O
    /// legs over the freeze-quantity limit, and replays an identical
    /// client-order-id within the dedup window without re-submitting.
    #[instrument(skip(self, intent), fields(user = %intent.user_id, symbol = %intent.symbol))]
    pub async fn place(&self, intent: OrderIntent) -> anyhow::Result<PlaceResult> {
        let client_order_id = intent
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let dedup_key = Self::dedup_key(&intent.user_id, &client_order_id);
        let key_lock = self
            .dedup_locks
            .entry(dedup_key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _key_guard = key_lock.lock().await;

        if let Some(cached) =
            crate::cache::json::get::<PlaceResult>(self.cache.as_ref(), namespace::ORDER_DEDUP, &dedup_key)
                .await?
        {
            info!(client_order_id, "replayed place() within dedup window, returning cached result");
            return Ok(cached);
        }

        let broker = (self.broker_for_user)(&intent.user_id);
        let legs_qty = self.freeze_table.split(&intent.broker_symbol, intent.quantity);

        let mut legs = Vec::with_capacity(legs_qty.len());
        for (i, qty) in legs_qty.iter().enumerate() {
            let leg_client_id = if legs_qty.len() == 1 {
                client_order_id.clone()
            } else {
                format!("{client_order_id}-L{i}")
            };
            let req = OrderRequest {
                symbol: intent.broker_symbol.clone(),
                exchange: intent.exchange.clone(),
                side: intent.side,
                order_type: intent.order_type,
                quantity: *qty,
                price: intent.price,
                trigger_price: intent.trigger_price,
                client_order_id: Some(leg_client_id.clone()),
            };
            match broker.place_order(&req).await {
                Ok(OrderAck { broker_order_id, .. }) => legs.push(LegResult {
                    quantity: *qty,
                    broker_order_id: Some(broker_order_id),
                    error: None,
                }),
                Err(e) => {
                    warn!(leg = i, error = %e, "order leg failed, continuing remaining legs");
                    legs.push(LegResult {
                        quantity: *qty,
                        broker_order_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let result = PlaceResult {
            parent_client_order_id: client_order_id.clone(),
            legs,
            mode: None,
        };

        crate::cache::json::set(
            self.cache.as_ref(),
            namespace::ORDER_DEDUP,
            &dedup_key,
            &result,
            Some(self.dedup_window),
        )
        .await?;

        info!(
            client_order_id,
            legs = result.legs.len(),
            all_ok = result.all_succeeded(),
            "place() completed"
        );
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn cancel(&self, user_id: &str, symbol: &str, broker_order_id: &str) -> anyhow::Result<()> {
        let broker = (self.broker_for_user)(user_id);
        broker.cancel_order(symbol, broker_order_id).await
    }

    #[instrument(skip(self))]
    pub async fn cancel_all(&self, user_id: &str, symbol_filter: Option<&str>) -> anyhow::Result<usize> {
        let broker = (self.broker_for_user)(user_id);
        let open = broker.get_open_orders(symbol_filter).await?;
        let mut cancelled = 0;
        for order in &open {
            let symbol = order.get("symbol").and_then(|v| v.as_str()).unwrap_or_default();
            let order_id = order
                .get("orderId")
                .map(|v| v.to_string())
                .unwrap_or_default();
            if broker.cancel_order(symbol, &order_id).await.is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Closes whatever net position exists at broker-reported quantity,
    /// idempotent per (user, symbol, exchange, product) within the dedup
    /// window. A flat position is a no-op success, never an error.
    #[instrument(skip(self))]
    pub async fn smart_close(
        &self,
        user_id: &str,
        symbol: &str,
        broker_symbol: &str,
        exchange: &str,
        product: &str,
        net_qty: f64,
        reason: &str,
    ) -> anyhow::Result<Option<PlaceResult>> {
        if net_qty == 0.0 {
            info!(user_id, symbol, reason, "smart_close: already flat, no-op");
            return Ok(None);
        }

        let dedup_key = format!("close:{user_id}:{symbol}:{exchange}:{product}");
        if crate::cache::json::get::<PlaceResult>(self.cache.as_ref(), namespace::ORDER_DEDUP, &dedup_key)
            .await?
            .is_some()
        {
            info!(user_id, symbol, reason, "smart_close: already in flight within dedup window");
            return Ok(None);
        }

        let side = if net_qty > 0.0 { Side::Sell } else { Side::Buy };
        let intent = OrderIntent {
            user_id: user_id.to_string(),
            broker_symbol: broker_symbol.to_string(),
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            product: product.to_string(),
            side,
            order_type: OrderType::Market,
            quantity: net_qty.abs(),
            price: None,
            trigger_price: None,
            strategy: None,
            client_order_id: Some(dedup_key.clone()),
        };

        let result = self.place(intent).await?;
        warn!(user_id, symbol, reason, "position closed via smart_close");
        Ok(Some(result))
    }

    /// Broker-reported net position for `broker_symbol`. Spot exchanges
    /// like Binance have no position endpoint, only asset
    /// balances, so this approximates net exposure as the free balance of
    /// the symbol's base asset. A margin/futures broker with a real
    /// position endpoint would override this at the `Broker` level instead;
    /// kept here rather than on the trait since every current client is
    /// spot-only and the approximation is router-level policy, not a
    /// capability each broker needs to express independently.
    pub async fn net_position_qty(&self, user_id: &str, broker_symbol: &str) -> anyhow::Result<f64> {
        let broker = (self.broker_for_user)(user_id);
        let asset = base_asset(broker_symbol);
        broker.get_balance(&asset).await
    }

    /// Whether `broker_order_id` still appears among `broker_symbol`'s open
    /// orders — used by the trade monitor's entry-fill poll.
    pub async fn order_still_open(
        &self,
        user_id: &str,
        broker_symbol: &str,
        broker_order_id: &str,
    ) -> anyhow::Result<bool> {
        let broker = (self.broker_for_user)(user_id);
        let open = broker.get_open_orders(Some(broker_symbol)).await?;
        Ok(open.iter().any(|o| {
            o.get("orderId")
                .map(|v| v.to_string() == broker_order_id)
                .unwrap_or(false)
        }))
    }

    /// Raw open-order list passthrough, for the order book / order status
    /// REST surface.
    pub async fn open_orders(
        &self,
        user_id: &str,
        symbol_filter: Option<&str>,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let broker = (self.broker_for_user)(user_id);
        broker.get_open_orders(symbol_filter).await
    }
}

/// Strip a known Binance quote-asset suffix off a trading-pair symbol, e.g.
/// `"BTCUSDT"` -> `"BTC"`. Falls back to the full symbol if none match.
fn base_asset(broker_symbol: &str) -> String {
    const QUOTE_SUFFIXES: &[&str] = &["USDT", "BUSD", "USDC", "BTC", "ETH", "BNB", "USD"];
    for suffix in QUOTE_SUFFIXES {
        if broker_symbol.len() > suffix.len() && broker_symbol.ends_with(suffix) {
            return broker_symbol[..broker_symbol.len() - suffix.len()].to_string();
        }
    }
    broker_symbol.to_string()
}

/// Error produced when a router operation is attempted against an unknown
/// broker symbol — kept distinct from a generic broker failure so callers
/// can distinguish "never reached the exchange" from "exchange rejected it".
pub fn unresolved_symbol(symbol: &str, exchange: &str) -> EngineError {
    crate::symbols::lookup_miss(symbol, exchange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_table_splits_into_legs_at_or_below_limit() {
        let mut m = std::collections::HashMap::new();
        m.insert("NIFTY27JAN2624000CE".to_string(), 1800u32);
        let table = FreezeQuantityTable::from_map(m);
        let legs = table.split("NIFTY27JAN2624000CE", 4000.0);
        assert_eq!(legs, vec![1800.0, 1800.0, 400.0]);
    }

    #[test]
    fn freeze_table_single_leg_when_under_limit() {
        let mut m = std::collections::HashMap::new();
        m.insert("NIFTY27JAN2624000CE".to_string(), 1800u32);
        let table = FreezeQuantityTable::from_map(m);
        assert_eq!(table.split("NIFTY27JAN2624000CE", 500.0), vec![500.0]);
    }

    #[test]
    fn freeze_table_unlimited_when_symbol_absent() {
        let table = FreezeQuantityTable::default();
        assert_eq!(table.split("RELIANCE", 100_000.0), vec![100_000.0]);
    }

    #[test]
    fn base_asset_strips_known_quote_suffixes() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("ETHBUSD"), "ETH");
        assert_eq!(base_asset("BNBBTC"), "BNB");
        assert_eq!(base_asset("RANDOMTOKEN"), "RANDOMTOKEN");
    }

    #[test]
    fn place_result_all_succeeded() {
        let result = PlaceResult {
            parent_client_order_id: "x".to_string(),
            legs: vec![
                LegResult { quantity: 1.0, broker_order_id: Some("1".into()), error: None },
                LegResult { quantity: 1.0, broker_order_id: None, error: Some("boom".into()) },
            ],
            mode: None,
        };
        assert!(!result.all_succeeded());
    }
}
