// =============================================================================
// Broker trait — the interface boundary between the order router, the
// sandbox engine, and any concrete exchange client
// =============================================================================
//
// `binance::client::BinanceClient`'s `place_order`/`cancel_order`/
// `get_open_orders` shape is lifted into an object-safe, broker-agnostic
// contract so the router can be built against `Arc<dyn Broker>` and swap
// clients (or a sandbox stand-in) without touching call sites. Mirrors the
// `async_trait` pattern used for `CacheBackend`.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    StopLossMarket,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopLoss => write!(f, "SL"),
            Self::StopLossMarket => write!(f, "SL-M"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub exchange: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub broker_order_id: String,
    pub status: String,
    pub raw: serde_json::Value,
}

/// Broker-agnostic order operations. Implemented by
/// [`crate::binance::client::BinanceClient`] for live trading and by the
/// sandbox engine's virtual book for simulated trading, so live/demo
/// selection is a choice of implementation rather than a branch in the
/// router.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> anyhow::Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, broker_order_id: &str) -> anyhow::Result<()>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<serde_json::Value>>;
    async fn get_balance(&self, asset: &str) -> anyhow::Result<f64>;
}

#[async_trait]
impl Broker for crate::binance::client::BinanceClient {
    async fn place_order(&self, req: &OrderRequest) -> anyhow::Result<OrderAck> {
        let order_type_str = req.order_type.to_string();
        let raw = self
            .place_order(
                &req.symbol,
                &req.side.to_string(),
                &order_type_str,
                req.quantity,
                req.price,
                Some("GTC"),
                req.client_order_id.as_deref(),
            )
            .await?;
        let broker_order_id = raw
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let status = raw
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        Ok(OrderAck { broker_order_id, status, raw })
    }

    async fn cancel_order(&self, symbol: &str, broker_order_id: &str) -> anyhow::Result<()> {
        let order_id: u64 = broker_order_id.parse().unwrap_or(0);
        self.cancel_order(symbol, order_id).await?;
        Ok(())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> anyhow::Result<Vec<serde_json::Value>> {
        self.get_open_orders(symbol).await
    }

    async fn get_balance(&self, asset: &str) -> anyhow::Result<f64> {
        self.get_balance(asset).await
    }
}
