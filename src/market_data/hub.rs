// =============================================================================
// Market-data fanout hub
// =============================================================================
//
// Keeps one upstream connection per (user, broker); normalises broker wire
// ticks into LTP/QUOTE/DEPTH shapes and fans each tick out to internal
// subscribers (alerts, trade monitor) and external WebSocket clients.
// Internally this is a `tokio::sync::broadcast` channel per
// (symbol, exchange, mode) topic, with a ref-counted subscription table
// guarded by a `parking_lot::Mutex` — subscribe/unsubscribe stay fast.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Subscription detail level: LTP only / full quote / market depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Ltp = 1,
    Quote = 2,
    Depth = 4,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ltp => write!(f, "LTP"),
            Self::Quote => write!(f, "QUOTE"),
            Self::Depth => write!(f, "DEPTH"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub qty: f64,
    pub orders: u32,
}

/// Normalised tick; shape depends on `mode`. Decimal fields are display
/// units, never broker paise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub exchange: String,
    pub mode: Mode,
    pub ltp: f64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade_qty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_buy: Option<Vec<DepthLevel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_sell: Option<Vec<DepthLevel>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_fallback: Option<bool>,
    /// Open interest, for instruments that carry it. Never populated by the
    /// spot ticker feed; present so derivatives-style alert conditions have
    /// somewhere to read from once a futures feed is wired in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<f64>,
}

impl Tick {
    pub fn topic(&self) -> String {
        format!("{}.{}.{}", self.symbol, self.exchange, self.mode as u8)
    }
}

/// Depths the hub knows how to serve; used by the fallback-depth resolver.
pub const SUPPORTED_DEPTH_LEVELS: [u32; 4] = [5, 20, 30, 50];

/// Given a requested depth and what the (broker, exchange) pair actually
/// supports, pick the highest supported level <= requested.
pub fn resolve_depth_fallback(requested: u32, broker_supports: &[u32]) -> (u32, bool) {
    if broker_supports.contains(&requested) {
        return (requested, false);
    }
    let fallback = broker_supports
        .iter()
        .copied()
        .filter(|&lvl| lvl <= requested)
        .max()
        .or_else(|| broker_supports.iter().copied().min())
        .unwrap_or(requested);
    (fallback, true)
}

#[derive(Default)]
struct TopicState {
    sender: Option<broadcast::Sender<Arc<Tick>>>,
    ref_count: u32,
}

/// Fanout hub: one broadcast channel per topic, reference-counted. Also
/// retains the last tick seen per topic so REST callers can read a value
/// without holding a live subscription.
pub struct MarketDataHub {
    topics: Mutex<HashMap<String, TopicState>>,
    last_tick: Mutex<HashMap<String, Arc<Tick>>>,
    channel_capacity: usize,
}

impl MarketDataHub {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            last_tick: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(16),
        }
    }

    fn topic_key(symbol: &str, exchange: &str, mode: Mode) -> String {
        format!("{symbol}.{exchange}.{}", mode as u8)
    }

    /// Reference-count a subscription and return a receiver for its topic.
    /// The first subscriber on a topic is responsible (by the caller, via
    /// `is_new`) for establishing the upstream broker subscription; the
    /// last unsubscriber tears it down.
    pub fn subscribe(&self, symbol: &str, exchange: &str, mode: Mode) -> (broadcast::Receiver<Arc<Tick>>, bool) {
        let key = Self::topic_key(symbol, exchange, mode);
        let mut topics = self.topics.lock();
        let state = topics.entry(key.clone()).or_default();
        let is_new = state.sender.is_none();
        let sender = state
            .sender
            .get_or_insert_with(|| broadcast::channel(self.channel_capacity).0);
        let rx = sender.subscribe();
        state.ref_count += 1;
        if is_new {
            info!(topic = %key, "market data hub: first subscriber, upstream subscribe required");
        }
        (rx, is_new)
    }

    /// Release one reference; returns `true` if this was the last releaser
    /// (caller should tear down the upstream subscription).
    pub fn unsubscribe(&self, symbol: &str, exchange: &str, mode: Mode) -> bool {
        let key = Self::topic_key(symbol, exchange, mode);
        let mut topics = self.topics.lock();
        let Some(state) = topics.get_mut(&key) else {
            return false;
        };
        state.ref_count = state.ref_count.saturating_sub(1);
        let last = state.ref_count == 0;
        if last {
            topics.remove(&key);
            info!(topic = %key, "market data hub: last subscriber released, upstream teardown required");
        }
        last
    }

    /// Publish a tick to its topic. Delivery is at-most-once: if a
    /// subscriber's channel is full (a slow consumer), `broadcast` drops the
    /// tick for that lagging subscriber only, never tearing the connection
    /// down — callers that observe `RecvError::Lagged` on the receiver side
    /// should simply continue the recv loop.
    pub fn publish(&self, tick: Tick) {
        let key = tick.topic();
        let tick = Arc::new(tick);
        self.last_tick.lock().insert(key.clone(), tick.clone());
        let topics = self.topics.lock();
        if let Some(state) = topics.get(&key) {
            if let Some(sender) = &state.sender {
                // No subscribers is not an error; it just means the tick is
                // dropped, which is fine — nobody asked for it.
                let _ = sender.send(tick);
            }
        } else {
            warn!(topic = %key, "market data hub: publish with no subscribers");
        }
    }

    /// Last tick seen for (symbol, exchange, mode), regardless of whether a
    /// live subscription is currently open. `None` until the first publish.
    pub fn last_tick(&self, symbol: &str, exchange: &str, mode: Mode) -> Option<Arc<Tick>> {
        let key = Self::topic_key(symbol, exchange, mode);
        self.last_tick.lock().get(&key).cloned()
    }

    pub fn subscriber_count(&self, symbol: &str, exchange: &str, mode: Mode) -> u32 {
        let key = Self::topic_key(symbol, exchange, mode);
        self.topics.lock().get(&key).map(|s| s.ref_count).unwrap_or(0)
    }

    /// Snapshot of every topic with at least one live subscriber, decoded
    /// back into (symbol, exchange, mode). Used by the upstream connection
    /// supervisor to decide which broker streams need to be running.
    pub fn active_topics(&self) -> Vec<(String, String, Mode)> {
        self.topics
            .lock()
            .keys()
            .filter_map(|key| {
                let mut parts = key.rsplitn(3, '.');
                let mode_raw = parts.next()?;
                let exchange = parts.next()?;
                let symbol = parts.next()?;
                let mode = match mode_raw {
                    "1" => Mode::Ltp,
                    "2" => Mode::Quote,
                    "4" => Mode::Depth,
                    _ => return None,
                };
                Some((symbol.to_string(), exchange.to_string(), mode))
            })
            .collect()
    }
}

impl Default for MarketDataHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_subscriber_reports_is_new() {
        let hub = MarketDataHub::default();
        let (_rx, is_new) = hub.subscribe("RELIANCE", "NSE", Mode::Ltp);
        assert!(is_new);
        let (_rx2, is_new2) = hub.subscribe("RELIANCE", "NSE", Mode::Ltp);
        assert!(!is_new2);
        assert_eq!(hub.subscriber_count("RELIANCE", "NSE", Mode::Ltp), 2);
    }

    #[test]
    fn last_unsubscribe_tears_down() {
        let hub = MarketDataHub::default();
        let (_rx, _) = hub.subscribe("INFY", "NSE", Mode::Quote);
        assert!(!hub.unsubscribe("INFY", "NSE", Mode::Quote));
        assert!(hub.unsubscribe("INFY", "NSE", Mode::Quote));
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = MarketDataHub::default();
        let (mut rx, _) = hub.subscribe("TCS", "NSE", Mode::Ltp);
        hub.publish(Tick {
            symbol: "TCS".into(),
            exchange: "NSE".into(),
            mode: Mode::Ltp,
            ltp: 3500.0,
            timestamp: "2026-01-01T00:00:00Z".into(),
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
        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.ltp, 3500.0);
    }

    #[test]
    fn depth_fallback_picks_highest_supported_at_or_below_requested() {
        assert_eq!(resolve_depth_fallback(50, &[5, 20]), (20, true));
        assert_eq!(resolve_depth_fallback(20, &[5, 20, 30, 50]), (20, false));
        assert_eq!(resolve_depth_fallback(5, &[20, 30]), (20, true));
    }

    #[test]
    fn topic_key_includes_mode() {
        let tick = Tick {
            symbol: "A".into(),
            exchange: "NSE".into(),
            mode: Mode::Depth,
            ltp: 1.0,
            timestamp: "t".into(),
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
        };
        assert_eq!(tick.topic(), "A.NSE.4");
    }
}
