// =============================================================================
// Upstream feed supervisor — binds broker WebSocket streams to hub topics
// =============================================================================
//
// The hub only knows about subscribers; it has no opinion on where ticks come
// from. This module watches `hub.active_topics()` and keeps exactly one
// upstream Binance stream running per topic that has subscribers, tearing
// the task down when the last subscriber releases it. Each per-topic task
// reconnects with exponential backoff (5s initial, 60s cap); after ten
// consecutive failures it stops retrying and logs a `upstream_down` warning,
// leaving existing client connections intact as the protocol requires.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::hub::{resolve_depth_fallback, DepthLevel, MarketDataHub, Mode, Tick};

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 10;
const SUPERVISOR_POLL: Duration = Duration::from_secs(2);

/// Depth levels Binance's partial-depth stream actually offers; anything
/// else requested against this broker falls back per [`resolve_depth_fallback`].
const BINANCE_DEPTH_LEVELS: [u32; 2] = [5, 20];

/// Run forever, reconciling hub subscriptions against live upstream tasks.
pub async fn run_upstream_supervisor(hub: Arc<MarketDataHub>) {
    let mut running: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        let active = hub.active_topics();
        let mut wanted: HashMap<String, (String, String, Mode)> = HashMap::new();
        for (symbol, exchange, mode) in active {
            let key = format!("{symbol}.{exchange}.{}", mode as u8);
            wanted.insert(key, (symbol, exchange, mode));
        }

        // Tear down tasks for topics nobody wants anymore.
        running.retain(|key, handle| {
            if wanted.contains_key(key) {
                true
            } else {
                handle.abort();
                info!(topic = %key, "upstream supervisor: tearing down feed, no subscribers left");
                false
            }
        });

        // Spawn tasks for newly-wanted topics.
        for (key, (symbol, exchange, mode)) in &wanted {
            if running.contains_key(key) {
                continue;
            }
            let hub = hub.clone();
            let symbol = symbol.clone();
            let exchange = exchange.clone();
            let mode = *mode;
            let handle = tokio::spawn(async move {
                run_topic_feed(hub, symbol, exchange, mode).await;
            });
            info!(topic = %key, "upstream supervisor: starting feed");
            running.insert(key.clone(), handle);
        }

        tokio::time::sleep(SUPERVISOR_POLL).await;
    }
}

/// Reconnect loop for a single (symbol, exchange, mode) topic.
async fn run_topic_feed(hub: Arc<MarketDataHub>, symbol: String, exchange: String, mode: Mode) {
    let mut attempt: u32 = 0;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let result = match mode {
            Mode::Ltp | Mode::Quote => run_ticker_feed(&hub, &symbol, &exchange, mode).await,
            Mode::Depth => run_depth_feed(&hub, &symbol, &exchange).await,
        };

        match result {
            Ok(()) => {
                // Stream ended cleanly (upstream closed it); reset backoff and retry.
                attempt = 0;
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                attempt += 1;
                warn!(symbol = %symbol, exchange = %exchange, mode = %mode, attempt, error = %e, "upstream feed error");
                if attempt >= MAX_ATTEMPTS {
                    error!(symbol = %symbol, exchange = %exchange, mode = %mode, "upstream feed exhausted retries, pausing");
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn run_ticker_feed(
    hub: &Arc<MarketDataHub>,
    symbol: &str,
    exchange: &str,
    mode: Mode,
) -> anyhow::Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@ticker");
    info!(url = %url, symbol, "connecting to ticker upstream feed");

    let (ws_stream, _) = connect_async(&url).await?;
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let tokio_tungstenite::tungstenite::Message::Text(text) = msg else {
            continue;
        };
        match parse_ticker(&text) {
            Ok(mut tick) => {
                tick.symbol = symbol.to_string();
                tick.exchange = exchange.to_string();
                tick.mode = mode;
                hub.publish(tick);
            }
            Err(e) => warn!(error = %e, "failed to parse ticker message"),
        }
    }
    Ok(())
}

fn parse_ticker(text: &str) -> anyhow::Result<Tick> {
    let root: serde_json::Value = serde_json::from_str(text)?;
    let ltp: f64 = root["c"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
    let open: f64 = root["o"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
    let high: f64 = root["h"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
    let low: f64 = root["l"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
    let volume: f64 = root["v"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
    let avg_price: f64 = root["w"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
    let last_trade_qty: f64 = root["Q"].as_str().unwrap_or("0").parse().unwrap_or(0.0);

    Ok(Tick {
        symbol: String::new(),
        exchange: String::new(),
        mode: Mode::Quote,
        ltp,
        timestamp: chrono::Utc::now().to_rfc3339(),
        open: Some(open),
        high: Some(high),
        low: Some(low),
        close: Some(ltp),
        volume: Some(volume),
        last_trade_qty: Some(last_trade_qty),
        avg_price: Some(avg_price),
        depth_buy: None,
        depth_sell: None,
        requested_depth: None,
        actual_depth: None,
        is_fallback: None,
        oi: None,
    })
}

async fn run_depth_feed(hub: &Arc<MarketDataHub>, symbol: &str, exchange: &str) -> anyhow::Result<()> {
    // Depth level isn't carried on the topic key beyond "mode=4"; the engine
    // tracks the requested level per subscriber at the WebSocket layer and
    // reports actual_depth on every tick, so the upstream feed always asks
    // for the richest level it can get and lets downstream resolve fallback.
    let requested = 50u32;
    let (actual, is_fallback) = resolve_depth_fallback(requested, &BINANCE_DEPTH_LEVELS);

    let lower = symbol.to_lowercase();
    let url = format!("wss://stream.binance.com:9443/ws/{lower}@depth{actual}@100ms");
    info!(url = %url, symbol, actual_depth = actual, "connecting to depth upstream feed");

    let (ws_stream, _) = connect_async(&url).await?;
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let tokio_tungstenite::tungstenite::Message::Text(text) = msg else {
            continue;
        };
        match parse_depth(&text, requested, actual, is_fallback) {
            Ok(mut tick) => {
                tick.symbol = symbol.to_string();
                tick.exchange = exchange.to_string();
                hub.publish(tick);
            }
            Err(e) => warn!(error = %e, "failed to parse depth message"),
        }
    }
    Ok(())
}

fn parse_depth(text: &str, requested: u32, actual: u32, is_fallback: bool) -> anyhow::Result<Tick> {
    let root: serde_json::Value = serde_json::from_str(text)?;
    let parse_levels = |arr: &serde_json::Value| -> Vec<DepthLevel> {
        arr.as_array()
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|lvl| {
                        let price: f64 = lvl.get(0)?.as_str()?.parse().ok()?;
                        let qty: f64 = lvl.get(1)?.as_str()?.parse().ok()?;
                        Some(DepthLevel { price, qty, orders: 0 })
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let bids = parse_levels(&root["bids"]);
    let asks = parse_levels(&root["asks"]);
    let ltp = bids.first().map(|b| b.price).unwrap_or(0.0);

    Ok(Tick {
        symbol: String::new(),
        exchange: String::new(),
        mode: Mode::Depth,
        ltp,
        timestamp: chrono::Utc::now().to_rfc3339(),
        open: None,
        high: None,
        low: None,
        close: None,
        volume: None,
        last_trade_qty: None,
        avg_price: None,
        depth_buy: Some(bids),
        depth_sell: Some(asks),
        requested_depth: Some(requested),
        actual_depth: Some(actual),
        is_fallback: Some(is_fallback),
        oi: None,
    })
}
