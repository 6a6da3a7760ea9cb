// =============================================================================
// WebSocket streaming endpoint
// =============================================================================
//
// One socket per client. First frame must be an `authenticate` action; after
// that the client can subscribe/unsubscribe to any number of
// (symbol, exchange, mode) topics and receives ticks as they are published on
// the shared `MarketDataHub`. Each active subscription owns a forwarding task
// that reads the hub's broadcast receiver and pushes frames into a per-socket
// mpsc channel, so a slow client only ever lags its own topics, never blocks
// the hub.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::auth_gate::AuthContext;
use crate::market_data::hub::Mode;

pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Wire representation of [`Mode`]; kept separate so the inbound protocol
/// doesn't have to change if the internal enum's serde attributes do.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
enum ModeWire {
    Ltp,
    Quote,
    Depth,
}

impl From<ModeWire> for Mode {
    fn from(m: ModeWire) -> Self {
        match m {
            ModeWire::Ltp => Mode::Ltp,
            ModeWire::Quote => Mode::Quote,
            ModeWire::Depth => Mode::Depth,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientMessage {
    Authenticate {
        api_key: String,
    },
    Subscribe {
        symbol: String,
        exchange: String,
        mode: ModeWire,
        #[serde(default)]
        depth_level: Option<u32>,
    },
    Unsubscribe {
        symbol: String,
        exchange: String,
        mode: ModeWire,
    },
}

type TopicKey = (String, String, Mode);

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);

    let ctx = match wait_for_authentication(&mut stream, &tx, &state).await {
        Some(ctx) => ctx,
        None => return,
    };
    info!(user_id = %ctx.user_id, "ws: client authenticated");

    let mut forwarders: HashMap<TopicKey, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_text(&text, &state, &tx, &mut forwarders).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "ws: read error, closing connection");
                        break;
                    }
                }
            }
        }
    }

    for (key, handle) in forwarders.drain() {
        handle.abort();
        let (symbol, exchange, mode) = key;
        if state.market_data_hub.unsubscribe(&symbol, &exchange, mode) {
            debug!(%symbol, %exchange, %mode, "ws: last subscriber gone on disconnect");
        }
    }
    info!(user_id = %ctx.user_id, "ws: client disconnected");
}

/// The first frame on any connection must be `{"action":"authenticate", ...}`.
/// Anything else, a bad key, or a 10s timeout closes the socket.
async fn wait_for_authentication(
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    tx: &mpsc::Sender<Message>,
    state: &Arc<AppState>,
) -> Option<AuthContext> {
    let frame = tokio::time::timeout(Duration::from_secs(10), stream.next()).await;
    let text = match frame {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
        Ok(Some(Ok(_))) => {
            let _ = tx.send(error_frame("first message must be authenticate")).await;
            return None;
        }
        Ok(Some(Err(e))) => {
            warn!(error = %e, "ws: read error awaiting authentication");
            return None;
        }
        Err(_) => {
            let _ = tx.send(error_frame("authentication timed out")).await;
            return None;
        }
    };

    let msg: ClientMessage = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(e) => {
            let _ = tx.send(error_frame(&format!("invalid message: {e}"))).await;
            return None;
        }
    };

    let ClientMessage::Authenticate { api_key } = msg else {
        let _ = tx.send(error_frame("first message must be authenticate")).await;
        return None;
    };

    match state.auth_gate.validate(&api_key).await {
        Ok(Ok(ctx)) => {
            let _ = tx.send(ack("authenticate", None)).await;
            Some(ctx)
        }
        Ok(Err(e)) => {
            let _ = tx.send(error_frame(&e.to_string())).await;
            None
        }
        Err(e) => {
            warn!(error = %e, "ws: auth gate error during authentication");
            let _ = tx.send(error_frame("internal error during authentication")).await;
            None
        }
    }
}

async fn handle_inbound_text(
    text: &str,
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Message>,
    forwarders: &mut HashMap<TopicKey, JoinHandle<()>>,
) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = tx.send(error_frame(&format!("invalid message: {e}"))).await;
            return;
        }
    };

    match msg {
        ClientMessage::Authenticate { .. } => {
            let _ = tx.send(error_frame("already authenticated")).await;
        }
        ClientMessage::Subscribe { symbol, exchange, mode, depth_level: _ } => {
            let mode: Mode = mode.into();
            let key: TopicKey = (symbol.clone(), exchange.clone(), mode);
            if forwarders.contains_key(&key) {
                let _ = tx.send(ack("subscribe", Some(&key))).await;
                return;
            }
            let (mut hub_rx, _is_new) = state.market_data_hub.subscribe(&symbol, &exchange, mode);
            let forward_tx = tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match hub_rx.recv().await {
                        Ok(tick) => {
                            let frame = match serde_json::to_string(&*tick) {
                                Ok(json) => Message::Text(json),
                                Err(_) => continue,
                            };
                            if forward_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            forwarders.insert(key.clone(), handle);
            let _ = tx.send(ack("subscribe", Some(&key))).await;
        }
        ClientMessage::Unsubscribe { symbol, exchange, mode } => {
            let mode: Mode = mode.into();
            let key: TopicKey = (symbol.clone(), exchange.clone(), mode);
            if let Some(handle) = forwarders.remove(&key) {
                handle.abort();
                state.market_data_hub.unsubscribe(&symbol, &exchange, mode);
            }
            let _ = tx.send(ack("unsubscribe", Some(&key))).await;
        }
    }
}

fn ack(action: &str, topic: Option<&TopicKey>) -> Message {
    let body = match topic {
        Some((symbol, exchange, mode)) => json!({
            "type": "ack",
            "action": action,
            "symbol": symbol,
            "exchange": exchange,
            "mode": mode.to_string(),
        }),
        None => json!({
            "type": "ack",
            "action": action,
        }),
    };
    Message::Text(body.to_string())
}

fn error_frame(message: &str) -> Message {
    Message::Text(json!({ "type": "error", "message": message }).to_string())
}
