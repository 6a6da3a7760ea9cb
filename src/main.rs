// =============================================================================
// Aurora Bridge — Main Entry Point
// =============================================================================
//
// Boots every background loop the engine needs: market-data upstream feeds,
// the sandbox square-off scheduler, webhook strategy square-off, the trade
// monitor's persistence flush, and the daily forced-logout sweep — then
// serves the REST API until Ctrl+C.
// =============================================================================

mod active_trade;
mod alerts;
mod api;
mod app_state;
mod auth_gate;
mod binance;
mod broker;
mod cache;
mod decision_envelope;
mod error;
mod exit;
mod indicators;
mod market_data;
mod order_router;
mod runtime_config;
mod sandbox;
mod symbols;
mod types;
mod webhook_router;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("aurora-bridge starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "BNBUSDT".into(),
            "XRPUSDT".into(),
            "SOLUSDT".into(),
        ];
    }

    info!(
        symbols = ?config.symbols,
        account_mode = %config.account_mode,
        trading_mode = %config.trading_mode,
        "runtime config loaded"
    );

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance = binance::client::BinanceClient::new(api_key, api_secret);

    let state = AppState::new(config, binance).await?;

    // ── Recovery: replay cache-backed state before accepting traffic ────────
    if let Err(e) = state.trade_monitor.recover().await {
        error!(error = %e, "trade monitor recovery failed");
    }
    if let Err(e) = state.alert_engine.recover().await {
        error!(error = %e, "alert engine recovery failed");
    }
    if let Err(e) = state.strategy_router.load_all().await {
        error!(error = %e, "strategy router failed to load persisted strategies");
    }

    // ── Background loops ─────────────────────────────────────────────────
    tokio::spawn(market_data::upstream::run_upstream_supervisor(state.market_data_hub.clone()));
    tokio::spawn(state.sandbox.clone().run_scheduler_loop());
    tokio::spawn(state.strategy_router.clone().run_square_off_loop());
    tokio::spawn(state.trade_monitor.clone().run_sync_flush_loop());

    let forced_logout_time = state.runtime_config.read().forced_logout_time.clone();
    let market_timezone = state.runtime_config.read().market_timezone.clone();
    tokio::spawn(auth_gate::run_forced_logout_loop(
        state.auth_gate.clone(),
        forced_logout_time,
        market_timezone,
    ));

    // ── REST API ──────────────────────────────────────────────────────────
    let bind_addr = std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let app = api::rest::router(api_state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "REST API listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "REST API server exited");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("aurora-bridge shut down complete");
    Ok(())
}
