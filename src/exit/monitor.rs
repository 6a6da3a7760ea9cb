// =============================================================================
// Trade monitor (C9) — background exit-evaluation loop
// =============================================================================
//
// Generalises the base engine's `run_exit_monitor` + `position_engine.rs`
// pair: instead of one polling loop over a flat position vector, one task is
// spawned per distinct `symbol_key` the moment the first active trade on it
// is registered, driven directly by `MarketDataHub` ticks rather than a fixed
// 5s poll. The ratcheting trailing-stop math itself lives on `ActiveTrade`
// (see `active_trade.rs`) — this module is the orchestration layer: dispatch
// ticks, evaluate portfolio risk, persist state, and recover on restart.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::active_trade::{ActiveTrade, ExitReason, SharedActiveTradeStore, TradeStatus};
use crate::cache::{namespace, CacheBackend};
use crate::market_data::hub::{MarketDataHub, Mode, Tick};
use crate::order_router::OrderRouter;

const INDEX_KEY: &str = "__index__";
const SYNC_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Portfolio-level risk configuration for a strategy ("Portfolio
/// monitoring"), looked up on demand via `portfolio_lookup` rather than
/// owned here — the trade monitor must not hold a copy of strategy state,
/// mirroring the indirection `OrderRouter` already uses for broker lookup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortfolioRiskConfig {
    pub allocated_funds: f64,
    pub sl_amount: Option<f64>,
    pub sl_percent: Option<f64>,
    pub target_amount: Option<f64>,
    pub target_percent: Option<f64>,
    pub trailing_amount: Option<f64>,
    pub trailing_percent: Option<f64>,
}

impl PortfolioRiskConfig {
    fn sl_threshold(&self) -> Option<f64> {
        self.sl_amount
            .or_else(|| self.sl_percent.map(|p| self.allocated_funds * p / 100.0))
    }

    fn target_threshold(&self) -> Option<f64> {
        self.target_amount
            .or_else(|| self.target_percent.map(|p| self.allocated_funds * p / 100.0))
    }

    fn trailing_amount(&self) -> Option<f64> {
        self.trailing_amount
            .or_else(|| self.trailing_percent.map(|p| self.allocated_funds * p / 100.0))
    }
}

pub type PortfolioLookup = Arc<dyn Fn(&str) -> Option<PortfolioRiskConfig> + Send + Sync>;

pub struct TradeMonitor {
    store: SharedActiveTradeStore,
    hub: Arc<MarketDataHub>,
    cache: Arc<dyn CacheBackend>,
    order_router: Arc<OrderRouter>,
    portfolio_lookup: PortfolioLookup,
    /// Highest aggregate strategy P&L observed so far today, kept
    /// monotonic across the trading day and not reset on partial exits.
    portfolio_peak: RwLock<HashMap<String, f64>>,
    watched_symbol_keys: Mutex<HashSet<String>>,
    /// Latest LTP observed per `symbol_key`, used as the entry-price
    /// approximation when a `pending_entry` trade's order fills — no broker
    /// client exposes an average-fill price for a plain market order beyond
    /// its raw ack, so the fill is confirmed by the order dropping out of
    /// the open-orders list and priced at the most recent tick.
    last_ltp: RwLock<HashMap<String, f64>>,
}

const ENTRY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ENTRY_POLL_TIMEOUT: Duration = Duration::from_secs(120);

impl TradeMonitor {
    pub fn new(
        store: SharedActiveTradeStore,
        hub: Arc<MarketDataHub>,
        cache: Arc<dyn CacheBackend>,
        order_router: Arc<OrderRouter>,
        portfolio_lookup: PortfolioLookup,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            cache,
            order_router,
            portfolio_lookup,
            portfolio_peak: RwLock::new(HashMap::new()),
            watched_symbol_keys: Mutex::new(HashSet::new()),
            last_ltp: RwLock::new(HashMap::new()),
        })
    }

    /// Register a trade seeded at order placement time: insert it
    /// into the store, persist it, ensure a tick-consuming task is running
    /// for its `symbol_key`, and if it is still `pending_entry` spawn a
    /// background poll that activates it once the broker confirms the fill.
    pub async fn register(self: &Arc<Self>, trade: ActiveTrade) -> anyhow::Result<()> {
        let symbol = trade.symbol.clone();
        let exchange = trade.exchange.clone();
        let id = trade.id.clone();
        let pending = trade.status == TradeStatus::PendingEntry;
        self.watch_symbol_key(&symbol, &exchange);
        self.store.insert(trade);
        self.persist_index().await?;
        if let Some(t) = self.store.get(&id) {
            self.persist_trade(&t).await?;
        }
        if pending {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.await_fill_and_activate(id).await });
        }
        Ok(())
    }

    /// Poll broker-reported open orders until the entry order disappears
    /// (filled or cancelled upstream), then transition the trade to
    /// `active` priced at the most recent tick. Gives up silently after
    /// `ENTRY_POLL_TIMEOUT` — the trade stays `pending_entry` and a later
    /// reconciliation pass / manual review picks it up.
    async fn await_fill_and_activate(self: Arc<Self>, trade_id: String) {
        let Some(trade) = self.store.get(&trade_id) else { return };
        let deadline = tokio::time::Instant::now() + ENTRY_POLL_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                warn!(trade_id, "trade monitor: entry fill poll timed out, leaving pending_entry");
                return;
            }
            tokio::time::sleep(ENTRY_POLL_INTERVAL).await;
            let still_open = self
                .order_router
                .order_still_open(&trade.user_id, &trade.broker_symbol, &trade.entry_broker_order_id)
                .await
                .unwrap_or(true);
            if still_open {
                continue;
            }
            let entry_price = self
                .last_ltp
                .read()
                .get(&trade.symbol_key())
                .copied()
                .unwrap_or(trade.entry_price);
            self.store.update(&trade_id, |t| t.mark_filled(entry_price));
            if let Some(updated) = self.store.get(&trade_id) {
                info!(trade_id, entry_price, "trade monitor: entry confirmed, trade is now active");
                if let Err(e) = self.persist_trade(&updated).await {
                    error!(trade_id, error = %e, "trade monitor: failed to persist activated trade");
                }
            }
            return;
        }
    }

    fn watch_symbol_key(self: &Arc<Self>, symbol: &str, exchange: &str) {
        let key = format!("{symbol}.{exchange}");
        let mut watched = self.watched_symbol_keys.lock();
        if watched.contains(&key) {
            return;
        }
        watched.insert(key);
        let (mut rx, _is_new) = self.hub.subscribe(symbol, exchange, Mode::Ltp);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => this.on_tick(&tick).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "trade monitor: lagged behind tick stream, continuing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    #[instrument(skip(self, tick), fields(symbol = %tick.symbol, exchange = %tick.exchange))]
    async fn on_tick(self: &Arc<Self>, tick: &Tick) {
        let symbol_key = format!("{}.{}", tick.symbol, tick.exchange);
        self.last_ltp.write().insert(symbol_key.clone(), tick.ltp);
        let ids = self.store.ids_for_symbol_key(&symbol_key);
        if ids.is_empty() {
            return;
        }

        let mut individually_exited = HashSet::new();
        for id in &ids {
            let outcome = self.store.update(id, |t| t.evaluate_tick(tick.ltp));
            if let Some(Some(reason)) = outcome {
                individually_exited.insert(id.clone());
                if let Err(e) = self.handle_exit(id, reason).await {
                    error!(trade_id = %id, error = %e, "trade monitor: exit handling failed");
                }
            }
        }

        let mut strategies_touched = HashSet::new();
        for id in &ids {
            if individually_exited.contains(id) {
                continue;
            }
            if let Some(trade) = self.store.get(id) {
                if (self.portfolio_lookup)(&trade.strategy_id).is_some() {
                    strategies_touched.insert(trade.strategy_id);
                }
            }
        }
        for strategy_id in strategies_touched {
            if let Err(e) = self.evaluate_portfolio(&strategy_id, &individually_exited).await {
                error!(strategy_id, error = %e, "trade monitor: portfolio evaluation failed");
            }
        }
    }

    async fn evaluate_portfolio(&self, strategy_id: &str, excluded: &HashSet<String>) -> anyhow::Result<()> {
        let Some(cfg) = (self.portfolio_lookup)(strategy_id) else {
            return Ok(());
        };
        let trades: Vec<ActiveTrade> = self
            .store
            .for_strategy_active(strategy_id)
            .into_iter()
            .filter(|t| !excluded.contains(&t.id))
            .collect();
        if trades.is_empty() {
            return Ok(());
        }

        let aggregate_pnl: f64 = trades.iter().map(|t| t.unrealized_pnl()).sum();
        let peak = {
            let mut peaks = self.portfolio_peak.write();
            let entry = peaks.entry(strategy_id.to_string()).or_insert(aggregate_pnl);
            if aggregate_pnl > *entry {
                *entry = aggregate_pnl;
            }
            *entry
        };

        let reason = if cfg.sl_threshold().is_some_and(|sl| aggregate_pnl <= -sl) {
            Some(ExitReason::PortfolioSl)
        } else if cfg.target_threshold().is_some_and(|tg| aggregate_pnl >= tg) {
            Some(ExitReason::PortfolioTarget)
        } else if let Some(trail) = cfg.trailing_amount() {
            let trailing_level = peak - trail;
            if aggregate_pnl <= trailing_level {
                Some(ExitReason::PortfolioTrailingSl)
            } else {
                None
            }
        } else {
            None
        };

        let Some(reason) = reason else { return Ok(()) };
        warn!(strategy_id, reason = reason.tag(), aggregate_pnl, "portfolio exit triggered");
        for trade in &trades {
            if let Err(e) = self.handle_exit(&trade.id, reason).await {
                error!(trade_id = %trade.id, error = %e, "trade monitor: portfolio exit failed for trade");
            }
        }
        Ok(())
    }

    async fn handle_exit(&self, trade_id: &str, reason: ExitReason) -> anyhow::Result<()> {
        let Some(trade) = self.store.get(trade_id) else {
            return Ok(());
        };
        let net_qty = match trade.side {
            crate::active_trade::Side::Long => trade.quantity,
            crate::active_trade::Side::Short => -trade.quantity,
        };
        let close_result = self
            .order_router
            .smart_close(
                &trade.user_id,
                &trade.symbol,
                &trade.broker_symbol,
                &trade.exchange,
                &trade.product,
                net_qty,
                reason.tag(),
            )
            .await?;
        let exit_order_id = close_result.and_then(|r| r.legs.first().and_then(|l| l.broker_order_id.clone()));

        self.store.update(trade_id, |t| t.close(reason, exit_order_id));
        if let Some(updated) = self.store.get(trade_id) {
            self.persist_trade(&updated).await?;
        }
        Ok(())
    }

    async fn persist_trade(&self, trade: &ActiveTrade) -> anyhow::Result<()> {
        crate::cache::json::set(self.cache.as_ref(), namespace::ACTIVE_TRADES, &trade.id, trade, None).await
    }

    async fn persist_index(&self) -> anyhow::Result<()> {
        let ids = self.store.all_ids();
        crate::cache::json::set(self.cache.as_ref(), namespace::ACTIVE_TRADES, INDEX_KEY, &ids, None).await
    }

    /// Sync-flush loop: every 30s, persist every active trade's
    /// mutable fields. Individual trigger/status transitions are already
    /// flushed synchronously in `handle_exit`.
    pub async fn run_sync_flush_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(SYNC_FLUSH_INTERVAL).await;
            for trade in self.store.all_active() {
                if let Err(e) = self.persist_trade(&trade).await {
                    error!(trade_id = %trade.id, error = %e, "trade monitor: sync flush failed");
                }
            }
        }
    }

    /// Recovery: load every `status=active` trade from C1, rebuild
    /// indices, re-subscribe, then validate against broker-reported
    /// positions via the order router.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<()> {
        let ids: Vec<String> =
            crate::cache::json::get(self.cache.as_ref(), namespace::ACTIVE_TRADES, INDEX_KEY)
                .await?
                .unwrap_or_default();

        let mut restored = 0usize;
        let mut externally_closed = 0usize;
        for id in ids {
            let Some(trade): Option<ActiveTrade> =
                crate::cache::json::get(self.cache.as_ref(), namespace::ACTIVE_TRADES, &id).await?
            else {
                continue;
            };
            if trade.status != TradeStatus::Active {
                continue;
            }

            let net_qty = self
                .order_router
                .net_position_qty(&trade.user_id, &trade.broker_symbol)
                .await
                .unwrap_or(trade.quantity);

            self.watch_symbol_key(&trade.symbol, &trade.exchange);
            let trade_id = trade.id.clone();
            self.store.insert(trade);

            if net_qty.abs() < 1e-9 {
                self.store.update(&trade_id, |t| t.close(ExitReason::ExternallyClosed, None));
                warn!(trade_id, "trade monitor recovery: broker reports zero position, marked closed");
                externally_closed += 1;
                if let Some(updated) = self.store.get(&trade_id) {
                    self.persist_trade(&updated).await?;
                }
            } else {
                restored += 1;
            }
        }

        info!(restored, externally_closed, "trade monitor: recovery complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portfolio_sl_threshold_prefers_amount_over_percent() {
        let cfg = PortfolioRiskConfig {
            allocated_funds: 500_000.0,
            sl_amount: Some(10_000.0),
            sl_percent: Some(5.0),
            target_amount: None,
            target_percent: None,
            trailing_amount: None,
            trailing_percent: None,
        };
        assert_eq!(cfg.sl_threshold(), Some(10_000.0));
    }

    #[test]
    fn portfolio_sl_threshold_falls_back_to_percent_of_allocated() {
        let cfg = PortfolioRiskConfig {
            allocated_funds: 500_000.0,
            sl_amount: None,
            sl_percent: Some(2.0),
            target_amount: None,
            target_percent: None,
            trailing_amount: None,
            trailing_percent: None,
        };
        assert_eq!(cfg.sl_threshold(), Some(10_000.0));
    }
}
