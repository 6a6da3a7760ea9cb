// =============================================================================
// Active trade (C9) — server-side supervised position slice
// =============================================================================
//
// Generalises `position_engine.rs`'s `Position`/`PositionManager`: `side`
// becomes an enum instead of a string, the old TP1/TP2 partial-close ladder
// collapses to a single target (the base engine's two-tier take-profit has
// no counterpart here), and every record carries the (user, strategy) scope
// a single-account engine never needed. The ratcheting trailing-stop math is
// lifted directly from `position_engine.rs::update_price` — same "track the
// best price seen, only let the level move in the favourable direction"
// shape, generalised to points-or-percent instead of a single hardcoded
// percentage.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    /// Order placed, awaiting broker fill confirmation before entry price is known.
    PendingEntry,
    Active,
    Closed,
    SlHit,
    TargetHit,
    PortfolioExit,
    ForceClosed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingEntry => write!(f, "pending_entry"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
            Self::SlHit => write!(f, "sl_hit"),
            Self::TargetHit => write!(f, "target_hit"),
            Self::PortfolioExit => write!(f, "portfolio_exit"),
            Self::ForceClosed => write!(f, "force_closed"),
        }
    }
}

/// Trailing-stop configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum TrailingConfig {
    None,
    Points(f64),
    Percent(f64),
}

impl TrailingConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Outcome of a per-tick exit evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    Target,
    PortfolioSl,
    PortfolioTarget,
    PortfolioTrailingSl,
    ForceClosed,
    ExternallyClosed,
}

impl ExitReason {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::StopLoss => "SL",
            Self::Target => "TARGET",
            Self::PortfolioSl => "PORTFOLIO_SL",
            Self::PortfolioTarget => "PORTFOLIO_TARGET",
            Self::PortfolioTrailingSl => "PORTFOLIO_TRAILING_SL",
            Self::ForceClosed => "force_closed",
            Self::ExternallyClosed => "externally_closed",
        }
    }

    pub fn status(&self) -> TradeStatus {
        match self {
            Self::StopLoss => TradeStatus::SlHit,
            Self::Target => TradeStatus::TargetHit,
            Self::PortfolioSl | Self::PortfolioTarget | Self::PortfolioTrailingSl => {
                TradeStatus::PortfolioExit
            }
            Self::ForceClosed => TradeStatus::ForceClosed,
            Self::ExternallyClosed => TradeStatus::Closed,
        }
    }
}

/// Server-side supervised position slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTrade {
    pub id: String,
    pub user_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub exchange: String,
    pub product: String,
    pub broker_symbol: String,
    pub side: Side,
    pub quantity: f64,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub current_ltp: f64,
    pub stop_loss: Option<f64>,
    pub target: Option<f64>,
    #[serde(default = "default_trailing")]
    pub trailing: TrailingConfig,
    /// Highest LTP seen (LONG) / lowest LTP seen (SHORT) since entry.
    pub trailing_reference: Option<f64>,
    pub trailing_level: Option<f64>,
    pub status: TradeStatus,
    pub entry_broker_order_id: String,
    pub exit_order_id: Option<String>,
    pub realized_pnl: Option<f64>,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub close_reason: Option<String>,
}

fn default_trailing() -> TrailingConfig {
    TrailingConfig::None
}

impl ActiveTrade {
    pub fn new_pending_entry(
        id: String,
        user_id: String,
        strategy_id: String,
        symbol: String,
        exchange: String,
        product: String,
        broker_symbol: String,
        side: Side,
        quantity: f64,
        stop_loss: Option<f64>,
        target: Option<f64>,
        trailing: TrailingConfig,
        entry_broker_order_id: String,
    ) -> Self {
        Self {
            id,
            user_id,
            strategy_id,
            symbol,
            exchange,
            product,
            broker_symbol,
            side,
            quantity,
            entry_price: 0.0,
            current_ltp: 0.0,
            stop_loss,
            target,
            trailing,
            trailing_reference: None,
            trailing_level: None,
            status: TradeStatus::PendingEntry,
            entry_broker_order_id,
            exit_order_id: None,
            realized_pnl: None,
            opened_at: chrono::Utc::now().to_rfc3339(),
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn symbol_key(&self) -> String {
        format!("{}.{}", self.symbol, self.exchange)
    }

    /// Transition from `pending_entry` to `active` once the broker confirms
    /// the entry order filled.
    pub fn mark_filled(&mut self, entry_price: f64) {
        self.entry_price = entry_price;
        self.current_ltp = entry_price;
        self.trailing_reference = Some(entry_price);
        self.status = TradeStatus::Active;
    }

    pub fn direction(&self) -> f64 {
        match self.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.direction() * (self.current_ltp - self.entry_price) * self.quantity
    }

    /// Per-tick evaluation: checks stop-loss/target first, then
    /// ratchets the trailing level if neither fired. Only applicable while
    /// `status == Active`.
    pub fn evaluate_tick(&mut self, ltp: f64) -> Option<ExitReason> {
        self.current_ltp = ltp;
        if self.status != TradeStatus::Active {
            return None;
        }

        match self.side {
            Side::Long => {
                if let Some(sl) = self.stop_loss {
                    if ltp <= sl {
                        return Some(ExitReason::StopLoss);
                    }
                }
                if let Some(tg) = self.target {
                    if ltp >= tg {
                        return Some(ExitReason::Target);
                    }
                }
                self.update_trailing_long(ltp);
            }
            Side::Short => {
                if let Some(sl) = self.stop_loss {
                    if ltp >= sl {
                        return Some(ExitReason::StopLoss);
                    }
                }
                if let Some(tg) = self.target {
                    if ltp <= tg {
                        return Some(ExitReason::Target);
                    }
                }
                self.update_trailing_short(ltp);
            }
        }
        None
    }

    fn update_trailing_long(&mut self, ltp: f64) {
        if !self.trailing.is_enabled() {
            return;
        }
        let highest = self.trailing_reference.unwrap_or(self.entry_price);
        if ltp <= highest {
            return;
        }
        self.trailing_reference = Some(ltp);
        let new_level = match self.trailing {
            TrailingConfig::Points(pts) => ltp - pts,
            TrailingConfig::Percent(pct) => ltp * (1.0 - pct / 100.0),
            TrailingConfig::None => return,
        };
        let should_update = match self.trailing_level {
            Some(cur) => new_level > cur,
            None => true,
        };
        if should_update {
            self.trailing_level = Some(new_level);
            self.stop_loss = Some(new_level);
        }
    }

    fn update_trailing_short(&mut self, ltp: f64) {
        if !self.trailing.is_enabled() {
            return;
        }
        let lowest = self.trailing_reference.unwrap_or(self.entry_price);
        if ltp >= lowest {
            return;
        }
        self.trailing_reference = Some(ltp);
        let new_level = match self.trailing {
            TrailingConfig::Points(pts) => ltp + pts,
            TrailingConfig::Percent(pct) => ltp * (1.0 + pct / 100.0),
            TrailingConfig::None => return,
        };
        let should_update = match self.trailing_level {
            Some(cur) => new_level < cur,
            None => true,
        };
        if should_update {
            self.trailing_level = Some(new_level);
            self.stop_loss = Some(new_level);
        }
    }

    /// Apply a terminal exit. `realized_pnl` should be supplied once the exit
    /// order's fill price is known; callers that only have the order
    /// acknowledgement can pass `None` and backfill later via `close_with_pnl`.
    pub fn close(&mut self, reason: ExitReason, exit_order_id: Option<String>) {
        self.status = reason.status();
        self.exit_order_id = exit_order_id;
        self.close_reason = Some(reason.tag().to_string());
        self.closed_at = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn close_with_pnl(&mut self, reason: ExitReason, exit_order_id: Option<String>, realized_pnl: f64) {
        self.close(reason, exit_order_id);
        self.realized_pnl = Some(realized_pnl);
    }
}

/// In-memory index over active trades: by id and by `symbol_key`,
/// matching the base engine's single
/// `RwLock<Vec<Position>>` but split into two maps since trades are looked
/// up both individually (monitor ticks) and in bulk (portfolio evaluation,
/// strategy safety gate).
#[derive(Default)]
pub struct ActiveTradeStore {
    by_id: RwLock<HashMap<String, ActiveTrade>>,
    by_symbol_key: RwLock<HashMap<String, Vec<String>>>,
}

impl ActiveTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, trade: ActiveTrade) {
        let key = trade.symbol_key();
        let id = trade.id.clone();
        self.by_id.write().insert(id.clone(), trade);
        self.by_symbol_key.write().entry(key).or_default().push(id);
    }

    pub fn get(&self, id: &str) -> Option<ActiveTrade> {
        self.by_id.read().get(id).cloned()
    }

    /// Mutate a trade in place and return the exit reason, if any, the
    /// mutation produced. Returns `None` if the trade id is unknown.
    pub fn update<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut ActiveTrade) -> R,
    {
        let mut map = self.by_id.write();
        map.get_mut(id).map(f)
    }

    pub fn ids_for_symbol_key(&self, key: &str) -> Vec<String> {
        self.by_symbol_key.read().get(key).cloned().unwrap_or_default()
    }

    pub fn all_active(&self) -> Vec<ActiveTrade> {
        self.by_id
            .read()
            .values()
            .filter(|t| t.status == TradeStatus::Active)
            .cloned()
            .collect()
    }

    pub fn for_strategy_active(&self, strategy_id: &str) -> Vec<ActiveTrade> {
        self.by_id
            .read()
            .values()
            .filter(|t| t.strategy_id == strategy_id && t.status == TradeStatus::Active)
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: &str) -> Option<ActiveTrade> {
        let removed = self.by_id.write().remove(id);
        if let Some(t) = &removed {
            let key = t.symbol_key();
            if let Some(ids) = self.by_symbol_key.write().get_mut(&key) {
                ids.retain(|i| i != id);
            }
        }
        removed
    }

    /// All trades belonging to a user, any status — backs the portfolio
    /// REST endpoints (positionbook/holdings/tradebook), which have no
    /// other view onto server-supervised trades.
    pub fn for_user(&self, user_id: &str) -> Vec<ActiveTrade> {
        self.by_id
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn count_open_for_user(&self, user_id: &str) -> usize {
        self.by_id
            .read()
            .values()
            .filter(|t| t.user_id == user_id && matches!(t.status, TradeStatus::Active | TradeStatus::PendingEntry))
            .count()
    }

    /// All known trade ids, regardless of status — backs the app-level id
    /// index persisted alongside the trades themselves, since `CacheBackend`
    /// has no key-enumeration primitive of its own.
    pub fn all_ids(&self) -> Vec<String> {
        self.by_id.read().keys().cloned().collect()
    }
}

pub type SharedActiveTradeStore = Arc<ActiveTradeStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn long_trade(sl: Option<f64>, target: Option<f64>, trailing: TrailingConfig) -> ActiveTrade {
        let mut t = ActiveTrade::new_pending_entry(
            "t1".into(),
            "u1".into(),
            "s1".into(),
            "INFY".into(),
            "NSE".into(),
            "MIS".into(),
            "INFY".into(),
            Side::Long,
            10.0,
            sl,
            target,
            trailing,
            "bo1".into(),
        );
        t.mark_filled(1400.0);
        t
    }

    #[test]
    fn long_stop_loss_fires() {
        let mut t = long_trade(Some(1390.0), None, TrailingConfig::None);
        assert!(t.evaluate_tick(1395.0).is_none());
        assert_eq!(t.evaluate_tick(1389.0), Some(ExitReason::StopLoss));
    }

    #[test]
    fn long_target_fires() {
        let mut t = long_trade(None, Some(1420.0), TrailingConfig::None);
        assert_eq!(t.evaluate_tick(1420.0), Some(ExitReason::Target));
    }

    #[test]
    fn long_trailing_level_is_monotonically_non_decreasing() {
        let mut t = long_trade(None, None, TrailingConfig::Percent(0.5));
        let mut prev_level = f64::MIN;
        for ltp in [1405.0, 1410.0, 1415.0, 1412.0, 1408.0] {
            t.evaluate_tick(ltp);
            if let Some(level) = t.trailing_level {
                assert!(level >= prev_level, "trailing level must never decrease for LONG");
                prev_level = level;
            }
        }
        // Level never exceeds the best price seen minus the trail.
        assert!(t.trailing_level.unwrap() <= 1415.0);
    }

    #[test]
    fn long_trailing_exit_fires_once_ltp_crosses_ratcheted_level() {
        let mut t = long_trade(None, None, TrailingConfig::Percent(0.5));
        for ltp in [1405.0, 1410.0, 1415.0] {
            assert!(t.evaluate_tick(ltp).is_none());
        }
        let level = t.trailing_level.unwrap();
        assert!(t.evaluate_tick(level - 0.01) == Some(ExitReason::StopLoss));
    }

    #[test]
    fn short_trailing_level_is_monotonically_non_increasing() {
        let mut t = ActiveTrade::new_pending_entry(
            "t2".into(), "u1".into(), "s1".into(), "INFY".into(), "NSE".into(),
            "MIS".into(), "INFY".into(), Side::Short, 10.0, None, None,
            TrailingConfig::Percent(0.5), "bo2".into(),
        );
        t.mark_filled(1400.0);
        let mut prev_level = f64::MAX;
        for ltp in [1395.0, 1390.0, 1385.0, 1388.0] {
            t.evaluate_tick(ltp);
            if let Some(level) = t.trailing_level {
                assert!(level <= prev_level, "trailing level must never increase for SHORT");
                prev_level = level;
            }
        }
    }

    #[test]
    fn store_indexes_by_symbol_key_and_id() {
        let store = ActiveTradeStore::new();
        let t = long_trade(Some(1390.0), None, TrailingConfig::None);
        let key = t.symbol_key();
        store.insert(t);
        assert_eq!(store.ids_for_symbol_key(&key), vec!["t1".to_string()]);
        assert!(store.get("t1").is_some());
        assert_eq!(store.all_active().len(), 1);
    }

    #[test]
    fn store_update_mutates_in_place() {
        let store = ActiveTradeStore::new();
        store.insert(long_trade(Some(1390.0), None, TrailingConfig::None));
        let reason = store.update("t1", |t| t.evaluate_tick(1389.0));
        assert_eq!(reason, Some(Some(ExitReason::StopLoss)));
    }
}
