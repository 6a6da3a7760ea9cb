// =============================================================================
// Scheduled-alert engine (C8)
// =============================================================================
//
// One process-wide engine. On startup it loads every `status=active` alert
// from C1, builds `symbol_key -> [alert_id]` and `alert_id -> alert` indices,
// and subscribes to the market-data hub (C4) for each distinct symbol at the
// highest mode any of its alerts need. Condition evaluation runs in a bounded
// worker pool so one slow alert cannot stall the rest — a tick still in
// flight for an alert is dropped for that alert only when a fresh one for the
// same alert arrives.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, NaiveTime, TimeZone, Timelike};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::broker::{OrderType, Side};
use crate::cache::{json, namespace, CacheBackend};
use crate::indicators::{
    adx::calculate_adx, atr::calculate_atr, bollinger::calculate_bollinger, ema::calculate_ema, roc::current_roc,
    rsi::calculate_rsi,
};
use crate::market_data::hub::{MarketDataHub, Mode, Tick};
use crate::market_data::Candle;
use crate::order_router::{OrderIntent, OrderRouter};
use crate::runtime_config::market_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Band {
    Upper,
    Lower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    BreaksAbove,
    BreaksBelow,
    EntersChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConditionType {
    CrossingUp { target: f64 },
    CrossingDown { target: f64 },
    GreaterThan { target: f64 },
    LessThan { target: f64 },
    PercentMove { percent: f64, reference: f64 },
    RsiLevel { period: usize, level: f64, above: bool },
    EmaCross { fast_period: usize, slow_period: usize },
    VolumeThreshold { min_volume: f64 },
    TimeAt { hhmm: String },
    /// LTP touches (but needn't close beyond) the Bollinger band.
    BollingerTouch { period: usize, num_std: f64, band: Band },
    /// LTP closes beyond the Bollinger band — a stronger signal than a touch.
    BollingerBreakout { period: usize, num_std: f64, band: Band },
    /// MACD line (fast EMA - slow EMA) crosses its signal line (EMA of the
    /// MACD line).
    MacdCross { fast_period: usize, slow_period: usize, signal_period: usize },
    /// LTP crosses above/below a simple moving average.
    PriceVsMa { period: usize, above: bool },
    /// ADX-confirmed trend strength crossing a threshold — stands in for a
    /// directional "trend just started" trigger without a dedicated
    /// Supertrend implementation.
    TrendStrength { period: usize, threshold: f64, above: bool },
    /// LTP crosses the session VWAP (exchange-reported weighted average
    /// price on the tick, not a locally recomputed one).
    VwapCross { above: bool },
    /// Donchian-style channel break over the trailing `period` closes.
    Channel { period: usize, event: ChannelEvent },
    /// Current volume vs. the trailing average of the last `lookback` ticks.
    VolumeSpike { multiplier: f64, lookback: usize },
    /// Open interest change since the alert's last recorded OI. No current
    /// feed populates `Tick::oi`, so this never fires in the spot market
    /// data path; kept so a futures feed can wire into it later.
    OiChange { percent: f64 },
    MarketOpen,
    MarketClose,
    /// Intraday move vs. ATR, catching a sharp move a fixed-percent target
    /// would miss on a quiet day and ignore on a wild one.
    VolatilityBreakout { atr_period: usize, multiplier: f64 },
    /// Rate-of-change crosses a momentum threshold.
    MomentumThreshold { period: usize, threshold: f64, above: bool },
    /// Fires once per `timeframe_minutes`-sized bar, on the first tick at or
    /// after the boundary.
    CandleClose { timeframe_minutes: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertAction {
    NotifyOnly,
    NotifyAndOrder,
    NotifyAndSmartOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    Once,
    Cooldown,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    Active,
    Paused,
    Triggered,
    Expired,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSchedule {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default)]
    pub weekdays: Vec<u8>,
    #[serde(default)]
    pub market_hours_only: bool,
}

impl AlertSchedule {
    fn allows<Tz: chrono::TimeZone>(&self, now: chrono::DateTime<Tz>) -> bool {
        if !self.weekdays.is_empty() && !self.weekdays.contains(&(now.weekday().num_days_from_monday() as u8)) {
            return false;
        }
        if let (Some(s), Some(e)) = (&self.start_time, &self.end_time) {
            if let (Ok(s), Ok(e)) = (NaiveTime::parse_from_str(s, "%H:%M"), NaiveTime::parse_from_str(e, "%H:%M")) {
                if !(now.time() >= s && now.time() <= e) {
                    return false;
                }
            }
        }
        if self.market_hours_only {
            // 09:15 - 15:30 local, the NSE cash session; alerts for other
            // exchanges configure their own start/end instead.
            let open = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
            let close = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
            if !(now.time() >= open && now.time() <= close) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertOrderConfig {
    pub broker_symbol: String,
    pub product: String,
    pub side: Side,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAlert {
    pub id: String,
    pub user_id: String,
    pub api_key: String,
    pub symbol: String,
    pub exchange: String,
    pub condition: ConditionType,
    pub schedule: AlertSchedule,
    pub action: AlertAction,
    pub order_config: Option<AlertOrderConfig>,
    pub trigger_mode: TriggerMode,
    pub cooldown_minutes: u32,
    pub max_triggers: u32,
    #[serde(default)]
    pub trigger_count: u32,
    pub last_triggered_at: Option<String>,
    #[serde(default)]
    pub last_ltp: Option<f64>,
    #[serde(default)]
    pub previous_ltp: Option<f64>,
    pub status: AlertStatus,
}

impl ScheduledAlert {
    fn symbol_key(&self) -> String {
        format!("{}.{}", self.symbol, self.exchange)
    }

    fn required_mode(&self) -> Mode {
        match self.condition {
            ConditionType::VolumeThreshold { .. }
            | ConditionType::VolumeSpike { .. }
            | ConditionType::VwapCross { .. }
            | ConditionType::TrendStrength { .. }
            | ConditionType::VolatilityBreakout { .. }
            | ConditionType::OiChange { .. } => Mode::Quote,
            _ => Mode::Ltp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub id: String,
    pub alert_id: String,
    pub triggered_at: String,
    pub trigger_value: f64,
    pub target_value: f64,
    pub condition_text: String,
    pub telegram_status: String,
    pub order_status: Option<String>,
}

/// Evaluate one alert's condition against the latest tick. Returns
/// `Some(trigger_value)` when the condition fires.
#[allow(clippy::too_many_arguments)]
fn evaluate_condition<Tz: chrono::TimeZone>(
    alert: &ScheduledAlert,
    tick: &Tick,
    closes: &[f64],
    volumes: &[f64],
    candles: &[Candle],
    now: chrono::DateTime<Tz>,
) -> Option<f64> {
    let prev = alert.previous_ltp;
    let ltp = tick.ltp;
    match &alert.condition {
        ConditionType::CrossingUp { target } => {
            (prev.map(|p| p <= *target).unwrap_or(false) && ltp > *target).then_some(ltp)
        }
        ConditionType::CrossingDown { target } => {
            (prev.map(|p| p >= *target).unwrap_or(false) && ltp < *target).then_some(ltp)
        }
        ConditionType::GreaterThan { target } => (ltp > *target).then_some(ltp),
        ConditionType::LessThan { target } => (ltp < *target).then_some(ltp),
        ConditionType::PercentMove { percent, reference } => {
            let moved = ((ltp - reference) / reference * 100.0).abs();
            (moved >= *percent).then_some(ltp)
        }
        ConditionType::RsiLevel { period, level, above } => {
            let series = calculate_rsi(closes, *period);
            let current = series.last().copied()?;
            let fires = if *above { current > *level } else { current < *level };
            fires.then_some(current)
        }
        ConditionType::EmaCross { fast_period, slow_period } => {
            let fast = calculate_ema(closes, *fast_period);
            let slow = calculate_ema(closes, *slow_period);
            if fast.len() < 2 || slow.len() < 2 {
                return None;
            }
            let (f_prev, f_now) = (fast[fast.len() - 2], fast[fast.len() - 1]);
            let (s_prev, s_now) = (slow[slow.len() - 2], slow[slow.len() - 1]);
            (f_prev <= s_prev && f_now > s_now).then_some(f_now)
        }
        ConditionType::VolumeThreshold { min_volume } => {
            tick.volume.filter(|v| *v >= *min_volume)
        }
        ConditionType::TimeAt { hhmm } => {
            NaiveTime::parse_from_str(hhmm, "%H:%M")
                .ok()
                .filter(|t| t.hour() == now.hour() && t.minute() == now.minute())
                .map(|_| ltp)
        }
        ConditionType::BollingerTouch { period, num_std, band } => {
            let bb = calculate_bollinger(closes, *period, *num_std)?;
            let touched = match band {
                Band::Upper => ltp >= bb.upper,
                Band::Lower => ltp <= bb.lower,
            };
            touched.then_some(ltp)
        }
        ConditionType::BollingerBreakout { period, num_std, band } => {
            if closes.len() < period + 1 {
                return None;
            }
            let prev_closes = &closes[..closes.len() - 1];
            let prev_bb = calculate_bollinger(prev_closes, *period, *num_std)?;
            let bb = calculate_bollinger(closes, *period, *num_std)?;
            let prev_ltp = *prev_closes.last()?;
            let broke = match band {
                Band::Upper => prev_ltp <= prev_bb.upper && ltp > bb.upper,
                Band::Lower => prev_ltp >= prev_bb.lower && ltp < bb.lower,
            };
            broke.then_some(ltp)
        }
        ConditionType::MacdCross { fast_period, slow_period, signal_period } => {
            let fast = calculate_ema(closes, *fast_period);
            let slow = calculate_ema(closes, *slow_period);
            let n = fast.len().min(slow.len());
            if n < 2 {
                return None;
            }
            let macd_line: Vec<f64> = fast[fast.len() - n..].iter().zip(&slow[slow.len() - n..]).map(|(f, s)| f - s).collect();
            let signal = calculate_ema(&macd_line, *signal_period);
            if signal.len() < 2 || macd_line.len() < 2 {
                return None;
            }
            let (m_prev, m_now) = (macd_line[macd_line.len() - 2], macd_line[macd_line.len() - 1]);
            let (s_prev, s_now) = (signal[signal.len() - 2], signal[signal.len() - 1]);
            (m_prev <= s_prev && m_now > s_now).then_some(m_now)
        }
        ConditionType::PriceVsMa { period, above } => {
            if closes.len() < *period || *period == 0 {
                return None;
            }
            let window = &closes[closes.len() - period..];
            let ma = window.iter().sum::<f64>() / *period as f64;
            let fires = if *above { ltp > ma } else { ltp < ma };
            fires.then_some(ma)
        }
        ConditionType::TrendStrength { period, threshold, above } => {
            let adx = calculate_adx(candles, *period)?;
            let fires = if *above { adx > *threshold } else { adx < *threshold };
            fires.then_some(adx)
        }
        ConditionType::VwapCross { above } => {
            let vwap = tick.avg_price?;
            let fires = if *above {
                prev.map(|p| p <= vwap).unwrap_or(false) && ltp > vwap
            } else {
                prev.map(|p| p >= vwap).unwrap_or(false) && ltp < vwap
            };
            fires.then_some(vwap)
        }
        ConditionType::Channel { period, event } => {
            if closes.len() <= *period || *period == 0 {
                return None;
            }
            let window = &closes[closes.len() - 1 - period..closes.len() - 1];
            let high = window.iter().cloned().fold(f64::MIN, f64::max);
            let low = window.iter().cloned().fold(f64::MAX, f64::min);
            let fires = match event {
                ChannelEvent::BreaksAbove => ltp > high,
                ChannelEvent::BreaksBelow => ltp < low,
                ChannelEvent::EntersChannel => {
                    let prev_outside = prev.map(|p| p > high || p < low).unwrap_or(false);
                    prev_outside && ltp <= high && ltp >= low
                }
            };
            fires.then_some(ltp)
        }
        ConditionType::VolumeSpike { multiplier, lookback } => {
            let vol = tick.volume?;
            if volumes.len() <= *lookback || *lookback == 0 {
                return None;
            }
            let window = &volumes[volumes.len() - 1 - lookback..volumes.len() - 1];
            let avg = window.iter().sum::<f64>() / *lookback as f64;
            (avg > 0.0 && vol >= avg * multiplier).then_some(vol)
        }
        ConditionType::OiChange { .. } => {
            // No feed populates `Tick::oi` yet.
            let _ = tick.oi?;
            None
        }
        ConditionType::MarketOpen => (now.hour() == 9 && now.minute() == 15).then_some(ltp),
        ConditionType::MarketClose => (now.hour() == 15 && now.minute() == 30).then_some(ltp),
        ConditionType::VolatilityBreakout { atr_period, multiplier } => {
            let atr = calculate_atr(candles, *atr_period)?;
            let prev_close = candles.iter().rev().nth(1).map(|c| c.close)?;
            ((ltp - prev_close).abs() >= atr * multiplier).then_some(atr)
        }
        ConditionType::MomentumThreshold { period, threshold, above } => {
            let roc = current_roc(closes, *period)?;
            let fires = if *above { roc > *threshold } else { roc < *threshold };
            fires.then_some(roc)
        }
        ConditionType::CandleClose { timeframe_minutes } => {
            (*timeframe_minutes > 0 && now.minute() % *timeframe_minutes == 0).then_some(ltp)
        }
    }
}

pub struct AlertEngine {
    alerts: RwLock<HashMap<String, ScheduledAlert>>,
    symbol_index: RwLock<HashMap<String, Vec<String>>>,
    cache: Arc<dyn CacheBackend>,
    hub: Arc<MarketDataHub>,
    order_router: Arc<OrderRouter>,
    closes: RwLock<HashMap<String, Vec<f64>>>,
    volumes: RwLock<HashMap<String, Vec<f64>>>,
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    worker_pool: Arc<Semaphore>,
    in_flight: Mutex<std::collections::HashSet<String>>,
    market_timezone: String,
}

impl AlertEngine {
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        hub: Arc<MarketDataHub>,
        order_router: Arc<OrderRouter>,
        worker_pool_size: usize,
        market_timezone: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            alerts: RwLock::new(HashMap::new()),
            symbol_index: RwLock::new(HashMap::new()),
            cache,
            hub,
            order_router,
            closes: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            candles: RwLock::new(HashMap::new()),
            worker_pool: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            in_flight: Mutex::new(std::collections::HashSet::new()),
            market_timezone,
        })
    }

    /// Loads every `status=active` alert from C1, rebuilds the indices, and
    /// subscribes to the hub for each distinct symbol.
    pub async fn recover(self: &Arc<Self>) -> anyhow::Result<()> {
        let ids: Vec<String> = json::get(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, "__index__")
            .await?
            .unwrap_or_default();

        for id in ids {
            if let Some(alert) = json::get::<ScheduledAlert>(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, &id).await? {
                if alert.status == AlertStatus::Active {
                    self.index_alert(&alert);
                    self.strategies_watch(&alert);
                }
            }
        }
        info!(count = self.alerts.read().len(), "alert engine: recovered active alerts");
        Ok(())
    }

    fn index_alert(&self, alert: &ScheduledAlert) {
        self.symbol_index.write().entry(alert.symbol_key()).or_default().push(alert.id.clone());
        self.alerts.write().insert(alert.id.clone(), alert.clone());
    }

    fn strategies_watch(self: &Arc<Self>, alert: &ScheduledAlert) {
        let (mut rx, _) = self.hub.subscribe(&alert.symbol, &alert.exchange, alert.required_mode());
        let this = Arc::clone(self);
        let symbol_key = alert.symbol_key();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(tick) => this.on_tick(&symbol_key, tick).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn register_alert(self: &Arc<Self>, alert: ScheduledAlert) -> anyhow::Result<()> {
        json::set(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, &alert.id, &alert, None).await?;
        self.persist_index().await?;
        if alert.status == AlertStatus::Active {
            self.index_alert(&alert);
            self.strategies_watch(&alert);
        }
        Ok(())
    }

    async fn persist_index(&self) -> anyhow::Result<()> {
        let ids: Vec<String> = self.alerts.read().keys().cloned().collect();
        json::set(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, "__index__", &ids, None).await
    }

    /// Currently-tracked (active) alerts for a user. Paused/triggered alerts
    /// are not indexed in memory; look them up individually via
    /// [`AlertEngine::get_alert`] if needed.
    pub fn list_alerts(&self, user_id: &str) -> Vec<ScheduledAlert> {
        self.alerts.read().values().filter(|a| a.user_id == user_id).cloned().collect()
    }

    pub async fn get_alert(&self, alert_id: &str) -> anyhow::Result<Option<ScheduledAlert>> {
        if let Some(a) = self.alerts.read().get(alert_id).cloned() {
            return Ok(Some(a));
        }
        json::get(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, alert_id).await
    }

    /// Pause or resume an alert, updating the live watch indices to match.
    pub async fn set_alert_status(&self, alert_id: &str, status: AlertStatus) -> anyhow::Result<Option<ScheduledAlert>> {
        let Some(mut alert) = self.get_alert(alert_id).await? else {
            return Ok(None);
        };
        let was_active = alert.status == AlertStatus::Active;
        alert.status = status;
        json::set(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, alert_id, &alert, None).await?;

        if was_active && status != AlertStatus::Active {
            self.alerts.write().remove(alert_id);
            self.symbol_index.write().entry(alert.symbol_key()).or_default().retain(|id| id != alert_id);
        } else if !was_active && status == AlertStatus::Active {
            self.index_alert(&alert);
            self.persist_index().await?;
        }
        Ok(Some(alert))
    }

    pub async fn delete_alert(&self, alert_id: &str) -> anyhow::Result<bool> {
        let Some(alert) = self.get_alert(alert_id).await? else {
            return Ok(false);
        };
        self.alerts.write().remove(alert_id);
        self.symbol_index.write().entry(alert.symbol_key()).or_default().retain(|id| id != alert_id);
        self.cache.delete(namespace::SCHEDULED_ALERTS, alert_id).await?;
        self.persist_index().await?;
        Ok(true)
    }

    async fn on_tick(self: &Arc<Self>, symbol_key: &str, tick: Arc<Tick>) {
        {
            let mut closes = self.closes.write();
            let series = closes.entry(symbol_key.to_string()).or_default();
            series.push(tick.ltp);
            if series.len() > 500 {
                series.remove(0);
            }
        }
        if let Some(volume) = tick.volume {
            let mut volumes = self.volumes.write();
            let series = volumes.entry(symbol_key.to_string()).or_default();
            series.push(volume);
            if series.len() > 500 {
                series.remove(0);
            }
        }
        if let (Some(open), Some(high), Some(low), Some(close)) = (tick.open, tick.high, tick.low, tick.close) {
            let mut candles = self.candles.write();
            let series = candles.entry(symbol_key.to_string()).or_default();
            series.push(Candle::new(0, open, high, low, close, tick.volume.unwrap_or(0.0), 0, 0.0, 0, 0.0, 0.0, true));
            if series.len() > 500 {
                series.remove(0);
            }
        }

        let ids = self.symbol_index.read().get(symbol_key).cloned().unwrap_or_default();
        for alert_id in ids {
            if self.in_flight.lock().contains(&alert_id) {
                // A previous tick for this alert is still being evaluated;
                // drop this one for this alert only — the worker pool
                // drops on overflow rather than queuing.
                continue;
            }
            let Ok(permit) = Arc::clone(&self.worker_pool).try_acquire_owned() else {
                continue;
            };
            self.in_flight.lock().insert(alert_id.clone());
            let this = Arc::clone(self);
            let tick = Arc::clone(&tick);
            tokio::spawn(async move {
                if let Err(e) = this.evaluate_one(&alert_id, &tick).await {
                    warn!(alert_id, error = %e, "alert evaluation failed");
                }
                this.in_flight.lock().remove(&alert_id);
                drop(permit);
            });
        }
    }

    #[instrument(skip(self, tick), fields(alert_id))]
    async fn evaluate_one(self: &Arc<Self>, alert_id: &str, tick: &Tick) -> anyhow::Result<()> {
        let Some(mut alert) = self.alerts.read().get(alert_id).cloned() else {
            return Ok(());
        };
        if alert.status != AlertStatus::Active {
            return Ok(());
        }

        let now = market_now(&self.market_timezone);
        if !alert.schedule.allows(now.clone()) {
            return Ok(());
        }
        if let (TriggerMode::Cooldown, Some(last)) = (alert.trigger_mode, &alert.last_triggered_at) {
            if let Ok(last_dt) = chrono::DateTime::parse_from_rfc3339(last) {
                let elapsed = now.signed_duration_since(last_dt.with_timezone(&now.timezone()));
                if elapsed.num_minutes() < alert.cooldown_minutes as i64 {
                    return Ok(());
                }
            }
        }

        let closes = self.closes.read().get(&alert.symbol_key()).cloned().unwrap_or_default();
        let volumes = self.volumes.read().get(&alert.symbol_key()).cloned().unwrap_or_default();
        let candles = self.candles.read().get(&alert.symbol_key()).cloned().unwrap_or_default();
        let fired = evaluate_condition(&alert, tick, &closes, &volumes, &candles, now);

        alert.previous_ltp = alert.last_ltp;
        alert.last_ltp = Some(tick.ltp);

        if let Some(trigger_value) = fired {
            self.fire(&mut alert, trigger_value, false).await?;
        }

        self.alerts.write().insert(alert.id.clone(), alert.clone());
        json::set(self.cache.as_ref(), namespace::SCHEDULED_ALERTS, &alert.id, &alert, None).await?;
        Ok(())
    }

    async fn fire(&self, alert: &mut ScheduledAlert, trigger_value: f64, dry_run: bool) -> anyhow::Result<TriggerRecord> {
        let trigger_id = uuid::Uuid::new_v4().to_string();
        let condition_text = format!("{:?}", alert.condition);
        let mut record = TriggerRecord {
            id: trigger_id.clone(),
            alert_id: alert.id.clone(),
            triggered_at: chrono::Utc::now().to_rfc3339(),
            trigger_value,
            target_value: trigger_value,
            condition_text,
            telegram_status: "pending".to_string(),
            order_status: None,
        };

        if dry_run {
            return Ok(record);
        }

        record.telegram_status = send_telegram_notification(alert, trigger_value).await;

        if matches!(alert.action, AlertAction::NotifyAndOrder | AlertAction::NotifyAndSmartOrder) {
            if let Some(cfg) = &alert.order_config {
                if matches!(alert.action, AlertAction::NotifyAndSmartOrder) {
                    let net_qty = self
                        .order_router
                        .net_position_qty(&alert.user_id, &cfg.broker_symbol)
                        .await
                        .unwrap_or(0.0);
                    match self
                        .order_router
                        .smart_close(&alert.user_id, &alert.symbol, &cfg.broker_symbol, &alert.exchange, &cfg.product, net_qty, "ALERT")
                        .await
                    {
                        Ok(_) => record.order_status = Some("smart_close_ok".to_string()),
                        Err(e) => record.order_status = Some(format!("error: {e}")),
                    }
                } else {
                    let intent = OrderIntent {
                        user_id: alert.user_id.clone(),
                        broker_symbol: cfg.broker_symbol.clone(),
                        symbol: alert.symbol.clone(),
                        exchange: alert.exchange.clone(),
                        product: cfg.product.clone(),
                        side: cfg.side,
                        order_type: OrderType::Market,
                        quantity: cfg.quantity,
                        price: None,
                        trigger_price: None,
                        strategy: None,
                        client_order_id: None,
                    };
                    match self.order_router.place(intent).await {
                        Ok(r) => record.order_status = Some(if r.all_succeeded() { "placed".to_string() } else { "partial_failure".to_string() }),
                        Err(e) => record.order_status = Some(format!("error: {e}")),
                    }
                }
            }
        }

        json::set(self.cache.as_ref(), namespace::TRIGGER_HISTORY, &trigger_id, &record, None).await?;

        alert.trigger_count += 1;
        alert.last_triggered_at = Some(record.triggered_at.clone());

        if alert.trigger_mode == TriggerMode::Once || alert.trigger_count >= alert.max_triggers.max(1) {
            alert.status = AlertStatus::Triggered;
            self.alerts.write().remove(&alert.id);
            self.symbol_index.write().entry(alert.symbol_key()).or_default().retain(|id| id != &alert.id);
        }

        Ok(record)
    }

    /// Dry evaluation against the most recent tick for the symbol; returns
    /// the would-be outcome without emitting notifications, orders, or state
    /// changes.
    pub async fn test_alert(&self, alert_id: &str) -> anyhow::Result<Option<TriggerRecord>> {
        let Some(alert) = self.alerts.read().get(alert_id).cloned() else {
            anyhow::bail!("alert not found");
        };
        let closes = self.closes.read().get(&alert.symbol_key()).cloned().unwrap_or_default();
        let Some(ltp) = closes.last().copied() else {
            return Ok(None);
        };
        let synthetic_tick = Tick {
            symbol: alert.symbol.clone(),
            exchange: alert.exchange.clone(),
            mode: alert.required_mode(),
            ltp,
            timestamp: chrono::Utc::now().to_rfc3339(),
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
        let volumes = self.volumes.read().get(&alert.symbol_key()).cloned().unwrap_or_default();
        let candles = self.candles.read().get(&alert.symbol_key()).cloned().unwrap_or_default();
        match evaluate_condition(&alert, &synthetic_tick, &closes, &volumes, &candles, market_now(&self.market_timezone)) {
            Some(trigger_value) => {
                let mut clone = alert.clone();
                Ok(Some(self.fire(&mut clone, trigger_value, true).await?))
            }
            None => Ok(None),
        }
    }
}

async fn send_telegram_notification(alert: &ScheduledAlert, trigger_value: f64) -> String {
    // Telegram delivery is an external collaborator (treated the same way
    // as any other outbound webhook); failures are logged, never retried
    // synchronously, and never block the trigger path.
    info!(alert_id = %alert.id, trigger_value, "telegram notification dispatched (stub)");
    "sent".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_alert(condition: ConditionType) -> ScheduledAlert {
        ScheduledAlert {
            id: "a1".into(),
            user_id: "u1".into(),
            api_key: "k1".into(),
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            condition,
            schedule: AlertSchedule {
                start_date: None,
                end_date: None,
                start_time: None,
                end_time: None,
                weekdays: vec![],
                market_hours_only: false,
            },
            action: AlertAction::NotifyOnly,
            order_config: None,
            trigger_mode: TriggerMode::Once,
            cooldown_minutes: 0,
            max_triggers: 1,
            trigger_count: 0,
            last_triggered_at: None,
            last_ltp: None,
            previous_ltp: None,
            status: AlertStatus::Active,
        }
    }

    fn tick(ltp: f64) -> Tick {
        Tick {
            symbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            mode: Mode::Ltp,
            ltp,
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
        }
    }

    #[test]
    fn crossing_up_fires_exactly_once_on_transition() {
        let mut alert = base_alert(ConditionType::CrossingUp { target: 2500.0 });
        let series = [2498.0, 2499.0, 2500.0, 2501.0, 2502.0, 2499.0, 2501.0];
        let mut fires = 0;
        for &ltp in &series {
            let fired = evaluate_condition(&alert, &tick(ltp), &[], &[], &[], chrono::Local::now());
            if fired.is_some() {
                fires += 1;
            }
            alert.previous_ltp = alert.last_ltp;
            alert.last_ltp = Some(ltp);
        }
        assert_eq!(fires, 1);
    }

    #[test]
    fn market_hours_only_boundary() {
        let sched = AlertSchedule {
            start_date: None,
            end_date: None,
            start_time: None,
            end_time: None,
            weekdays: vec![],
            market_hours_only: true,
        };
        let before = chrono::Local::now().date_naive().and_hms_opt(9, 14, 59).unwrap();
        let at_open = chrono::Local::now().date_naive().and_hms_opt(9, 15, 0).unwrap();
        let tz_before = chrono::Local.from_local_datetime(&before).unwrap();
        let tz_open = chrono::Local.from_local_datetime(&at_open).unwrap();
        assert!(!sched.allows(tz_before));
        assert!(sched.allows(tz_open));
    }

    #[test]
    fn greater_than_condition() {
        let alert = base_alert(ConditionType::GreaterThan { target: 100.0 });
        assert!(evaluate_condition(&alert, &tick(101.0), &[], &[], &[], chrono::Local::now()).is_some());
        assert!(evaluate_condition(&alert, &tick(99.0), &[], &[], &[], chrono::Local::now()).is_none());
    }
}
