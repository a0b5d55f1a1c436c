// =============================================================================
// Alert Evaluator — threshold and indicator rules on closed 1m candles
// =============================================================================
//
// Holds the per-symbol active alert set (loaded from the store at startup,
// mutated only by explicit reload) and a sliding window of the most recent
// closed 1m candles per symbol for the RSI rules. Triggered alerts publish a
// notification event and fire a Telegram message; alerts stay active, so
// repeated triggers are expected.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::{error, info, warn};

use crate::bus::{MessageBus, SubscribeOpts};
use crate::indicators::calculate_rsi;
use crate::notify::TelegramNotifier;
use crate::types::{notification_subject, Candle};

/// RSI look-back used by the indicator rules.
const RSI_PERIOD: usize = 14;
/// Closed candles retained per symbol.
const BUFFER_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Alert model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    PriceAbove,
    PriceBelow,
    RsiOverbought,
    RsiOversold,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceAbove => "price_above",
            Self::PriceBelow => "price_below",
            Self::RsiOverbought => "rsi_overbought",
            Self::RsiOversold => "rsi_oversold",
        }
    }
}

impl std::str::FromStr for AlertKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "price_above" => Ok(Self::PriceAbove),
            "price_below" => Ok(Self::PriceBelow),
            "rsi_overbought" => Ok(Self::RsiOverbought),
            "rsi_oversold" => Ok(Self::RsiOversold),
            other => anyhow::bail!("unknown alert condition: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertCondition {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub kind: AlertKind,
    pub target_value: Decimal,
}

/// Decide whether one alert fires against a closed candle and the symbol's
/// recent closes (oldest first, including this candle).
pub fn evaluate(alert: &AlertCondition, candle: &Candle, closes: &[Decimal]) -> bool {
    match alert.kind {
        AlertKind::PriceAbove => candle.close >= alert.target_value,
        AlertKind::PriceBelow => candle.close <= alert.target_value,
        AlertKind::RsiOverbought => {
            closes.len() > RSI_PERIOD
                && latest_rsi(closes).is_some_and(|rsi| rsi >= alert.target_value)
        }
        AlertKind::RsiOversold => {
            closes.len() > RSI_PERIOD
                && latest_rsi(closes).is_some_and(|rsi| rsi <= alert.target_value)
        }
    }
}

fn latest_rsi(closes: &[Decimal]) -> Option<Decimal> {
    calculate_rsi(closes, RSI_PERIOD).last().copied()
}

// ---------------------------------------------------------------------------
// Per-symbol candle window
// ---------------------------------------------------------------------------

/// Sliding window of closed candles, ordered by window start, no duplicates.
/// A candle re-delivered for the current window replaces the stored one;
/// older windows are ignored.
#[derive(Default)]
pub struct CandleWindow {
    candles: VecDeque<Candle>,
}

impl CandleWindow {
    /// Fold in one candle and return the close series, oldest first.
    pub fn push(&mut self, candle: Candle) -> Vec<Decimal> {
        match self.candles.back() {
            Some(last) if candle.timestamp > last.timestamp => {
                self.candles.push_back(candle);
                if self.candles.len() > BUFFER_CAP {
                    self.candles.pop_front();
                }
            }
            Some(last) if candle.timestamp == last.timestamp => {
                *self.candles.back_mut().expect("non-empty window") = candle;
            }
            Some(_) => {} // Older than the buffer head — keep ordering intact.
            None => self.candles.push_back(candle),
        }
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Evaluator service
// ---------------------------------------------------------------------------

pub struct AlertEvaluator {
    pool: PgPool,
    bus: MessageBus,
    notifier: TelegramNotifier,
    alerts: RwLock<HashMap<String, Vec<AlertCondition>>>,
    buffers: Mutex<HashMap<String, CandleWindow>>,
}

impl AlertEvaluator {
    pub fn new(pool: PgPool, bus: MessageBus, notifier: TelegramNotifier) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            notifier,
            alerts: RwLock::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    /// Load the active alert set and subscribe to the 1m candle stream.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reload().await?;

        let evaluator = self.clone();
        self.bus.subscribe(
            "market.kline.1m.*",
            SubscribeOpts::ephemeral(),
            move |delivery| match serde_json::from_slice::<Candle>(&delivery.payload) {
                Ok(candle) => evaluator.on_candle(candle),
                Err(e) => {
                    error!(subject = %delivery.subject, error = %e, "unparseable candle dropped");
                }
            },
        );

        info!("alert evaluator started");
        Ok(())
    }

    /// Replace the in-memory alert set from the store.
    pub async fn reload(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT id, user_id, symbol, condition_type, target_value
             FROM alerts WHERE is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load active alerts")?;

        let mut by_symbol: HashMap<String, Vec<AlertCondition>> = HashMap::new();
        for row in rows {
            let condition_type: String = row.get("condition_type");
            let kind = match condition_type.parse::<AlertKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(error = %e, "skipping alert with unknown condition");
                    continue;
                }
            };
            let alert = AlertCondition {
                id: row.get("id"),
                user_id: row.get("user_id"),
                symbol: row.get("symbol"),
                kind,
                target_value: row.get("target_value"),
            };
            by_symbol.entry(alert.symbol.clone()).or_default().push(alert);
        }

        let count: usize = by_symbol.values().map(Vec::len).sum();
        *self.alerts.write() = by_symbol;
        info!(count, "active alerts loaded");
        Ok(())
    }

    fn on_candle(&self, candle: Candle) {
        let closes = {
            let mut buffers = self.buffers.lock();
            buffers
                .entry(candle.symbol.clone())
                .or_default()
                .push(candle.clone())
        };

        // Snapshot the symbol's alerts so no lock is held while publishing.
        let symbol_alerts = match self.alerts.read().get(&candle.symbol) {
            Some(alerts) => alerts.clone(),
            None => return,
        };

        for alert in &symbol_alerts {
            if evaluate(alert, &candle, &closes) {
                self.trigger(alert, &candle);
            }
        }
    }

    fn trigger(&self, alert: &AlertCondition, candle: &Candle) {
        info!(
            alert_id = alert.id,
            user_id = alert.user_id,
            symbol = %candle.symbol,
            kind = alert.kind.as_str(),
            price = %candle.close,
            "alert triggered"
        );

        let event = serde_json::json!({
            "type": "alert",
            "symbol": candle.symbol,
            "message": format!("{} triggered at {}", alert.kind.as_str(), candle.close),
            "time": candle.timestamp,
        });
        let subject = notification_subject(alert.user_id);
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&subject, payload) {
                    error!(subject = %subject, error = %e, "failed to publish notification");
                }
            }
            Err(e) => error!(error = %e, "failed to serialise notification"),
        }

        self.notifier.notify(
            alert.user_id,
            format!(
                "ALERT: {} {} triggered at {}",
                candle.symbol,
                alert.kind.as_str(),
                candle.close
            ),
        );
    }
}
