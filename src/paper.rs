// =============================================================================
// Paper Matching Engine — simulated orders filled against closed candles
// =============================================================================
//
// Open orders live in an in-memory per-symbol book (loaded from the store at
// startup) and are matched against every closed 1m candle:
//
//   market      — fills at the candle close
//   buy  limit  — fills at the limit when candle.low  <= limit
//   sell limit  — fills at the limit when candle.high >= limit
//
// Fills flow through a bounded channel into a settlement loop that commits
// batches of 50 (or whatever is pending after 500 ms) in one transaction:
// order row, balance delta, and position upsert with volume-weighted average
// entry. A failed commit loses the batch from the store while the in-memory
// book has already moved on — that gap is logged, not repaired.
// =============================================================================

use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::bus::{MessageBus, SubscribeOpts};
use crate::types::{Candle, Side};

// ---------------------------------------------------------------------------
// Order model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "market",
            Self::Limit => "limit",
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => anyhow::bail!("unknown order type: {other}"),
        }
    }
}

/// One open simulated order as held in the in-memory book.
#[derive(Debug, Clone, Serialize)]
pub struct OpenOrder {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Limit price; zero for market orders.
    pub price: Decimal,
    pub qty: Decimal,
    /// Set when the order is staged for settlement.
    pub filled_price: Decimal,
}

/// Placement request from the API layer.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: i64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub qty: Decimal,
}

/// Business-rule violations surfaced synchronously to the placement caller.
#[derive(Debug, Error)]
pub enum PlaceOrderError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("order quantity must be positive")]
    InvalidQuantity,
    #[error("limit orders require a positive price")]
    InvalidPrice,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Split `orders` into the fills produced by `candle` and the survivors.
/// Filled orders get their `filled_price` set.
fn match_orders(orders: Vec<OpenOrder>, candle: &Candle) -> (Vec<OpenOrder>, Vec<OpenOrder>) {
    let mut remaining = Vec::with_capacity(orders.len());
    let mut fills = Vec::new();

    for mut order in orders {
        let filled = match order.order_type {
            OrderType::Market => {
                order.filled_price = candle.close;
                true
            }
            OrderType::Limit => match order.side {
                Side::Buy if candle.low <= order.price => {
                    order.filled_price = order.price;
                    true
                }
                Side::Sell if candle.high >= order.price => {
                    order.filled_price = order.price;
                    true
                }
                _ => false,
            },
        };

        if filled {
            fills.push(order);
        } else {
            remaining.push(order);
        }
    }

    (remaining, fills)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct PaperEngine {
    pool: PgPool,
    bus: MessageBus,
    orders: Mutex<HashMap<String, Vec<OpenOrder>>>,
    fill_tx: mpsc::Sender<OpenOrder>,
    fill_rx: Mutex<Option<mpsc::Receiver<OpenOrder>>>,
    dropped_fills: AtomicU64,
    batch_size: usize,
    flush_interval: Duration,
}

impl PaperEngine {
    pub fn new(
        pool: PgPool,
        bus: MessageBus,
        batch_size: usize,
        flush_interval: Duration,
        queue_depth: usize,
    ) -> Arc<Self> {
        let (fill_tx, fill_rx) = mpsc::channel(queue_depth);
        Arc::new(Self {
            pool,
            bus,
            orders: Mutex::new(HashMap::new()),
            fill_tx,
            fill_rx: Mutex::new(Some(fill_rx)),
            dropped_fills: AtomicU64::new(0),
            batch_size,
            flush_interval,
        })
    }

    /// Load open orders, subscribe to 1m candles, start the settlement loop.
    pub async fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.load_open_orders().await?;

        let engine = self.clone();
        self.bus.subscribe(
            "market.kline.1m.*",
            SubscribeOpts::ephemeral(),
            move |delivery| match serde_json::from_slice::<Candle>(&delivery.payload) {
                Ok(candle) => engine.on_candle(&candle),
                Err(e) => {
                    error!(subject = %delivery.subject, error = %e, "unparseable candle dropped");
                }
            },
        );

        let rx = self
            .fill_rx
            .lock()
            .take()
            .context("paper engine already started")?;
        let pool = self.pool.clone();
        let batch_size = self.batch_size;
        let flush_interval = self.flush_interval;
        tokio::spawn(async move {
            settlement_loop(pool, rx, batch_size, flush_interval, shutdown).await;
        });

        info!("paper trading engine started");
        Ok(())
    }

    async fn load_open_orders(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT id, user_id, symbol, side, type, price, qty
             FROM paper_orders WHERE status = 'open'",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load open paper orders")?;

        let mut book: HashMap<String, Vec<OpenOrder>> = HashMap::new();
        for row in rows {
            let side: String = row.get("side");
            let order_type: String = row.get("type");
            let (Ok(side), Ok(order_type)) = (side.parse::<Side>(), order_type.parse::<OrderType>())
            else {
                warn!(order_id = row.get::<i64, _>("id"), "skipping order with unknown side/type");
                continue;
            };
            let order = OpenOrder {
                id: row.get("id"),
                user_id: row.get("user_id"),
                symbol: row.get("symbol"),
                side,
                order_type,
                price: row.get("price"),
                qty: row.get("qty"),
                filled_price: Decimal::ZERO,
            };
            book.entry(order.symbol.clone()).or_default().push(order);
        }

        let count: usize = book.values().map(Vec::len).sum();
        *self.orders.lock() = book;
        info!(count, "open paper orders loaded");
        Ok(())
    }

    /// Match one closed candle against the symbol's open orders and stage the
    /// fills for settlement.
    fn on_candle(&self, candle: &Candle) {
        let fills = {
            let mut orders = self.orders.lock();
            let Some(list) = orders.get_mut(&candle.symbol) else {
                return;
            };
            if list.is_empty() {
                return;
            }
            let (remaining, fills) = match_orders(mem::take(list), candle);
            *list = remaining;
            fills
        };

        for fill in fills {
            if let Err(mpsc::error::TrySendError::Full(fill)) = self.fill_tx.try_send(fill) {
                self.dropped_fills.fetch_add(1, Ordering::Relaxed);
                error!(
                    order_id = fill.id,
                    symbol = %fill.symbol,
                    "fill channel full, settlement lost"
                );
            }
        }
    }

    /// Validate, persist, and enqueue a new order. Returns the assigned id.
    pub async fn place_order(&self, order: NewOrder) -> Result<i64, PlaceOrderError> {
        if order.qty <= Decimal::ZERO {
            return Err(PlaceOrderError::InvalidQuantity);
        }
        if order.order_type == OrderType::Limit && order.price <= Decimal::ZERO {
            return Err(PlaceOrderError::InvalidPrice);
        }

        if order.side == Side::Buy {
            let balance: Decimal =
                sqlx::query_scalar("SELECT balance FROM paper_accounts WHERE user_id = $1")
                    .bind(order.user_id)
                    .fetch_one(&self.pool)
                    .await?;
            // Market cost is resolved at fill time; the precheck covers limit
            // orders only.
            let cost = match order.order_type {
                OrderType::Limit => order.qty * order.price,
                OrderType::Market => order.qty * Decimal::ZERO,
            };
            if balance < cost {
                return Err(PlaceOrderError::InsufficientBalance);
            }
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO paper_orders (user_id, symbol, side, type, price, qty)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(order.user_id)
        .bind(&order.symbol)
        .bind(order.side.to_string())
        .bind(order.order_type.as_str())
        .bind(order.price)
        .bind(order.qty)
        .fetch_one(&self.pool)
        .await?;

        let open = OpenOrder {
            id,
            user_id: order.user_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            price: order.price,
            qty: order.qty,
            filled_price: Decimal::ZERO,
        };
        self.orders
            .lock()
            .entry(order.symbol)
            .or_default()
            .push(open);

        info!(order_id = id, user_id = order.user_id, "paper order placed");
        Ok(id)
    }

    /// Open orders currently held for `symbol`.
    pub fn open_orders(&self, symbol: &str) -> Vec<OpenOrder> {
        self.orders
            .lock()
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Fills lost to a full settlement channel.
    pub fn dropped_fills(&self) -> u64 {
        self.dropped_fills.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

async fn settlement_loop(
    pool: PgPool,
    mut rx: mpsc::Receiver<OpenOrder>,
    batch_size: usize,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch: Vec<OpenOrder> = Vec::new();
    let mut interval = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(fill) => {
                    batch.push(fill);
                    if batch.len() >= batch_size {
                        settle_batch(&pool, mem::take(&mut batch)).await;
                    }
                }
                None => {
                    settle_batch(&pool, mem::take(&mut batch)).await;
                    return;
                }
            },
            _ = interval.tick() => {
                if !batch.is_empty() {
                    settle_batch(&pool, mem::take(&mut batch)).await;
                }
            }
            _ = shutdown.changed() => {
                settle_batch(&pool, mem::take(&mut batch)).await;
                return;
            }
        }
    }
}

/// Commit one fill batch: order rows, balance deltas, position upserts —
/// atomically. A failed commit loses the batch from the store (the book has
/// already dropped these orders); the loss is logged.
async fn settle_batch(pool: &PgPool, batch: Vec<OpenOrder>) {
    if batch.is_empty() {
        return;
    }

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(count = batch.len(), error = %e, "failed to begin settlement tx, batch lost");
            return;
        }
    };

    for order in &batch {
        let res = sqlx::query(
            "UPDATE paper_orders SET status = 'filled', filled_price = $1, filled_time = NOW()
             WHERE id = $2",
        )
        .bind(order.filled_price)
        .bind(order.id)
        .execute(&mut *tx)
        .await;
        if let Err(e) = res {
            warn!(order_id = order.id, error = %e, "failed to mark order filled");
            continue;
        }

        let amount = order.qty * order.filled_price;
        let balance_sql = match order.side {
            Side::Buy => "UPDATE paper_accounts SET balance = balance - $1 WHERE user_id = $2",
            Side::Sell => "UPDATE paper_accounts SET balance = balance + $1 WHERE user_id = $2",
        };
        if let Err(e) = sqlx::query(balance_sql)
            .bind(amount)
            .bind(order.user_id)
            .execute(&mut *tx)
            .await
        {
            warn!(order_id = order.id, error = %e, "failed to adjust balance");
            continue;
        }

        let res = match order.side {
            Side::Buy => {
                sqlx::query(
                    "INSERT INTO paper_positions (user_id, symbol, qty, avg_price)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (user_id, symbol) DO UPDATE SET
                         avg_price = (paper_positions.qty * paper_positions.avg_price + $3 * $4)
                                     / (paper_positions.qty + $3),
                         qty = paper_positions.qty + $3",
                )
                .bind(order.user_id)
                .bind(&order.symbol)
                .bind(order.qty)
                .bind(order.filled_price)
                .execute(&mut *tx)
                .await
            }
            Side::Sell => {
                sqlx::query(
                    "UPDATE paper_positions SET qty = qty - $1 WHERE user_id = $2 AND symbol = $3",
                )
                .bind(order.qty)
                .bind(order.user_id)
                .bind(&order.symbol)
                .execute(&mut *tx)
                .await
            }
        };
        if let Err(e) = res {
            warn!(order_id = order.id, error = %e, "failed to update position");
        }
    }

    match tx.commit().await {
        Ok(()) => info!(count = batch.len(), "paper fill batch settled"),
        Err(e) => error!(count = batch.len(), error = %e, "settlement commit failed, batch lost"),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Period;
    use chrono::{TimeZone, Utc};
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn dead_pool() -> PgPool {
        let opts = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("nobody")
            .database("nowhere");
        PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy_with(opts)
    }

    fn candle(o: &str, h: &str, l: &str, c: &str) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            period: Period::M1,
            open: dec(o),
            high: dec(h),
            low: dec(l),
            close: dec(c),
            volume: Decimal::ONE,
            timestamp: Utc.timestamp_millis_opt(0).unwrap(),
        }
    }

    fn order(id: i64, side: Side, order_type: OrderType, price: &str) -> OpenOrder {
        OpenOrder {
            id,
            user_id: 7,
            symbol: "BTCUSDT".into(),
            side,
            order_type,
            price: dec(price),
            qty: Decimal::ONE,
            filled_price: Decimal::ZERO,
        }
    }

    // ---- match_orders ----------------------------------------------------

    #[test]
    fn limit_buy_fills_when_low_crosses() {
        let orders = vec![order(1, Side::Buy, OrderType::Limit, "50000")];
        let (remaining, fills) =
            match_orders(orders, &candle("55000", "55500", "49000", "49500"));
        assert!(remaining.is_empty());
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].filled_price, dec("50000"));
    }

    #[test]
    fn limit_buy_survives_when_low_stays_above() {
        let orders = vec![order(1, Side::Buy, OrderType::Limit, "50000")];
        let (remaining, fills) =
            match_orders(orders, &candle("55000", "55500", "54500", "55000"));
        assert_eq!(remaining.len(), 1);
        assert!(fills.is_empty());
    }

    #[test]
    fn market_order_fills_at_close() {
        let orders = vec![order(3, Side::Buy, OrderType::Market, "0")];
        let (remaining, fills) =
            match_orders(orders, &candle("54000", "55500", "53500", "55000"));
        assert!(remaining.is_empty());
        assert_eq!(fills[0].filled_price, dec("55000"));
    }

    #[test]
    fn limit_sell_fills_when_high_crosses() {
        let orders = vec![order(2, Side::Sell, OrderType::Limit, "60000")];
        let (_, fills) = match_orders(orders, &candle("55000", "61000", "55000", "60500"));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].filled_price, dec("60000"));
    }

    #[test]
    fn mixed_book_partitions_correctly() {
        let orders = vec![
            order(1, Side::Buy, OrderType::Limit, "50000"),
            order(2, Side::Sell, OrderType::Limit, "60000"),
            order(3, Side::Buy, OrderType::Market, "0"),
        ];
        // Price sits between both limits: only the market order fills.
        let (remaining, fills) =
            match_orders(orders, &candle("55000", "55500", "54500", "55000"));
        assert_eq!(remaining.len(), 2);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].id, 3);
        assert_eq!(fills[0].filled_price, dec("55000"));
    }

    // ---- engine ----------------------------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn on_candle_stages_fills_and_rewrites_book() {
        let engine = PaperEngine::new(
            dead_pool(),
            MessageBus::new(16),
            50,
            Duration::from_millis(500),
            16,
        );
        engine.orders.lock().insert(
            "BTCUSDT".into(),
            vec![
                order(1, Side::Buy, OrderType::Limit, "50000"),
                order(2, Side::Sell, OrderType::Limit, "60000"),
            ],
        );

        engine.on_candle(&candle("55000", "55500", "49000", "49500"));

        let open = engine.open_orders("BTCUSDT");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, 2);

        let mut rx = engine.fill_rx.lock().take().unwrap();
        let fill = rx.try_recv().expect("one fill staged");
        assert_eq!(fill.id, 1);
        assert_eq!(fill.filled_price, dec("50000"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn candle_for_unknown_symbol_is_ignored() {
        let engine = PaperEngine::new(
            dead_pool(),
            MessageBus::new(16),
            50,
            Duration::from_millis(500),
            16,
        );
        engine.on_candle(&candle("1", "2", "1", "2"));
        assert_eq!(engine.dropped_fills(), 0);
    }

    // ---- place_order validation -----------------------------------------

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn place_order_rejects_non_positive_qty() {
        let engine = PaperEngine::new(
            dead_pool(),
            MessageBus::new(16),
            50,
            Duration::from_millis(500),
            16,
        );
        let err = engine
            .place_order(NewOrder {
                user_id: 7,
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                price: dec("50000"),
                qty: Decimal::ZERO,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlaceOrderError::InvalidQuantity));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn place_order_rejects_priceless_limit() {
        let engine = PaperEngine::new(
            dead_pool(),
            MessageBus::new(16),
            50,
            Duration::from_millis(500),
            16,
        );
        let err = engine
            .place_order(NewOrder {
                user_id: 7,
                symbol: "BTCUSDT".into(),
                side: Side::Sell,
                order_type: OrderType::Limit,
                price: Decimal::ZERO,
                qty: Decimal::ONE,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlaceOrderError::InvalidPrice));
    }

    #[test]
    fn order_type_roundtrips_through_str() {
        assert_eq!("market".parse::<OrderType>().unwrap(), OrderType::Market);
        assert_eq!("limit".parse::<OrderType>().unwrap(), OrderType::Limit);
        assert!("stop".parse::<OrderType>().is_err());
    }
}
