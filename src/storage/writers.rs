// =============================================================================
// Batch Writers — buffered, idempotent persistence for trades and candles
// =============================================================================
//
// `add` is non-blocking: records buffer under a mutex and a flush runs either
// when the buffer reaches the batch size or on the flush ticker, whichever
// comes first. A flush atomically swaps the buffer for a fresh one, then
// submits every row with upsert semantics:
//
//   trades — ON CONFLICT DO NOTHING   (venue re-emits are dropped)
//   klines — ON CONFLICT DO UPDATE    (late snapshots overwritten by close)
//
// Row failures are logged and counted, never aborting the rest of the batch;
// unacked bus deliveries cover redelivery. Concurrent flushes are fine since
// batches are independent and upserts are idempotent.
// =============================================================================

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::types::{Candle, Trade};

/// Hard ceiling on one batch write round-trip.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Trade writer
// ---------------------------------------------------------------------------

pub struct TradeWriter {
    inner: Arc<TradeWriterInner>,
}

struct TradeWriterInner {
    pool: PgPool,
    buffer: Mutex<Vec<Trade>>,
    batch_size: usize,
    written: AtomicU64,
    failed_rows: AtomicU64,
    failed_batches: AtomicU64,
}

impl TradeWriter {
    /// Create the writer and start its flush ticker.
    pub fn new(
        pool: PgPool,
        flush_interval: Duration,
        batch_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let inner = Arc::new(TradeWriterInner {
            pool,
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            written: AtomicU64::new(0),
            failed_rows: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        });

        let ticker_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => ticker_inner.flush().await,
                    _ = shutdown.changed() => {
                        // One final flush so nothing buffered is lost.
                        ticker_inner.flush().await;
                        return;
                    }
                }
            }
        });

        Self { inner }
    }

    /// Buffer one trade; triggers an asynchronous flush at the batch size.
    pub fn add(&self, trade: Trade) {
        let full = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(trade);
            buffer.len() >= self.inner.batch_size
        };
        if full {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.flush().await });
        }
    }

    /// Flush whatever is buffered right now and wait for the write.
    pub async fn flush_now(&self) {
        self.inner.flush().await;
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn failed_batches(&self) -> u64 {
        self.inner.failed_batches.load(Ordering::Relaxed)
    }
}

impl TradeWriterInner {
    async fn flush(self: &Arc<Self>) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size))
        };

        let count = batch.len();
        match tokio::time::timeout(WRITE_TIMEOUT, self.write_batch(batch)).await {
            Ok(Ok(())) => debug!(
                count,
                total_written = self.written.load(Ordering::Relaxed),
                failed_rows = self.failed_rows.load(Ordering::Relaxed),
                "trade batch flushed"
            ),
            Ok(Err(e)) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(count, error = %e, "trade batch write failed");
            }
            Err(_) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(count, "trade batch write timed out");
            }
        }
    }

    async fn write_batch(&self, batch: Vec<Trade>) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        for trade in &batch {
            let res = sqlx::query(
                r#"INSERT INTO trades (time, symbol, exchange, price, amount, side, trade_id)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)
                   ON CONFLICT (symbol, exchange, trade_id, time) DO NOTHING"#,
            )
            .bind(trade.timestamp)
            .bind(&trade.symbol)
            .bind(&trade.exchange)
            .bind(trade.price)
            .bind(trade.amount)
            .bind(trade.side.to_string())
            .bind(&trade.id)
            .execute(&mut *conn)
            .await;

            match res {
                Ok(_) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed_rows.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        trade_id = %trade.id,
                        symbol = %trade.symbol,
                        exchange = %trade.exchange,
                        error = %e,
                        "trade row insert failed"
                    );
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Candle writer
// ---------------------------------------------------------------------------

pub struct CandleWriter {
    inner: Arc<CandleWriterInner>,
}

struct CandleWriterInner {
    pool: PgPool,
    buffer: Mutex<Vec<Candle>>,
    batch_size: usize,
    written: AtomicU64,
    failed_rows: AtomicU64,
    failed_batches: AtomicU64,
}

impl CandleWriter {
    /// Create the writer and start its flush ticker.
    pub fn new(
        pool: PgPool,
        flush_interval: Duration,
        batch_size: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let inner = Arc::new(CandleWriterInner {
            pool,
            buffer: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            written: AtomicU64::new(0),
            failed_rows: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        });

        let ticker_inner = inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => ticker_inner.flush().await,
                    _ = shutdown.changed() => {
                        ticker_inner.flush().await;
                        return;
                    }
                }
            }
        });

        Self { inner }
    }

    /// Buffer one candle; triggers an asynchronous flush at the batch size.
    pub fn add(&self, candle: Candle) {
        let full = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(candle);
            buffer.len() >= self.inner.batch_size
        };
        if full {
            let inner = self.inner.clone();
            tokio::spawn(async move { inner.flush().await });
        }
    }

    /// Flush whatever is buffered right now and wait for the write.
    pub async fn flush_now(&self) {
        self.inner.flush().await;
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn failed_batches(&self) -> u64 {
        self.inner.failed_batches.load(Ordering::Relaxed)
    }
}

impl CandleWriterInner {
    async fn flush(self: &Arc<Self>) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            mem::replace(&mut *buffer, Vec::with_capacity(self.batch_size))
        };

        let count = batch.len();
        match tokio::time::timeout(WRITE_TIMEOUT, self.write_batch(batch)).await {
            Ok(Ok(())) => debug!(
                count,
                total_written = self.written.load(Ordering::Relaxed),
                failed_rows = self.failed_rows.load(Ordering::Relaxed),
                "candle batch flushed"
            ),
            Ok(Err(e)) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(count, error = %e, "candle batch write failed");
            }
            Err(_) => {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(count, "candle batch write timed out");
            }
        }
    }

    async fn write_batch(&self, batch: Vec<Candle>) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        for candle in &batch {
            let res = sqlx::query(
                r#"INSERT INTO klines (time, symbol, exchange, period, open, high, low, close, volume)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (symbol, exchange, period, time) DO UPDATE SET
                       open = EXCLUDED.open,
                       high = EXCLUDED.high,
                       low = EXCLUDED.low,
                       close = EXCLUDED.close,
                       volume = EXCLUDED.volume"#,
            )
            .bind(candle.timestamp)
            .bind(&candle.symbol)
            .bind(&candle.exchange)
            .bind(candle.period.as_str())
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .execute(&mut *conn)
            .await;

            match res {
                Ok(_) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed_rows.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        symbol = %candle.symbol,
                        exchange = %candle.exchange,
                        period = %candle.period,
                        window = %candle.timestamp,
                        error = %e,
                        "candle row upsert failed"
                    );
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Period, Side};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

    /// A lazily-connected pool pointed at a closed port: construction always
    /// succeeds, any actual write fails fast.
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

    fn trade(id: &str) -> Trade {
        Trade {
            id: id.into(),
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price: Decimal::from(50_000),
            amount: Decimal::ONE,
            side: Side::Buy,
            timestamp: Utc.timestamp_millis_opt(0).unwrap(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn add_buffers_below_batch_size() {
        let (_tx, rx) = watch::channel(false);
        let writer = TradeWriter::new(dead_pool(), Duration::from_secs(3600), 100, rx);

        for i in 0..5 {
            writer.add(trade(&i.to_string()));
        }
        assert_eq!(writer.buffered(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_swaps_buffer_and_counts_failures() {
        let (_tx, rx) = watch::channel(false);
        let writer = TradeWriter::new(dead_pool(), Duration::from_secs(3600), 100, rx);

        writer.add(trade("a"));
        writer.add(trade("b"));
        writer.flush_now().await;

        // The buffer was swapped out before the (failing) write.
        assert_eq!(writer.buffered(), 0);
        assert_eq!(writer.failed_batches(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_of_empty_buffer_is_a_noop() {
        let (_tx, rx) = watch::channel(false);
        let writer = CandleWriter::new(dead_pool(), Duration::from_secs(3600), 100, rx);

        writer.flush_now().await;
        assert_eq!(writer.failed_batches(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn candle_writer_buffers_independently() {
        let (_tx, rx) = watch::channel(false);
        let writer = CandleWriter::new(dead_pool(), Duration::from_secs(3600), 10, rx);

        let t = trade("x");
        writer.add(Candle::open_from(&t, Period::M1));
        writer.add(Candle::open_from(&t, Period::M5));
        assert_eq!(writer.buffered(), 2);
    }
}
