// =============================================================================
// Historical Backfill — paged venue REST pulls into the klines table
// =============================================================================
//
// Pulls 1m candles from the Binance REST API in pages of up to 1000 rows,
// upserting each page in one transaction. Re-running over the same range is
// idempotent because the upsert key is the candle identity
// (symbol, exchange, period, time).
//
// A 200 ms pause between pages respects venue rate limits.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::types::{normalize_symbol, Candle, Period};

/// Binance caps klines pages at 1000 rows.
const PAGE_LIMIT: usize = 1000;
/// Pause between page requests.
const PAGE_PAUSE: Duration = Duration::from_millis(200);
/// Venue request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Backfiller {
    pool: PgPool,
    http: reqwest::Client,
    base_url: String,
}

impl Backfiller {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("failed to build reqwest client"),
            base_url: "https://api.binance.com".to_string(),
        }
    }

    /// Pull historical 1m candles for `[start, end)` from Binance and upsert
    /// them. Returns the number of rows written.
    pub async fn backfill_binance(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let symbol = normalize_symbol(symbol);
        info!(symbol = %symbol, %start, %end, "starting binance backfill");

        let mut cursor = start;
        let mut total: u64 = 0;

        while cursor < end {
            let url = format!(
                "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&limit={}",
                self.base_url,
                symbol,
                cursor.timestamp_millis(),
                PAGE_LIMIT
            );

            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .context("failed to fetch klines from binance")?;

            if !resp.status().is_success() {
                anyhow::bail!("binance klines request returned status {}", resp.status());
            }

            let raw: Vec<Vec<serde_json::Value>> = resp
                .json()
                .await
                .context("failed to decode binance klines response")?;

            if raw.is_empty() {
                break;
            }

            let candles = parse_binance_klines(&symbol, &raw)?;
            self.save_candles(&candles).await?;
            total += candles.len() as u64;

            let last = candles
                .last()
                .expect("non-empty page always parses to candles")
                .timestamp;
            debug!(symbol = %symbol, count = candles.len(), last_window = %last, "backfilled page");

            cursor = last + chrono::Duration::minutes(1);
            tokio::time::sleep(PAGE_PAUSE).await;
        }

        info!(symbol = %symbol, rows = total, "binance backfill completed");
        Ok(total)
    }

    /// Upsert one page of candles in a single transaction.
    async fn save_candles(&self, candles: &[Candle]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin backfill tx")?;

        for c in candles {
            sqlx::query(
                r#"INSERT INTO klines (symbol, exchange, period, open, high, low, close, volume, time)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (symbol, exchange, period, time) DO UPDATE SET
                       open = EXCLUDED.open,
                       high = EXCLUDED.high,
                       low = EXCLUDED.low,
                       close = EXCLUDED.close,
                       volume = EXCLUDED.volume"#,
            )
            .bind(&c.symbol)
            .bind(&c.exchange)
            .bind(c.period.as_str())
            .bind(c.open)
            .bind(c.high)
            .bind(c.low)
            .bind(c.close)
            .bind(c.volume)
            .bind(c.timestamp)
            .execute(&mut *tx)
            .await
            .context("failed to upsert backfilled candle")?;
        }

        tx.commit().await.context("failed to commit backfill tx")
    }
}

/// Parse one Binance klines page into canonical candles.
///
/// Row shape: `[openTimeMs, open, high, low, close, volume, closeTimeMs, ...]`
/// with the numeric fields delivered as strings.
fn parse_binance_klines(symbol: &str, rows: &[Vec<serde_json::Value>]) -> Result<Vec<Candle>> {
    let mut candles = Vec::with_capacity(rows.len());

    for row in rows {
        let open_time = row
            .first()
            .and_then(|v| v.as_i64())
            .context("kline row missing open time")?;

        let field = |idx: usize, name: &str| -> Result<Decimal> {
            row.get(idx)
                .and_then(|v| v.as_str())
                .with_context(|| format!("kline row missing {name}"))?
                .parse()
                .with_context(|| format!("kline row has non-decimal {name}"))
        };

        candles.push(Candle {
            symbol: symbol.to_string(),
            exchange: "binance".to_string(),
            period: Period::M1,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
            timestamp: Utc
                .timestamp_millis_opt(open_time)
                .single()
                .context("kline row has invalid open time")?,
        });
    }

    Ok(candles)
}
