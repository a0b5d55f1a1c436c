// =============================================================================
// Schema bootstrap — embedded DDL executed once at startup
// =============================================================================
//
// Upsert keys:
//   trades          (symbol, exchange, trade_id, time)   — dedup identity
//   klines          (symbol, exchange, period, time)     — candle identity
//   paper_positions (user_id, symbol)
// =============================================================================

use anyhow::{Context, Result};
use sqlx::PgPool;

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    time        TIMESTAMPTZ NOT NULL,
    symbol      TEXT        NOT NULL,
    exchange    TEXT        NOT NULL,
    price       NUMERIC     NOT NULL,
    amount      NUMERIC     NOT NULL,
    side        TEXT        NOT NULL,
    trade_id    TEXT        NOT NULL,
    UNIQUE (symbol, exchange, trade_id, time)
);

CREATE TABLE IF NOT EXISTS klines (
    time        TIMESTAMPTZ NOT NULL,
    symbol      TEXT        NOT NULL,
    exchange    TEXT        NOT NULL,
    period      TEXT        NOT NULL,
    open        NUMERIC     NOT NULL,
    high        NUMERIC     NOT NULL,
    low         NUMERIC     NOT NULL,
    close       NUMERIC     NOT NULL,
    volume      NUMERIC     NOT NULL,
    UNIQUE (symbol, exchange, period, time)
);

CREATE INDEX IF NOT EXISTS idx_klines_series_time
    ON klines (symbol, period, time DESC);

CREATE TABLE IF NOT EXISTS alerts (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT      NOT NULL,
    symbol          TEXT        NOT NULL,
    condition_type  TEXT        NOT NULL,
    target_value    NUMERIC     NOT NULL,
    is_active       BOOLEAN     NOT NULL DEFAULT TRUE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS paper_orders (
    id           BIGSERIAL PRIMARY KEY,
    user_id      BIGINT      NOT NULL,
    symbol       TEXT        NOT NULL,
    side         TEXT        NOT NULL,
    type         TEXT        NOT NULL,
    price        NUMERIC     NOT NULL DEFAULT 0,
    qty          NUMERIC     NOT NULL,
    status       TEXT        NOT NULL DEFAULT 'open',
    filled_price NUMERIC,
    filled_time  TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS paper_positions (
    user_id   BIGINT  NOT NULL,
    symbol    TEXT    NOT NULL,
    qty       NUMERIC NOT NULL DEFAULT 0,
    avg_price NUMERIC NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, symbol)
);

CREATE TABLE IF NOT EXISTS paper_accounts (
    user_id BIGINT  PRIMARY KEY,
    balance NUMERIC NOT NULL DEFAULT 100000
);
"#;

/// Run the DDL. Every statement is `IF NOT EXISTS`, so reruns are no-ops.
pub async fn init(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_DDL)
        .execute(pool)
        .await
        .context("schema initialisation failed")?;
    tracing::info!("database schema initialised");
    Ok(())
}
