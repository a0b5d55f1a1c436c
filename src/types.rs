// =============================================================================
// Shared market-data types used across the Pulsefeed engine
// =============================================================================
//
// Wire format notes:
//   - Decimals serialise as strings (rust_decimal default) so no precision is
//     lost crossing the bus.
//   - Timestamps serialise as RFC-3339 (chrono default).
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Symbol normalisation
// ---------------------------------------------------------------------------

/// Canonicalise a venue-specific symbol into the single uppercase alnum form
/// used everywhere downstream (`BTC-USDT`, `BTC/USDT`, `btc_usdt` => `BTCUSDT`).
///
/// Idempotent: `normalize_symbol(normalize_symbol(s)) == normalize_symbol(s)`.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| !matches!(c, '-' | '/' | '_'))
        .collect::<String>()
        .to_uppercase()
}

// ---------------------------------------------------------------------------
// Trade side
// ---------------------------------------------------------------------------

/// Aggressor side of a venue execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => anyhow::bail!("unknown trade side: {other}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Candle periods
// ---------------------------------------------------------------------------

/// The fixed set of candle periods the aggregator maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Period {
    /// Every supported period, shortest first.
    pub const ALL: [Period; 6] = [
        Period::M1,
        Period::M5,
        Period::M15,
        Period::H1,
        Period::H4,
        Period::D1,
    ];

    /// The wire / storage tag for this period.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Window length in milliseconds.
    pub fn millis(&self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Truncate `ts` down to the start of the window containing it.
    ///
    /// Windows are aligned to the UNIX epoch, so the 1d window boundary is
    /// UTC midnight.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        let window = ms - ms.rem_euclid(self.millis());
        Utc.timestamp_millis_opt(window)
            .single()
            .expect("window start is a valid timestamp")
    }
}

impl std::str::FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => anyhow::bail!("unknown candle period: {other}"),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// A single normalised venue execution.
///
/// Identity for deduplication is `(exchange, symbol, id, timestamp)` — the
/// trade writer's upsert key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Venue-assigned trade id.
    pub id: String,
    /// Canonical symbol (see [`normalize_symbol`]).
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// OHLCV aggregate over the half-open window `[timestamp, timestamp + period)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub exchange: String,
    pub period: Period,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "h")]
    pub high: Decimal,
    #[serde(rename = "l")]
    pub low: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
    #[serde(rename = "v")]
    pub volume: Decimal,
    /// Window start (the trade timestamp truncated to `period`).
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
}

impl Candle {
    /// Open a fresh candle from the first trade observed in a window.
    pub fn open_from(trade: &Trade, period: Period) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            exchange: trade.exchange.clone(),
            period,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.amount,
            timestamp: period.truncate(trade.timestamp),
        }
    }

    /// Fold a subsequent trade of the same window into this candle.
    /// Open is set once at creation and never mutated.
    pub fn apply(&mut self, trade: &Trade) {
        if trade.price > self.high {
            self.high = trade.price;
        }
        if trade.price < self.low {
            self.low = trade.price;
        }
        self.close = trade.price;
        self.volume += trade.amount;
    }

    /// Instant at which the window closes (exclusive end).
    pub fn close_time(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::milliseconds(self.period.millis())
    }
}

/// Composite key identifying one in-progress candle in the aggregator map.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CandleKey {
    pub exchange: String,
    pub symbol: String,
    pub period: Period,
    pub window_start: DateTime<Utc>,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.exchange,
            self.symbol,
            self.period,
            self.window_start.to_rfc3339()
        )
    }
}

// ---------------------------------------------------------------------------
// Bus subjects
// ---------------------------------------------------------------------------

/// Subject for raw normalised trades from one venue/symbol stream.
pub fn raw_trade_subject(exchange: &str, symbol: &str) -> String {
    format!("market.raw.{exchange}.{symbol}")
}

/// Subject a closed candle is published to.
pub fn kline_subject(period: Period, symbol: &str) -> String {
    format!("market.kline.{period}.{symbol}")
}

/// Subject for strategy signals.
pub fn signal_subject(strategy: &str, symbol: &str) -> String {
    format!("strategy.signal.{strategy}.{symbol}")
}

/// Subject for per-user notification events.
pub fn notification_subject(user_id: i64) -> String {
    format!("notification.user.{user_id}")
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn trade(price: &str, amount: &str, ts_ms: i64) -> Trade {
        Trade {
            id: "1".into(),
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price: dec(price),
            amount: dec(amount),
            side: Side::Buy,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
        }
    }

    // ---- normalize_symbol ------------------------------------------------

    #[test]
    fn normalize_strips_separators_and_uppercases() {
        assert_eq!(normalize_symbol("BTC-USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("btc_usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("XBT/USD"), "XBTUSD");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_symbol("eth-usd_t/");
        assert_eq!(normalize_symbol(&once), once);
    }

    // ---- Period ----------------------------------------------------------

    #[test]
    fn period_roundtrips_through_str() {
        for p in Period::ALL {
            assert_eq!(p.as_str().parse::<Period>().unwrap(), p);
        }
        assert!("2h".parse::<Period>().is_err());
    }

    #[test]
    fn truncate_aligns_to_window_start() {
        // 2024-01-15T10:37:42.500Z
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 37, 42).unwrap()
            + chrono::Duration::milliseconds(500);

        assert_eq!(
            Period::M1.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 37, 0).unwrap()
        );
        assert_eq!(
            Period::M5.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 35, 0).unwrap()
        );
        assert_eq!(
            Period::M15.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
        );
        assert_eq!(
            Period::H1.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
        );
        assert_eq!(
            Period::H4.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap()
        );
        assert_eq!(
            Period::D1.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn truncate_is_idempotent() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 15, 10, 37, 42).unwrap();
        for p in Period::ALL {
            let w = p.truncate(ts);
            assert_eq!(p.truncate(w), w);
        }
    }

    // ---- Candle ----------------------------------------------------------

    #[test]
    fn candle_open_from_first_trade() {
        let t = trade("50000", "1", 1_700_000_010_000);
        let c = Candle::open_from(&t, Period::M1);
        assert_eq!(c.open, dec("50000"));
        assert_eq!(c.high, dec("50000"));
        assert_eq!(c.low, dec("50000"));
        assert_eq!(c.close, dec("50000"));
        assert_eq!(c.volume, dec("1"));
        assert_eq!(c.timestamp, Period::M1.truncate(t.timestamp));
    }

    #[test]
    fn candle_apply_updates_hlcv_but_not_open() {
        let mut c = Candle::open_from(&trade("50000", "1", 0), Period::M1);
        c.apply(&trade("50100", "0.5", 10_000));
        c.apply(&trade("49900", "0.25", 20_000));

        assert_eq!(c.open, dec("50000"));
        assert_eq!(c.high, dec("50100"));
        assert_eq!(c.low, dec("49900"));
        assert_eq!(c.close, dec("49900"));
        assert_eq!(c.volume, dec("1.75"));
        // OHLC invariant.
        assert!(c.low <= c.open.min(c.close));
        assert!(c.open.max(c.close) <= c.high);
    }

    // ---- Wire format -----------------------------------------------------

    #[test]
    fn candle_serialises_with_short_field_names() {
        let c = Candle::open_from(&trade("50000.5", "1.25", 0), Period::M5);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["period"], "5m");
        assert_eq!(json["o"], "50000.5");
        assert_eq!(json["v"], "1.25");
        assert!(json["t"].is_string());
    }

    #[test]
    fn trade_roundtrips_without_precision_loss() {
        let t = trade("50000.00000001", "0.00000001", 1_700_000_000_123);
        let json = serde_json::to_string(&t).unwrap();
        // Decimals ride the wire as strings.
        assert!(json.contains("\"50000.00000001\""));
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(back.price, t.price);
        assert_eq!(back.amount, t.amount);
        assert_eq!(back.timestamp, t.timestamp);
    }

    // ---- Subjects --------------------------------------------------------

    #[test]
    fn subject_builders() {
        assert_eq!(
            raw_trade_subject("binance", "BTCUSDT"),
            "market.raw.binance.BTCUSDT"
        );
        assert_eq!(kline_subject(Period::M1, "BTCUSDT"), "market.kline.1m.BTCUSDT");
        assert_eq!(
            signal_subject("ma_cross", "ETHUSDT"),
            "strategy.signal.ma_cross.ETHUSDT"
        );
        assert_eq!(notification_subject(42), "notification.user.42");
    }
}
