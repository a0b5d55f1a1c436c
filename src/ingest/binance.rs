// =============================================================================
// Binance Trade Connector — aggTrade WebSocket stream
// =============================================================================
//
// Connects to the public aggTrade stream for one symbol and delivers
// canonical `Trade` records. Reconnects with a 5 s back-off until shutdown.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::Connector;
use crate::types::{Side, Trade};

/// Delay before reconnecting a dropped stream.
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

pub struct BinanceTradeStream {
    symbol: String,
}

impl BinanceTradeStream {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
        }
    }

    /// One connection lifetime: stream trades into `out` until the socket
    /// drops or the channel closes.
    async fn connect_and_stream(&self, out: &mpsc::Sender<Trade>) -> Result<()> {
        let lower = self.symbol.to_lowercase();
        let url = format!("wss://stream.binance.com:9443/ws/{lower}@aggTrade");
        info!(url = %url, symbol = %self.symbol, "connecting to trade WebSocket");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .context("failed to connect to trade WebSocket")?;

        info!(symbol = %self.symbol, "trade WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                        match parse_agg_trade(&text) {
                            Ok(trade) => {
                                if out.send(trade).await.is_err() {
                                    // Forwarder gone — nothing left to feed.
                                    return Ok(());
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to parse aggTrade message");
                            }
                        }
                    }
                    // Ping/Pong/Binary/Close frames are handled by tungstenite.
                }
                Some(Err(e)) => {
                    error!(symbol = %self.symbol, error = %e, "trade WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol = %self.symbol, "trade WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl Connector for BinanceTradeStream {
    fn exchange(&self) -> &'static str {
        "binance"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn run(&self, out: mpsc::Sender<Trade>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.connect_and_stream(&out) => {
                    if let Err(e) = result {
                        error!(symbol = %self.symbol, error = %e, "trade stream error, reconnecting in 5s");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

/// Parse a Binance aggTrade message into a canonical trade.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "a": 26129, "p": "0.001",
///   "q": "100", "T": 1672515782136, "m": true }
/// ```
/// `m == true` means the buyer was the maker, so the aggressor sold.
fn parse_agg_trade(text: &str) -> Result<Trade> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let symbol = root["s"].as_str().context("missing field s")?.to_string();
    let id = root["a"].as_i64().context("missing field a")?;

    let price: Decimal = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;
    let amount: Decimal = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let is_buyer_maker = root["m"].as_bool().context("missing field m")?;
    let ts_ms = root["T"].as_i64().context("missing field T")?;

    Ok(Trade {
        id: id.to_string(),
        symbol,
        exchange: "binance".to_string(),
        price,
        amount,
        side: if is_buyer_maker { Side::Sell } else { Side::Buy },
        timestamp: Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .context("invalid trade timestamp")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "e": "aggTrade", "E": 1672515782136, "s": "BTCUSDT",
        "a": 26129, "p": "37000.50", "q": "0.125",
        "f": 100, "l": 105, "T": 1672515782136, "m": true, "M": true
    }"#;

    #[test]
    fn parse_agg_trade_ok() {
        let trade = parse_agg_trade(SAMPLE).unwrap();
        assert_eq!(trade.id, "26129");
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.exchange, "binance");
        assert_eq!(trade.price, "37000.50".parse().unwrap());
        assert_eq!(trade.amount, "0.125".parse().unwrap());
        // Buyer was maker => aggressor sold.
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.timestamp.timestamp_millis(), 1_672_515_782_136);
    }

    #[test]
    fn taker_buy_when_seller_is_maker() {
        let text = SAMPLE.replace("\"m\": true", "\"m\": false");
        let trade = parse_agg_trade(&text).unwrap();
        assert_eq!(trade.side, Side::Buy);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(parse_agg_trade(r#"{ "e": "aggTrade", "s": "BTCUSDT" }"#).is_err());
        assert!(parse_agg_trade("not json").is_err());
    }
}
