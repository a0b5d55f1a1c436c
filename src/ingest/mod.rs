// =============================================================================
// Ingestion Fan-In — one producer per (venue, symbol) feeding the bus
// =============================================================================
//
// Venue connectors deliver canonical `Trade` records over a bounded channel;
// a forwarding task per target normalises the symbol and publishes to
// `market.raw.<venue>.<symbol>`. Connectors are a closed set selected by
// venue name at startup — venue wire formats stay behind this seam.
// =============================================================================

pub mod binance;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::config::IngestTarget;
use crate::types::{normalize_symbol, raw_trade_subject, Trade};

/// Per-target trade channel depth between connector and forwarder.
const TRADE_CHANNEL_DEPTH: usize = 1000;

/// A venue trade stream. Implementations own their reconnect policy and run
/// until the shutdown signal fires.
#[async_trait]
pub trait Connector: Send + Sync {
    fn exchange(&self) -> &'static str;
    fn symbol(&self) -> &str;
    async fn run(&self, out: mpsc::Sender<Trade>, shutdown: watch::Receiver<bool>);
}

/// Build the connector for a venue. Unknown venues are a startup error, not
/// a runtime fallback.
pub fn build_connector(exchange: &str, symbol: &str) -> Result<Box<dyn Connector>> {
    match exchange {
        "binance" => Ok(Box::new(binance::BinanceTradeStream::new(symbol))),
        other => anyhow::bail!("no connector registered for venue: {other}"),
    }
}

/// Build connectors for every configured target.
pub fn build_connectors(targets: &[IngestTarget]) -> Result<Vec<Box<dyn Connector>>> {
    targets
        .iter()
        .map(|t| build_connector(&t.exchange, &t.symbol))
        .collect()
}

/// Spawn one producer task and one forwarding task per connector.
pub fn spawn_ingestion(
    bus: MessageBus,
    connectors: Vec<Box<dyn Connector>>,
    shutdown: watch::Receiver<bool>,
) {
    let count = connectors.len();
    for connector in connectors {
        let (tx, mut rx) = mpsc::channel::<Trade>(TRADE_CHANNEL_DEPTH);

        let producer_shutdown = shutdown.clone();
        let forward_bus = bus.clone();
        let mut forward_shutdown = shutdown.clone();

        tokio::spawn(async move {
            connector.run(tx, producer_shutdown).await;
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(mut trade) => {
                            trade.symbol = normalize_symbol(&trade.symbol);
                            let subject = raw_trade_subject(&trade.exchange, &trade.symbol);
                            match serde_json::to_vec(&trade) {
                                Ok(payload) => {
                                    if let Err(e) = forward_bus.publish(&subject, payload) {
                                        error!(subject = %subject, error = %e, "failed to publish trade");
                                    }
                                }
                                Err(e) => error!(error = %e, "failed to serialise trade"),
                            }
                        }
                        None => {
                            warn!("trade channel closed, forwarder stopping");
                            return;
                        }
                    },
                    _ = forward_shutdown.changed() => return,
                }
            }
        });
    }

    info!(count, "ingestion producers launched");
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscribeOpts;
    use crate::types::Side;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::time::Duration;

    #[test]
    fn registry_knows_binance() {
        let c = build_connector("binance", "BTCUSDT").unwrap();
        assert_eq!(c.exchange(), "binance");
        assert_eq!(c.symbol(), "BTCUSDT");
    }

    #[test]
    fn registry_rejects_unknown_venue() {
        assert!(build_connector("mtgox", "BTCUSD").is_err());
    }

    /// A connector that emits a fixed list of trades and stops.
    struct StubConnector {
        trades: Vec<Trade>,
    }

    #[async_trait]
    impl Connector for StubConnector {
        fn exchange(&self) -> &'static str {
            "binance"
        }
        fn symbol(&self) -> &str {
            "BTC-USDT"
        }
        async fn run(&self, out: mpsc::Sender<Trade>, _shutdown: watch::Receiver<bool>) {
            for trade in &self.trades {
                let _ = out.send(trade.clone()).await;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forwarder_normalises_and_publishes() {
        let bus = MessageBus::new(16);
        let (bus_tx, mut bus_rx) = mpsc::channel::<(String, Trade)>(4);
        bus.subscribe("market.raw.*.*", SubscribeOpts::ephemeral(), move |d| {
            if let Ok(t) = serde_json::from_slice::<Trade>(&d.payload) {
                let _ = bus_tx.try_send((d.subject.clone(), t));
            }
        });

        let stub = StubConnector {
            trades: vec![Trade {
                id: "9".into(),
                symbol: "btc-usdt".into(),
                exchange: "binance".into(),
                price: Decimal::from(50_000),
                amount: Decimal::ONE,
                side: Side::Sell,
                timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            }],
        };

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_ingestion(bus, vec![Box::new(stub)], shutdown_rx);

        let (subject, trade) = tokio::time::timeout(Duration::from_secs(2), bus_rx.recv())
            .await
            .expect("timed out waiting for forwarded trade")
            .unwrap();
        assert_eq!(subject, "market.raw.binance.BTCUSDT");
        assert_eq!(trade.symbol, "BTCUSDT");
    }
}
