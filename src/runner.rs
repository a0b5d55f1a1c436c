// =============================================================================
// Strategy Runner — dispatches closed candles to registered strategies
// =============================================================================
//
// Durably subscribed to every period's kline subject. Each delivered candle
// is shown to every registered strategy in registration order; non-hold
// actions are published to `strategy.signal.<strategy>.<symbol>`. The
// delivery is acknowledged only after all strategies have observed the
// candle.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

use crate::bus::{MessageBus, SubscribeOpts};
use crate::strategy::{Action, Strategy};
use crate::types::{signal_subject, Candle, Period};

/// Signal event published on non-hold actions.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub strategy: String,
    pub symbol: String,
    pub period: Period,
    pub action: String,
    pub price: Decimal,
    pub time: DateTime<Utc>,
}

pub struct StrategyRunner {
    bus: MessageBus,
    strategies: Mutex<Vec<Box<dyn Strategy>>>,
}

impl StrategyRunner {
    pub fn new(bus: MessageBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            strategies: Mutex::new(Vec::new()),
        })
    }

    /// Register a strategy. Order of registration is dispatch order.
    pub fn add_strategy(&self, strategy: Box<dyn Strategy>) {
        self.strategies.lock().push(strategy);
    }

    /// Subscribe to the candle stream and start dispatching.
    pub fn start(self: &Arc<Self>) {
        let runner = self.clone();
        self.bus.subscribe(
            "market.kline.*.*",
            SubscribeOpts::durable("strategy-runner"),
            move |delivery| {
                match serde_json::from_slice::<Candle>(&delivery.payload) {
                    Ok(candle) => runner.dispatch(&candle),
                    Err(e) => {
                        error!(subject = %delivery.subject, error = %e, "unparseable candle dropped");
                    }
                }
                delivery.ack();
            },
        );

        info!(
            strategy_count = self.strategies.lock().len(),
            "strategy runner started"
        );
    }

    /// Run every strategy against one candle, publishing non-hold signals.
    fn dispatch(&self, candle: &Candle) {
        let mut strategies = self.strategies.lock();
        for strategy in strategies.iter_mut() {
            let action = strategy.on_candle(candle);
            if action == Action::Hold {
                continue;
            }

            info!(
                strategy = strategy.name(),
                symbol = %candle.symbol,
                period = %candle.period,
                action = %action,
                price = %candle.close,
                "strategy signal"
            );

            let signal = Signal {
                strategy: strategy.name().to_string(),
                symbol: candle.symbol.clone(),
                period: candle.period,
                action: action.to_string(),
                price: candle.close,
                time: candle.timestamp,
            };
            let subject = signal_subject(strategy.name(), &candle.symbol);
            match serde_json::to_vec(&signal) {
                Ok(payload) => {
                    if let Err(e) = self.bus.publish(&subject, payload) {
                        error!(subject = %subject, error = %e, "failed to publish signal");
                    }
                }
                Err(e) => error!(error = %e, "failed to serialise signal"),
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::TimeZone;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FixedStrategy {
        name: &'static str,
        action: Action,
    }

    impl Strategy for FixedStrategy {
        fn name(&self) -> &str {
            self.name
        }
        fn on_candle(&mut self, _candle: &Candle) -> Action {
            self.action
        }
    }

    fn candle() -> Candle {
        let trade = crate::types::Trade {
            id: "1".into(),
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price: Decimal::from(50_000),
            amount: Decimal::ONE,
            side: Side::Buy,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        };
        Candle::open_from(&trade, Period::M1)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_hold_actions_are_published_as_signals() {
        let bus = MessageBus::new(16);
        let (tx, mut rx) = mpsc::channel::<(String, serde_json::Value)>(4);
        bus.subscribe("strategy.signal.*.*", SubscribeOpts::ephemeral(), move |d| {
            let value = serde_json::from_slice(&d.payload).unwrap();
            let _ = tx.try_send((d.subject.clone(), value));
        });

        let runner = StrategyRunner::new(bus.clone());
        runner.add_strategy(Box::new(FixedStrategy {
            name: "always_buy",
            action: Action::Buy,
        }));
        runner.start();

        bus.publish(
            "market.kline.1m.BTCUSDT",
            serde_json::to_vec(&candle()).unwrap(),
        )
        .unwrap();

        let (subject, signal) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for signal")
            .unwrap();
        assert_eq!(subject, "strategy.signal.always_buy.BTCUSDT");
        assert_eq!(signal["action"], "buy");
        assert_eq!(signal["symbol"], "BTCUSDT");
        assert_eq!(signal["period"], "1m");
        assert_eq!(signal["price"], "50000");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hold_produces_no_signal() {
        let bus = MessageBus::new(16);
        let (tx, mut rx) = mpsc::channel::<String>(4);
        bus.subscribe("strategy.signal.*.*", SubscribeOpts::ephemeral(), move |d| {
            let _ = tx.try_send(d.subject.clone());
        });

        let runner = StrategyRunner::new(bus.clone());
        runner.add_strategy(Box::new(FixedStrategy {
            name: "always_hold",
            action: Action::Hold,
        }));
        runner.start();

        bus.publish(
            "market.kline.1m.BTCUSDT",
            serde_json::to_vec(&candle()).unwrap(),
        )
        .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err(),
            "hold must not publish a signal"
        );
    }
}
