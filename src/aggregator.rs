// =============================================================================
// Candle Aggregator — incremental multi-period OHLCV from the trade stream
// =============================================================================
//
// Consumes `market.raw.*.*`, maintains one in-progress candle per
// (venue, symbol, period, window-start), and publishes each candle to
// `market.kline.<period>.<symbol>` exactly once, when a 1 s closure scan
// finds its window end in the past.
//
// Bus delivery handlers only deposit trades into a bounded job channel; a
// small pool of worker threads folds them into the map. A full job channel
// drops the trade and bumps a counter — liveness of the bus delivery task
// beats queueing. The map mutex is held only for the in-place update.
//
// The window key comes from the trade's own timestamp, so out-of-order
// trades still land in their window. Trades arriving after a window was
// flushed are lost; that bound is set by the 1 s scan lag.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, TrySendError};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, SubscribeOpts};
use crate::types::{kline_subject, Candle, CandleKey, Period, Trade};

pub struct CandleAggregator {
    bus: MessageBus,
    candles: Mutex<HashMap<CandleKey, Candle>>,
    dropped: AtomicU64,
}

impl CandleAggregator {
    pub fn new(bus: MessageBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            candles: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Subscribe to the raw trade stream and start the worker pool and the
    /// closure scan.
    pub fn start(
        self: &Arc<Self>,
        workers: usize,
        queue_depth: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (jobs_tx, jobs_rx) = channel::bounded::<Trade>(queue_depth);

        for i in 0..workers {
            let rx = jobs_rx.clone();
            let agg = self.clone();
            std::thread::Builder::new()
                .name(format!("candle-agg-{i}"))
                .spawn(move || {
                    while let Ok(trade) = rx.recv() {
                        agg.process_trade(&trade);
                    }
                })
                .expect("failed to spawn aggregator worker");
        }

        let agg = self.clone();
        self.bus.subscribe(
            "market.raw.*.*",
            SubscribeOpts::durable("kline-aggregator"),
            move |delivery| {
                let trade: Trade = match serde_json::from_slice(&delivery.payload) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(subject = %delivery.subject, error = %e, "unparseable trade dropped");
                        delivery.ack();
                        return;
                    }
                };
                if let Err(TrySendError::Full(trade)) = jobs_tx.try_send(trade) {
                    agg.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol = %trade.symbol, "aggregator job queue full, trade dropped");
                }
                // Acked once the trade is in the worker queue (or consciously
                // dropped under back-pressure).
                delivery.ack();
            },
        );

        let agg = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => agg.publish_ready(Utc::now()),
                    _ = shutdown.changed() => {
                        // Publish every window whose closure time has passed.
                        agg.publish_ready(Utc::now());
                        debug!(still_open = agg.in_progress(), "aggregator closure scan stopped");
                        return;
                    }
                }
            }
        });

        info!(workers, queue_depth, "candle aggregator started");
    }

    /// Fold one trade into the in-progress candle of every period.
    fn process_trade(&self, trade: &Trade) {
        let mut candles = self.candles.lock();
        for period in Period::ALL {
            let key = CandleKey {
                exchange: trade.exchange.clone(),
                symbol: trade.symbol.clone(),
                period,
                window_start: period.truncate(trade.timestamp),
            };
            match candles.get_mut(&key) {
                Some(candle) => candle.apply(trade),
                None => {
                    candles.insert(key, Candle::open_from(trade, period));
                }
            }
        }
    }

    /// Remove and return every candle whose window has closed as of `now`,
    /// ordered by window start so per-series emission is strictly ascending.
    fn collect_ready(&self, now: DateTime<Utc>) -> Vec<Candle> {
        let mut ready = {
            let mut candles = self.candles.lock();
            let keys: Vec<CandleKey> = candles
                .iter()
                .filter(|(_, c)| c.close_time() <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| candles.remove(&k))
                .collect::<Vec<_>>()
        };
        ready.sort_by(|a, b| {
            (a.exchange.as_str(), a.symbol.as_str(), a.period.as_str(), a.timestamp)
                .cmp(&(b.exchange.as_str(), b.symbol.as_str(), b.period.as_str(), b.timestamp))
        });
        ready
    }

    /// Publish all closed candles. Publish failures are logged; the candle is
    /// gone from the map either way (emit-once).
    fn publish_ready(&self, now: DateTime<Utc>) {
        for candle in self.collect_ready(now) {
            let subject = kline_subject(candle.period, &candle.symbol);
            match serde_json::to_vec(&candle) {
                Ok(payload) => {
                    if let Err(e) = self.bus.publish(&subject, payload) {
                        error!(subject = %subject, error = %e, "failed to publish closed candle");
                    }
                }
                Err(e) => error!(subject = %subject, error = %e, "failed to serialise candle"),
            }
        }
    }

    /// Number of in-progress candles currently held.
    pub fn in_progress(&self) -> usize {
        self.candles.lock().len()
    }

    /// Trades dropped because the job queue was full.
    pub fn dropped_trades(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
