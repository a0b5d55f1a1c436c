// =============================================================================
// Pulsefeed — Main Entry Point
// =============================================================================
//
// Startup order matters: store (fatal on failure), bus, persistence writers,
// candle aggregator, alert evaluator, paper engine, strategy runner,
// ingestion producers, then the HTTP API. Shutdown fans out through a watch
// channel; writers and the aggregator flush once more before exit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod alerts;
mod analytics;
mod api;
mod bus;
mod config;
mod indicators;
mod ingest;
mod notify;
mod paper;
mod risk;
mod runner;
mod storage;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::CandleAggregator;
use crate::alerts::AlertEvaluator;
use crate::analytics::AnalyticsService;
use crate::api::ApiContext;
use crate::bus::{MessageBus, SubscribeOpts};
use crate::config::Config;
use crate::notify::TelegramNotifier;
use crate::paper::PaperEngine;
use crate::risk::RiskManager;
use crate::runner::StrategyRunner;
use crate::storage::backfill::Backfiller;
use crate::storage::writers::{CandleWriter, TradeWriter};
use crate::storage::Store;
use crate::strategy::build_strategy;
use crate::types::{Candle, Trade};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Pulsefeed market-data engine starting");

    let config = Config::from_env()?;
    info!(targets = config.ingest_targets.len(), "configuration loaded");

    // ── 2. Store (fatal on failure) ──────────────────────────────────────
    let store = Store::connect(&config.db_dsn).await?;
    store.health_check().await?;
    store.init_schema().await?;
    let pool = store.pool().clone();

    // ── 3. Bus & shutdown fan-out ────────────────────────────────────────
    let bus = MessageBus::new(config.bus_queue_depth);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 4. Persistence writers ───────────────────────────────────────────
    let trade_writer = Arc::new(TradeWriter::new(
        pool.clone(),
        config.trade_flush_interval,
        config.trade_batch_size,
        shutdown_rx.clone(),
    ));
    let candle_writer = Arc::new(CandleWriter::new(
        pool.clone(),
        config.candle_flush_interval,
        config.candle_batch_size,
        shutdown_rx.clone(),
    ));
    start_persistence(&bus, trade_writer.clone(), candle_writer.clone());

    // ── 5. Candle aggregator ─────────────────────────────────────────────
    let aggregator = CandleAggregator::new(bus.clone());
    aggregator.start(
        config.aggregator_workers,
        config.aggregator_queue_depth,
        shutdown_rx.clone(),
    );

    // ── 6. Alert evaluator ───────────────────────────────────────────────
    let notifier = TelegramNotifier::new(config.telegram_token.clone());
    let alert_evaluator = AlertEvaluator::new(pool.clone(), bus.clone(), notifier);
    if let Err(e) = alert_evaluator.start().await {
        error!(error = %e, "failed to start alert evaluator");
    }

    // ── 7. Paper engine ──────────────────────────────────────────────────
    let paper = PaperEngine::new(
        pool.clone(),
        bus.clone(),
        config.fill_batch_size,
        config.fill_flush_interval,
        config.fill_queue_depth,
    );
    if let Err(e) = paper.start(shutdown_rx.clone()).await {
        error!(error = %e, "failed to start paper engine");
    }

    // ── 8. Strategy runner ───────────────────────────────────────────────
    let runner = StrategyRunner::new(bus.clone());
    for (name, params) in [
        (
            "ma_cross",
            serde_json::json!({ "short_period": 5, "long_period": 20 }),
        ),
        ("rsi_reversal", serde_json::json!({ "period": 14 })),
    ] {
        match build_strategy(name, &params) {
            Ok(strategy) => runner.add_strategy(strategy),
            Err(e) => error!(strategy = name, error = %e, "failed to build strategy"),
        }
    }
    runner.start();

    // ── 9. Ingestion producers ───────────────────────────────────────────
    let connectors = ingest::build_connectors(&config.ingest_targets)?;
    ingest::spawn_ingestion(bus.clone(), connectors, shutdown_rx.clone());

    // ── 10. HTTP API ─────────────────────────────────────────────────────
    let ctx = ApiContext {
        pool: pool.clone(),
        paper: paper.clone(),
        risk: Arc::new(RiskManager::new(pool.clone())),
        alerts: alert_evaluator.clone(),
        backfiller: Arc::new(Backfiller::new(pool.clone())),
        analytics: Arc::new(AnalyticsService::new(pool.clone())),
    };
    let bind_addr = config.bind_addr.clone();
    let api_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = api::serve(ctx, &bind_addr, api_shutdown).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");
    let _ = shutdown_tx.send(true);

    // Bounded drain for in-flight deliveries, then force the final flushes.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    trade_writer.flush_now().await;
    candle_writer.flush_now().await;

    let stats = bus.stats();
    info!(
        published = stats.published,
        dropped = stats.dropped,
        unacked = stats.unacked,
        dropped_trades = aggregator.dropped_trades(),
        dropped_fills = paper.dropped_fills(),
        trade_write_failures = trade_writer.failed_batches(),
        candle_write_failures = candle_writer.failed_batches(),
        "Pulsefeed shut down complete"
    );
    Ok(())
}

/// Subscribe the batch writers to their subjects. Records are acknowledged
/// once they sit in a writer buffer.
fn start_persistence(
    bus: &MessageBus,
    trade_writer: Arc<TradeWriter>,
    candle_writer: Arc<CandleWriter>,
) {
    bus.subscribe(
        "market.raw.*.*",
        SubscribeOpts::durable("trade-saver"),
        move |delivery| {
            match serde_json::from_slice::<Trade>(&delivery.payload) {
                Ok(trade) => trade_writer.add(trade),
                Err(e) => {
                    error!(subject = %delivery.subject, error = %e, "unparseable trade dropped")
                }
            }
            delivery.ack();
        },
    );

    bus.subscribe(
        "market.kline.*.*",
        SubscribeOpts::durable("kline-saver"),
        move |delivery| {
            match serde_json::from_slice::<Candle>(&delivery.payload) {
                Ok(candle) => candle_writer.add(candle),
                Err(e) => {
                    error!(subject = %delivery.subject, error = %e, "unparseable candle dropped")
                }
            }
            delivery.ack();
        },
    );

    info!("persistence subscriptions started");
}
