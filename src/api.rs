// =============================================================================
// REST API — Axum 0.7
// =============================================================================
//
// The operational surface under `/api/v1/`. Identity is out of scope here:
// `user_id` arrives pre-authenticated from the gateway in front of this
// service. CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::alerts::{AlertEvaluator, AlertKind};
use crate::analytics::AnalyticsService;
use crate::paper::{NewOrder, OrderType, PaperEngine, PlaceOrderError};
use crate::risk::{RiskError, RiskManager};
use crate::storage::backfill::Backfiller;
use crate::types::{normalize_symbol, Candle, Period, Side};

// =============================================================================
// Context & router
// =============================================================================

#[derive(Clone)]
pub struct ApiContext {
    pub pool: PgPool,
    pub paper: Arc<PaperEngine>,
    pub risk: Arc<RiskManager>,
    pub alerts: Arc<AlertEvaluator>,
    pub backfiller: Arc<Backfiller>,
    pub analytics: Arc<AnalyticsService>,
}

pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/klines/:symbol", get(get_klines))
        .route("/api/v1/alerts", get(list_alerts).post(create_alert))
        .route("/api/v1/alerts/:id", delete(delete_alert))
        .route("/api/v1/paper/account", get(get_paper_account))
        .route(
            "/api/v1/paper/orders",
            get(get_open_orders).post(create_paper_order),
        )
        .route("/api/v1/paper/positions", get(get_paper_positions))
        .route("/api/v1/backfill", post(trigger_backfill))
        .route("/api/v1/analytics/portfolio", get(get_portfolio_report))
        .layer(cors)
        .with_state(ctx)
}

/// Serve the API until the shutdown signal fires.
pub async fn serve(
    ctx: ApiContext,
    bind_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "server_time": Utc::now().timestamp_millis() }))
}

// =============================================================================
// Klines
// =============================================================================

#[derive(Deserialize)]
struct KlinesQuery {
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "1m".to_string()
}

async fn get_klines(
    State(ctx): State<ApiContext>,
    Path(symbol): Path<String>,
    Query(query): Query<KlinesQuery>,
) -> impl IntoResponse {
    let symbol = normalize_symbol(&symbol);
    let period: Period = match query.period.parse() {
        Ok(p) => p,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let rows = match sqlx::query(
        "SELECT symbol, exchange, open, high, low, close, volume, time
         FROM klines WHERE symbol = $1 AND period = $2
         ORDER BY time DESC LIMIT 100",
    )
    .bind(&symbol)
    .bind(period.as_str())
    .fetch_all(&ctx.pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return internal_error(e).into_response(),
    };

    let klines: Vec<Candle> = rows
        .iter()
        .map(|row| Candle {
            symbol: row.get("symbol"),
            exchange: row.get("exchange"),
            period,
            open: row.get("open"),
            high: row.get("high"),
            low: row.get("low"),
            close: row.get("close"),
            volume: row.get("volume"),
            timestamp: row.get("time"),
        })
        .collect();

    Json(klines).into_response()
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn list_alerts(
    State(ctx): State<ApiContext>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let rows = match sqlx::query(
        "SELECT id, symbol, condition_type, target_value, is_active, created_at
         FROM alerts WHERE user_id = $1",
    )
    .bind(query.user_id)
    .fetch_all(&ctx.pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return internal_error(e).into_response(),
    };

    let alerts: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.get::<i64, _>("id"),
                "symbol": row.get::<String, _>("symbol"),
                "condition_type": row.get::<String, _>("condition_type"),
                "target_value": row.get::<Decimal, _>("target_value"),
                "is_active": row.get::<bool, _>("is_active"),
                "created_at": row.get::<DateTime<Utc>, _>("created_at"),
            })
        })
        .collect();

    Json(alerts).into_response()
}

#[derive(Deserialize)]
struct CreateAlertRequest {
    user_id: i64,
    symbol: String,
    condition_type: String,
    target_value: Decimal,
}

async fn create_alert(
    State(ctx): State<ApiContext>,
    Json(req): Json<CreateAlertRequest>,
) -> impl IntoResponse {
    if req.condition_type.parse::<AlertKind>().is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown condition type: {}", req.condition_type) })),
        )
            .into_response();
    }

    let id: i64 = match sqlx::query_scalar(
        "INSERT INTO alerts (user_id, symbol, condition_type, target_value)
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(req.user_id)
    .bind(normalize_symbol(&req.symbol))
    .bind(&req.condition_type)
    .bind(req.target_value)
    .fetch_one(&ctx.pool)
    .await
    {
        Ok(id) => id,
        Err(e) => return internal_error(e).into_response(),
    };

    // Pick the new alert up without a restart.
    if let Err(e) = ctx.alerts.reload().await {
        warn!(error = %e, "alert reload after create failed");
    }

    (StatusCode::CREATED, Json(json!({ "id": id }))).into_response()
}

async fn delete_alert(
    State(ctx): State<ApiContext>,
    Path(id): Path<i64>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let result = match sqlx::query("DELETE FROM alerts WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(query.user_id)
        .execute(&ctx.pool)
        .await
    {
        Ok(result) => result,
        Err(e) => return internal_error(e).into_response(),
    };

    if result.rows_affected() == 0 {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "alert not found" })),
        )
            .into_response();
    }

    if let Err(e) = ctx.alerts.reload().await {
        warn!(error = %e, "alert reload after delete failed");
    }

    Json(json!({ "message": "alert deleted" })).into_response()
}

// =============================================================================
// Paper trading
// =============================================================================

async fn get_paper_account(
    State(ctx): State<ApiContext>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let balance: Option<Decimal> =
        match sqlx::query_scalar("SELECT balance FROM paper_accounts WHERE user_id = $1")
            .bind(query.user_id)
            .fetch_optional(&ctx.pool)
            .await
        {
            Ok(balance) => balance,
            Err(e) => return internal_error(e).into_response(),
        };

    let balance = match balance {
        Some(balance) => balance,
        None => {
            // First touch initialises the account.
            let initial = Decimal::from(100_000);
            if let Err(e) = sqlx::query(
                "INSERT INTO paper_accounts (user_id, balance) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(query.user_id)
            .bind(initial)
            .execute(&ctx.pool)
            .await
            {
                return internal_error(e).into_response();
            }
            initial
        }
    };

    Json(json!({ "balance": balance })).into_response()
}

#[derive(Deserialize)]
struct CreateOrderRequest {
    user_id: i64,
    symbol: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    #[serde(default)]
    price: Decimal,
    qty: Decimal,
}

async fn create_paper_order(
    State(ctx): State<ApiContext>,
    Json(req): Json<CreateOrderRequest>,
) -> impl IntoResponse {
    let (Ok(side), Ok(order_type)) = (req.side.parse::<Side>(), req.order_type.parse::<OrderType>())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "side must be buy/sell and type market/limit" })),
        )
            .into_response();
    };

    if let Err(e) = ctx
        .risk
        .pre_trade_check(req.user_id, req.qty, req.price)
        .await
    {
        return match e {
            RiskError::Storage(e) => internal_error(e).into_response(),
            e => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": format!("risk limit reached: {e}") })),
            )
                .into_response(),
        };
    }

    let order = NewOrder {
        user_id: req.user_id,
        symbol: normalize_symbol(&req.symbol),
        side,
        order_type,
        price: req.price,
        qty: req.qty,
    };

    match ctx.paper.place_order(order).await {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))).into_response(),
        Err(PlaceOrderError::Storage(e)) => internal_error(e).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct OpenOrdersQuery {
    symbol: String,
}

/// Open orders from the engine's in-memory book for one symbol.
async fn get_open_orders(
    State(ctx): State<ApiContext>,
    Query(query): Query<OpenOrdersQuery>,
) -> impl IntoResponse {
    Json(ctx.paper.open_orders(&normalize_symbol(&query.symbol)))
}

async fn get_paper_positions(
    State(ctx): State<ApiContext>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    let rows = match sqlx::query(
        "SELECT symbol, qty, avg_price FROM paper_positions WHERE user_id = $1 AND qty > 0",
    )
    .bind(query.user_id)
    .fetch_all(&ctx.pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => return internal_error(e).into_response(),
    };

    let positions: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "symbol": row.get::<String, _>("symbol"),
                "qty": row.get::<Decimal, _>("qty"),
                "avg_price": row.get::<Decimal, _>("avg_price"),
            })
        })
        .collect();

    Json(positions).into_response()
}

// =============================================================================
// Backfill
// =============================================================================

#[derive(Deserialize)]
struct BackfillRequest {
    exchange: String,
    symbol: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

async fn trigger_backfill(
    State(ctx): State<ApiContext>,
    Json(req): Json<BackfillRequest>,
) -> impl IntoResponse {
    if req.exchange.to_lowercase() != "binance" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unsupported exchange for backfill: {}", req.exchange) })),
        )
            .into_response();
    }

    let backfiller = ctx.backfiller.clone();
    let symbol = req.symbol.clone();
    tokio::spawn(async move {
        if let Err(e) = backfiller
            .backfill_binance(&symbol, req.start_time, req.end_time)
            .await
        {
            error!(symbol = %symbol, error = %e, "backfill failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": "backfill task started" })),
    )
        .into_response()
}

// =============================================================================
// Analytics
// =============================================================================

async fn get_portfolio_report(
    State(ctx): State<ApiContext>,
    Query(query): Query<UserQuery>,
) -> impl IntoResponse {
    match ctx.analytics.portfolio_report(query.user_id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}
