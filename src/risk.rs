// =============================================================================
// Risk Manager — synchronous pre-trade checks for paper orders
// =============================================================================
//
// Two gates, both computed against the user's paper account:
//   1. Order value — a single order may not exceed 10 % of the balance.
//   2. Exposure    — open positions plus the new order may not exceed 50 %.
//
// Violations surface as structured errors to the placement caller.
// =============================================================================

use rust_decimal::Decimal;
use sqlx::PgPool;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("order size exceeds 10% of account balance")]
    OrderTooLarge,
    #[error("total portfolio exposure would exceed 50% limit")]
    ExposureExceeded,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

pub struct RiskManager {
    pool: PgPool,
}

impl RiskManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Validate an order of `qty` at `price` for `user_id` against both
    /// limits. Market orders are checked at their requested price (zero),
    /// which only the exposure gate can catch.
    pub async fn pre_trade_check(
        &self,
        user_id: i64,
        qty: Decimal,
        price: Decimal,
    ) -> Result<(), RiskError> {
        let balance: Decimal =
            sqlx::query_scalar("SELECT balance FROM paper_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let exposure: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(qty * avg_price), 0) FROM paper_positions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let order_value = qty * price;
        debug!(user_id, %balance, %exposure, %order_value, "pre-trade risk check");
        check_limits(balance, exposure, order_value)
    }
}

/// The pure limit rules, shared by the service and its tests.
fn check_limits(
    balance: Decimal,
    exposure: Decimal,
    order_value: Decimal,
) -> Result<(), RiskError> {
    let max_order = balance * Decimal::new(1, 1); // 10 %
    if order_value > max_order {
        return Err(RiskError::OrderTooLarge);
    }

    let max_exposure = balance * Decimal::new(5, 1); // 50 %
    if exposure + order_value > max_exposure {
        return Err(RiskError::ExposureExceeded);
    }

    Ok(())
}
