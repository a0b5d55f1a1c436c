// =============================================================================
// Analytics — portfolio valuation and return statistics
// =============================================================================
//
// Read-only over the store: marks open paper positions at the latest stored
// close (falling back to the average entry when a symbol has no candles yet)
// and reports the return against the account's initial balance.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Row};

/// Every paper account starts at 100 000.
const INITIAL_BALANCE: i64 = 100_000;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub cash_balance: Decimal,
    /// Cash plus open positions marked at the latest close.
    pub market_value: Decimal,
    /// Percentage return versus the initial balance.
    pub total_return_pct: Decimal,
    pub position_count: usize,
}

pub struct AnalyticsService {
    pool: PgPool,
}

impl AnalyticsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn portfolio_report(&self, user_id: i64) -> Result<PerformanceReport> {
        let balance: Decimal =
            sqlx::query_scalar("SELECT balance FROM paper_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to load paper account")?;

        let positions = sqlx::query(
            "SELECT symbol, qty, avg_price FROM paper_positions WHERE user_id = $1 AND qty > 0",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load paper positions")?;

        let mut market_value = balance;
        for row in &positions {
            let symbol: String = row.get("symbol");
            let qty: Decimal = row.get("qty");
            let avg_price: Decimal = row.get("avg_price");

            let latest_close: Option<Decimal> = sqlx::query_scalar(
                "SELECT close FROM klines WHERE symbol = $1 ORDER BY time DESC LIMIT 1",
            )
            .bind(&symbol)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load latest close")?;

            market_value += qty * latest_close.unwrap_or(avg_price);
        }

        let initial = Decimal::from(INITIAL_BALANCE);
        let total_return_pct = (market_value - initial) / initial * Decimal::ONE_HUNDRED;

        Ok(PerformanceReport {
            cash_balance: balance,
            market_value,
            total_return_pct,
            position_count: positions.len(),
        })
    }
}

/// Annualisation-free Sharpe ratio over a plain return series.
/// Zero when the series is empty or has no variance.
pub fn calculate_sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return 0.0;
    }

    (mean - risk_free_rate) / std_dev
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharpe_positive_for_positive_returns() {
        let returns = [0.01, 0.02, -0.01, 0.03, 0.01];
        assert!(calculate_sharpe_ratio(&returns, 0.001) > 0.0);
    }

    #[test]
    fn sharpe_zero_for_flat_returns() {
        assert_eq!(calculate_sharpe_ratio(&[0.0, 0.0, 0.0], 0.001), 0.0);
    }

    #[test]
    fn sharpe_zero_for_empty_series() {
        assert_eq!(calculate_sharpe_ratio(&[], 0.001), 0.0);
    }

    #[test]
    fn sharpe_negative_when_mean_below_risk_free() {
        let returns = [-0.02, -0.01, -0.03, 0.0];
        assert!(calculate_sharpe_ratio(&returns, 0.01) < 0.0);
    }
}
