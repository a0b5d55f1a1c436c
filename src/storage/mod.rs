// =============================================================================
// Storage — PostgreSQL pool, schema bootstrap, batch writers, backfill
// =============================================================================

pub mod backfill;
pub mod schema;
pub mod writers;

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Handle to the transactional store. One pool is shared by every component.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to PostgreSQL. Failure here is fatal for the process.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(dsn)
            .await
            .context("failed to connect to PostgreSQL")?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the schema if it does not exist yet. Fatal on failure.
    pub async fn init_schema(&self) -> Result<()> {
        schema::init(&self.pool).await
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("store health check failed")?;
        Ok(())
    }
}
