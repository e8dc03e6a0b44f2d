//! Database connection pool, migrations, and health check.
//!
//! One [`Db`] is created per process and handed by reference (or `Arc`) to
//! every consumer of the store. There is no global instance.

pub mod tasks;

use std::time::Duration;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Pool sizing and per-batch time bounds.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Bound on claim, complete, fail and insert transactions.
    pub batch_timeout: Duration,
    /// Bound on retry transactions.
    pub retry_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_connections: 10,
            batch_timeout: Duration::from_secs(15),
            retry_timeout: Duration::from_secs(10),
        }
    }
}

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
    options: StoreOptions,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, options: StoreOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections.min(options.max_connections))
            .max_lifetime(Duration::from_secs(60 * 60))
            .idle_timeout(Duration::from_secs(30 * 60))
            .connect(url)
            .await?;
        tracing::info!(
            max_connections = options.max_connections,
            "connected to postgres"
        );
        Ok(Self { pool, options })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("postgres pool closed");
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Run `fut` under `limit`. The future owns its transaction, so dropping it
/// on timeout rolls the transaction back.
pub(crate) async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_batch_times_out() {
        let limit = Duration::from_secs(15);
        let result: Result<()> = bounded("claim", limit, async {
            tokio::time::sleep(limit * 2).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout { operation: "claim", timeout } if timeout == limit
        ));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_within_limit_passes_through() {
        let result = bounded("retry", Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn inner_error_is_not_masked() {
        let result: Result<()> = bounded("complete", Duration::from_secs(10), async {
            Err(Error::Validation("bad batch".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
