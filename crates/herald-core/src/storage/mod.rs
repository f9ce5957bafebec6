//! Database access layer implementing the repository pattern for webhook
//! persistence.
//!
//! The repository layer translates between domain models and the
//! PostgreSQL schema under `migrations/`. All SQL lives in this module.

use std::sync::Arc;

use sqlx::PgPool;

pub mod deliveries;
pub mod endpoints;

use crate::error::Result;

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for endpoint registry operations.
    pub endpoints: Arc<endpoints::Repository>,

    /// Repository for delivery queue operations.
    pub deliveries: Arc<deliveries::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Applies pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or
    /// the query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}
