//! Herald webhook delivery service.
//!
//! Runs the delivery engine against PostgreSQL: applies migrations, starts
//! the dispatcher and drains in-flight deliveries on SIGINT or SIGTERM.
//! Producers enqueue events through the `herald-delivery` library API.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{storage::Storage, RealClock};
use herald_delivery::{DeliveryError, PostgresWebhookStore, WebhookEngine};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(config.log_json)?;

    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        batch_size = config.batch_size,
        max_concurrency = config.max_concurrency,
        poll_interval_secs = config.poll_interval_secs,
        request_timeout_secs = config.request_timeout_secs,
        max_attempts = config.max_attempts,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.migrate().await.context("failed to run database migrations")?;
    info!("database migrations completed");

    let store = Arc::new(PostgresWebhookStore::new(storage));
    let mut engine =
        WebhookEngine::new(store, Arc::new(RealClock::new()), config.to_delivery_config())
            .context("failed to build webhook engine")?;
    engine.start().context("failed to start webhook engine")?;

    info!("herald is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight deliveries");

    match engine.shutdown().await {
        Ok(()) => info!("webhook engine stopped"),
        Err(DeliveryError::ShutdownTimeout { timeout_seconds, abandoned }) => {
            warn!(
                timeout_seconds,
                abandoned, "shutdown grace period expired, abandoned deliveries will be retried"
            );
        },
        Err(e) => error!(error = %e, "webhook engine stopped with error"),
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("herald shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing(json: bool) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,herald=debug,herald_delivery=debug"))
        .context("invalid RUST_LOG filter")?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true))
            .try_init()
    }
    .context("failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
