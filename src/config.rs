//! Configuration for the herald delivery service.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{BackoffStrategy, ClientConfig, DeliveryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";
const ENV_PREFIX: &str = "HERALD_";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. `HERALD_`-prefixed environment variables, plus plain `DATABASE_URL`
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults
///
/// # Example
///
/// ```toml
/// database_url = "postgresql://herald:secret@db:5432/herald"
/// batch_size = 100
/// backoff_strategy = "exponential"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    pub database_max_connections: u32,

    // Dispatcher
    /// Seconds between dispatcher cycles.
    pub poll_interval_secs: u64,
    /// Maximum deliveries claimed per cycle.
    pub batch_size: usize,
    /// Ceiling on concurrent in-flight deliveries.
    pub max_concurrency: usize,
    /// Per-attempt HTTP timeout in seconds.
    pub request_timeout_secs: u64,
    /// Age in seconds after which a claim is presumed abandoned. Defaults to
    /// twice the request timeout.
    pub stale_after_secs: Option<u64>,
    /// Seconds shutdown waits for in-flight deliveries.
    pub shutdown_grace_secs: u64,
    /// Sign with the pending secret too while a rotation is in progress.
    pub dual_sign: bool,

    // Retry
    /// Attempts per delivery, including the first.
    pub max_attempts: u32,
    /// Backoff unit in seconds.
    pub retry_base_interval_secs: u64,
    /// Longest delay between attempts in seconds.
    pub retry_max_interval_secs: u64,
    /// How delays grow between attempts.
    pub backoff_strategy: BackoffStrategy,

    // Logging
    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
}

impl Config {
    /// Loads configuration from defaults, `herald.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Same as [`Config::load`] with an explicit configuration file path.
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::raw().only(&["DATABASE_URL"]))
            .merge(Env::prefixed(ENV_PREFIX));

        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Stale-claim threshold with the default applied.
    pub fn stale_after(&self) -> Duration {
        let default_secs = self.request_timeout_secs.saturating_mul(2);
        Duration::from_secs(self.stale_after_secs.unwrap_or(default_secs))
    }

    /// Converts to the delivery crate's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_concurrency: self.max_concurrency,
            client_config: ClientConfig {
                timeout: Duration::from_secs(self.request_timeout_secs),
                ..ClientConfig::default()
            },
            retry_policy: self.to_retry_policy(),
            stale_after: self.stale_after(),
            shutdown_timeout: Duration::from_secs(self.shutdown_grace_secs),
            dual_sign: self.dual_sign,
        }
    }

    /// Converts to the retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_interval: Duration::from_secs(self.retry_base_interval_secs),
            max_interval: Duration::from_secs(self.retry_max_interval_secs),
            jitter_factor: 0.0,
            backoff_strategy: self.backoff_strategy,
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                // Skip the scheme separator in "postgresql://host".
                if !self.database_url[colon_pos..].starts_with("://") {
                    let mut masked = self.database_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.database_url.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than 0");
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }

        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }

        if self.stale_after() <= Duration::from_secs(self.request_timeout_secs) {
            anyhow::bail!("stale_after_secs must exceed request_timeout_secs");
        }

        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.retry_base_interval_secs == 0 {
            anyhow::bail!("retry_base_interval_secs must be greater than 0");
        }

        if self.retry_max_interval_secs < self.retry_base_interval_secs {
            anyhow::bail!("retry_max_interval_secs cannot be below retry_base_interval_secs");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/herald".to_string(),
            database_max_connections: 10,
            poll_interval_secs: herald_delivery::DEFAULT_POLL_INTERVAL.as_secs(),
            batch_size: herald_delivery::DEFAULT_BATCH_SIZE,
            max_concurrency: herald_delivery::DEFAULT_MAX_CONCURRENCY,
            request_timeout_secs: herald_delivery::DEFAULT_TIMEOUT_SECONDS,
            stale_after_secs: None,
            shutdown_grace_secs: 30,
            dual_sign: true,
            max_attempts: 3,
            retry_base_interval_secs: 60,
            retry_max_interval_secs: 3600,
            backoff_strategy: BackoffStrategy::Linear,
            log_json: false,
        }
    }
}
