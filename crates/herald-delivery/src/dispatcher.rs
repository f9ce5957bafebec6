//! Claim-and-send loop with bounded concurrency.
//!
//! Each cycle first returns stale claims to the queue, then claims as many
//! due deliveries as there are free concurrency permits (capped by the batch
//! size) and spawns one task per claimed row. A task signs the stored body,
//! sends it, runs the retry policy and persists the result with a single
//! write fenced by the claim token.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use herald_core::{Clock, Delivery, DeliveryId, DeliveryStatus, EndpointId};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{RwLock, Semaphore},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{AttemptOutcome, ClientConfig, DeliveryClient},
    error::{DeliveryError, ErrorCategory, Result},
    retry::RetryPolicy,
    signer::SignedHeaders,
    storage::WebhookStore,
};

/// Configuration for the delivery dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum deliveries claimed per cycle.
    pub batch_size: usize,

    /// Pause between cycles that did not fill a batch.
    pub poll_interval: Duration,

    /// Ceiling on deliveries in flight at once.
    pub max_concurrency: usize,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff and attempt budget.
    pub retry_policy: RetryPolicy,

    /// Age after which a `processing` claim is presumed abandoned.
    pub stale_after: Duration,

    /// How long shutdown waits for in-flight deliveries.
    pub shutdown_timeout: Duration,

    /// Also sign with the pending secret while a rotation is in progress.
    pub dual_sign: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let client_config = ClientConfig::default();
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            max_concurrency: crate::DEFAULT_MAX_CONCURRENCY,
            stale_after: client_config.timeout * 2,
            client_config,
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            dual_sign: true,
        }
    }
}

impl DeliveryConfig {
    /// Checks the settings are usable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` for zero sizes, a zero
    /// attempt budget, or a stale threshold that does not exceed the request
    /// timeout.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(DeliveryError::configuration("max_concurrency must be positive"));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be positive"));
        }
        if self.client_config.timeout.is_zero() {
            return Err(DeliveryError::configuration("request timeout must be positive"));
        }
        if self.stale_after <= self.client_config.timeout {
            return Err(DeliveryError::configuration(
                "stale_after must be longer than the request timeout",
            ));
        }
        Ok(())
    }
}

/// Counters for dispatcher monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Deliveries claimed since startup.
    pub claimed: u64,
    /// Deliveries that reached `success`.
    pub succeeded: u64,
    /// Failed attempts rescheduled for a later retry.
    pub retried: u64,
    /// Deliveries that exhausted their attempts.
    pub dead_lettered: u64,
    /// Abandoned claims returned to `pending`.
    pub stale_released: u64,
    /// Outcome writes rejected because the claim was no longer held.
    pub lost_writes: u64,
    /// Outcome writes that failed in storage.
    pub write_errors: u64,
    /// Deliveries currently being attempted.
    pub in_flight: usize,
    /// Highest `in_flight` observed.
    pub peak_in_flight: usize,
}

/// Claims due deliveries and attempts them concurrently.
///
/// Cheap to clone; clones share the store, client, permits and stats.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn WebhookStore>,
    client: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
    config: Arc<DeliveryConfig>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    stats: Arc<RwLock<DispatcherStats>>,
}

/// Counts one running delivery task. Released on drop, so aborted tasks
/// are accounted for.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(counter.clone()), current)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Result of one claim step.
#[derive(Debug, Clone, Copy)]
struct Claimed {
    /// Rows claimed.
    count: usize,
    /// Rows that could have been claimed given batch size and free permits.
    capacity: usize,
}

impl Claimed {
    /// Every slot was filled, so more rows are probably due.
    fn saturated(self) -> bool {
        self.count > 0 && self.count == self.capacity
    }
}

impl Dispatcher {
    /// Creates a dispatcher over `store`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the configuration is
    /// invalid or the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        Ok(Self {
            store,
            client,
            clock,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            config: Arc::new(config),
            stats: Arc::new(RwLock::new(DispatcherStats::default())),
        })
    }

    /// Returns a snapshot of the counters.
    pub async fn stats(&self) -> DispatcherStats {
        let mut stats = self.stats.read().await.clone();
        stats.in_flight = self.in_flight.load(Ordering::SeqCst);
        stats
    }

    /// Runs one cycle and waits for every delivery it claimed.
    ///
    /// Returns the number of deliveries claimed.
    ///
    /// # Errors
    ///
    /// Returns error if releasing stale claims or claiming fails.
    pub async fn run_cycle(&self) -> Result<usize> {
        let mut tasks = JoinSet::new();
        let claimed = self.dispatch_due(&mut tasks).await;

        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }

        claimed.map(|claimed| claimed.count)
    }

    /// Coordinating loop. Runs cycles until `cancellation_token` fires, then
    /// drains in-flight deliveries.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if in-flight deliveries did
    /// not finish within the shutdown timeout. Those rows stay `processing`
    /// until the stale sweep returns them to the queue.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        info!(
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "delivery dispatcher starting"
        );

        let mut tasks = JoinSet::new();

        loop {
            if cancellation_token.is_cancelled() {
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                log_join(result);
            }

            match self.dispatch_due(&mut tasks).await {
                Ok(claimed) if claimed.saturated() => continue,
                // Permits exhausted by our own tasks: resume as soon as one ends.
                Ok(claimed) if claimed.capacity == 0 && !tasks.is_empty() => {
                    tokio::select! {
                        Some(result) = tasks.join_next() => log_join(result),
                        () = cancellation_token.cancelled() => break,
                    }
                    continue;
                },
                Ok(_) => {},
                Err(error) => error!(error = %error, "dispatch cycle failed"),
            }

            tokio::select! {
                () = self.clock.sleep(self.config.poll_interval) => {}
                () = cancellation_token.cancelled() => break,
            }
        }

        info!(in_flight = tasks.len(), "delivery dispatcher stopping");
        self.drain(tasks).await
    }

    async fn drain(&self, mut tasks: JoinSet<()>) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join(result);
            }
        })
        .await;

        if finished.is_ok() {
            info!("delivery dispatcher stopped");
            return Ok(());
        }

        let abandoned = tasks.len();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        warn!(
            abandoned,
            timeout_seconds = timeout.as_secs(),
            "shutdown grace period exceeded, aborted in-flight deliveries"
        );
        Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs(), abandoned })
    }

    /// Sweeps stale claims, claims due rows and spawns their tasks.
    async fn dispatch_due(&self, tasks: &mut JoinSet<()>) -> Result<Claimed> {
        self.release_stale().await?;

        let capacity = self.config.batch_size.min(self.permits.available_permits());
        if capacity == 0 {
            debug!("all delivery permits in use, skipping claim");
            return Ok(Claimed { count: 0, capacity });
        }

        let claim_token = Uuid::new_v4();
        let claimed = self
            .store
            .claim_due(self.clock.now(), capacity, claim_token)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim deliveries: {e}")))?;
        let count = claimed.len();

        if count > 0 {
            debug!(claimed = count, %claim_token, "claimed due deliveries");
            self.stats.write().await.claimed += count as u64;
        }

        for delivery in claimed {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return Err(DeliveryError::internal("delivery semaphore closed"));
            };
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.process(delivery, claim_token).await;
            });
        }

        Ok(Claimed { count, capacity })
    }

    async fn release_stale(&self) -> Result<()> {
        let now = self.clock.now();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .map_err(|e| DeliveryError::configuration(format!("invalid stale_after: {e}")))?;

        let released = self.store.release_stale(now - stale_after, now).await.map_err(|e| {
            DeliveryError::database(format!("failed to release stale claims: {e}"))
        })?;

        if released > 0 {
            warn!(released, "returned abandoned claims to the queue");
            self.stats.write().await.stale_released += released;
        }
        Ok(())
    }

    /// Attempts one claimed delivery and records the outcome.
    async fn process(&self, delivery: Delivery, claim_token: Uuid) {
        let (_in_flight, current) = InFlight::enter(&self.in_flight);
        {
            let mut stats = self.stats.write().await;
            stats.peak_in_flight = stats.peak_in_flight.max(current);
        }

        let delivery_id = delivery.id;
        let endpoint_id = delivery.endpoint_id;
        let outcome = self.attempt(&delivery).await;
        let updated = self.config.retry_policy.on_outcome(delivery, &outcome, self.clock.now());
        let status = updated.status;
        let attempt = updated.attempt_count;

        match self.store.complete_delivery(updated, claim_token).await {
            Ok(true) => {
                let mut stats = self.stats.write().await;
                match status {
                    DeliveryStatus::Success => stats.succeeded += 1,
                    DeliveryStatus::Failed => stats.dead_lettered += 1,
                    DeliveryStatus::Pending | DeliveryStatus::Processing => stats.retried += 1,
                }
                drop(stats);
                log_outcome(&outcome, delivery_id, endpoint_id, attempt, status);
            },
            Ok(false) => {
                warn!(
                    %delivery_id,
                    %endpoint_id,
                    attempt,
                    "claim lost before outcome was recorded, discarding result"
                );
                self.stats.write().await.lost_writes += 1;
            },
            Err(e) => {
                error!(
                    %delivery_id,
                    %endpoint_id,
                    category = %ErrorCategory::from(&e),
                    error = %e,
                    "failed to record delivery outcome"
                );
                self.stats.write().await.write_errors += 1;
            },
        }
    }

    /// Resolves the endpoint, signs and sends. Never errors: every problem
    /// becomes a failed attempt.
    async fn attempt(&self, delivery: &Delivery) -> AttemptOutcome {
        let endpoint = match self.store.find_endpoint(delivery.endpoint_id).await {
            Ok(Some(endpoint)) if endpoint.enabled => endpoint,
            Ok(Some(_)) => {
                return AttemptOutcome::failed(DeliveryError::invalid_endpoint(
                    "endpoint is disabled",
                ));
            },
            Ok(None) => {
                return AttemptOutcome::failed(DeliveryError::not_found(format!(
                    "endpoint {}",
                    delivery.endpoint_id
                )));
            },
            Err(e) => return AttemptOutcome::failed(DeliveryError::from(e)),
        };

        let headers =
            match SignedHeaders::new(delivery, &endpoint, self.clock.now(), self.config.dual_sign)
            {
                Ok(headers) => headers,
                Err(e) => return AttemptOutcome::failed(DeliveryError::internal(e.to_string())),
            };

        self.client.deliver(&endpoint.url, delivery.payload_snapshot.clone(), &headers).await
    }
}

fn log_outcome(
    outcome: &AttemptOutcome,
    delivery_id: DeliveryId,
    endpoint_id: EndpointId,
    attempt: i32,
    status: DeliveryStatus,
) {
    match status {
        DeliveryStatus::Success => info!(
            %delivery_id,
            %endpoint_id,
            attempt,
            status_code = outcome.status_code(),
            duration_ms = outcome.duration().as_millis(),
            "webhook delivered"
        ),
        DeliveryStatus::Failed => warn!(
            %delivery_id,
            %endpoint_id,
            attempt,
            status_code = outcome.status_code(),
            category = outcome.error_category().map(tracing::field::display),
            error = outcome.error_message().as_deref(),
            "delivery dead-lettered after final attempt"
        ),
        DeliveryStatus::Pending | DeliveryStatus::Processing => info!(
            %delivery_id,
            %endpoint_id,
            attempt,
            status_code = outcome.status_code(),
            category = outcome.error_category().map(tracing::field::display),
            error = outcome.error_message().as_deref(),
            "delivery attempt failed, retry scheduled"
        ),
    }
}

fn log_join(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "delivery task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;
    use crate::storage::MemoryWebhookStore;

    #[test]
    fn default_config_is_valid() {
        let config = DeliveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stale_after, Duration::from_secs(60));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn invalid_configs_rejected() {
        let zero_batch = DeliveryConfig { batch_size: 0, ..Default::default() };
        assert!(zero_batch.validate().is_err());

        let zero_concurrency = DeliveryConfig { max_concurrency: 0, ..Default::default() };
        assert!(zero_concurrency.validate().is_err());

        let short_stale =
            DeliveryConfig { stale_after: Duration::from_secs(30), ..Default::default() };
        assert!(short_stale.validate().is_err());
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let dispatcher = Dispatcher::new(
            Arc::new(MemoryWebhookStore::new()),
            DeliveryConfig::default(),
            Arc::new(TestClock::new()),
        )
        .unwrap();

        assert_eq!(dispatcher.run_cycle().await.unwrap(), 0);
        assert_eq!(dispatcher.stats().await, DispatcherStats::default());
    }

    #[tokio::test]
    async fn claim_failure_is_reported() {
        let store = Arc::new(MemoryWebhookStore::new());
        store.inject_claim_error("connection reset").await;
        let dispatcher =
            Dispatcher::new(store, DeliveryConfig::default(), Arc::new(TestClock::new())).unwrap();

        let result = dispatcher.run_cycle().await;
        assert!(matches!(result, Err(DeliveryError::DatabaseError { .. })));
    }

    #[tokio::test]
    async fn in_flight_released_when_tasks_are_aborted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for _ in 0..2 {
            let counter = counter.clone();
            tasks.spawn(async move {
                let _guard = InFlight::enter(&counter);
                std::future::pending::<()>().await;
            });
        }
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // Spawned but never polled: must not count.
        let unpolled = counter.clone();
        tasks.spawn(async move {
            let _guard = InFlight::enter(&unpolled);
        });
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn saturation_requires_a_full_claim() {
        assert!(Claimed { count: 2, capacity: 2 }.saturated());
        assert!(!Claimed { count: 1, capacity: 2 }.saturated());
        assert!(!Claimed { count: 0, capacity: 0 }.saturated());
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let dispatcher = Dispatcher::new(
            Arc::new(MemoryWebhookStore::new()),
            DeliveryConfig { poll_interval: Duration::from_millis(10), ..Default::default() },
            Arc::new(herald_core::RealClock::new()),
        )
        .unwrap();
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            async move { dispatcher.run(token).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
