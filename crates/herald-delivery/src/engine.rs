//! Webhook engine facade wiring registry, matcher and dispatcher.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  dispatch_event  ┌─────────────┐  insert   ┌──────────────┐
//! │ Producer │─────────────────▶│   Matcher   │──────────▶│ WebhookStore │
//! └──────────┘                  └─────────────┘           └──────────────┘
//!                                                                ▲ claim
//! ┌──────────┐                  ┌─────────────┐   POST    ┌──────┴───────┐
//! │ Receiver │◀─────────────────│ HTTP Client │◀──────────│  Dispatcher  │
//! └──────────┘                  └─────────────┘           └──────────────┘
//! ```
//!
//! Every dependency is injected: the store, the clock and the delivery
//! configuration. The dispatcher runs as one background task owned by the
//! engine; [`WebhookEngine::shutdown`] stops and joins it.

use std::sync::Arc;

use herald_core::{
    Clock, Delivery, DeliveryId, DeliveryQuery, DeliveryStatus, EndpointId, Event, TenantId,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    dispatcher::{DeliveryConfig, Dispatcher, DispatcherStats},
    error::{DeliveryError, Result},
    matcher::SubscriptionMatcher,
    registry::EndpointRegistry,
    storage::WebhookStore,
};

/// Per-status delivery totals of a tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    /// Waiting for their next attempt.
    pub pending: i64,
    /// Currently claimed.
    pub processing: i64,
    /// Delivered.
    pub success: i64,
    /// Dead-lettered.
    pub failed: i64,
}

/// Entry point of the webhook delivery core.
pub struct WebhookEngine {
    store: Arc<dyn WebhookStore>,
    registry: EndpointRegistry,
    matcher: SubscriptionMatcher,
    dispatcher: Dispatcher,
    cancellation_token: CancellationToken,
    dispatcher_handle: Option<JoinHandle<Result<()>>>,
}

impl WebhookEngine {
    /// Creates an engine. Nothing runs until [`WebhookEngine::start`].
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if `config` is invalid or
    /// the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn WebhookStore>,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        let registry = EndpointRegistry::new(store.clone(), clock.clone());
        let max_attempts = config.retry_policy.max_attempts;
        let matcher = SubscriptionMatcher::new(store.clone(), clock.clone(), max_attempts);
        let dispatcher = Dispatcher::new(store.clone(), config, clock)?;

        Ok(Self {
            store,
            registry,
            matcher,
            dispatcher,
            cancellation_token: CancellationToken::new(),
            dispatcher_handle: None,
        })
    }

    /// Endpoint registration and secret management.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Direct access to the dispatcher, mainly for driving single cycles.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Queues `event` for its subscribed endpoints. See
    /// [`SubscriptionMatcher::dispatch_event`].
    ///
    /// # Errors
    ///
    /// Returns error if the matching endpoints cannot be read.
    pub async fn dispatch_event(&self, event: &Event) -> Result<usize> {
        self.matcher.dispatch_event(event).await
    }

    /// Spawns the dispatcher loop.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the engine is already
    /// running or has been shut down.
    pub fn start(&mut self) -> Result<()> {
        if self.dispatcher_handle.is_some() {
            return Err(DeliveryError::configuration("engine already started"));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(DeliveryError::configuration("engine has been shut down"));
        }

        let dispatcher = self.dispatcher.clone();
        let token = self.cancellation_token.clone();
        self.dispatcher_handle = Some(tokio::spawn(async move { dispatcher.run(token).await }));

        info!("webhook engine started");
        Ok(())
    }

    /// Returns true while the dispatcher task is alive.
    pub fn is_running(&self) -> bool {
        self.dispatcher_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stops claiming, waits for in-flight deliveries up to the shutdown
    /// timeout and joins the dispatcher task.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if deliveries had to be
    /// aborted and `DeliveryError::InternalError` if the dispatcher task
    /// panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down webhook engine");
        self.cancellation_token.cancel();

        let Some(handle) = self.dispatcher_handle.take() else {
            info!("webhook engine was not started, shutdown completed immediately");
            return Ok(());
        };

        match handle.await {
            Ok(result) => result,
            Err(e) => Err(DeliveryError::internal(format!("dispatcher task failed: {e}"))),
        }
    }

    /// Dispatcher counters.
    pub async fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats().await
    }

    /// One delivery of the tenant.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such delivery.
    pub async fn delivery(&self, tenant_id: TenantId, id: DeliveryId) -> Result<Delivery> {
        self.store
            .find_delivery(id)
            .await?
            .filter(|delivery| delivery.tenant_id == tenant_id)
            .ok_or_else(|| DeliveryError::not_found(format!("delivery {id}")))
    }

    /// Delivery history of one endpoint, newest first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such endpoint.
    pub async fn deliveries_for_endpoint(
        &self,
        tenant_id: TenantId,
        endpoint_id: EndpointId,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        self.registry.get_endpoint(tenant_id, endpoint_id).await?;
        self.query(DeliveryQuery::tenant(tenant_id).endpoint(endpoint_id).limit(limit)).await
    }

    /// Delivery history of a tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn deliveries_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        self.query(DeliveryQuery::tenant(tenant_id).limit(limit)).await
    }

    /// Dead-lettered deliveries of a tenant, optionally for one endpoint.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn dead_letters(
        &self,
        tenant_id: TenantId,
        endpoint_id: Option<EndpointId>,
        limit: i64,
    ) -> Result<Vec<Delivery>> {
        let mut query =
            DeliveryQuery::tenant(tenant_id).status(DeliveryStatus::Failed).limit(limit);
        if let Some(endpoint_id) = endpoint_id {
            query = query.endpoint(endpoint_id);
        }
        self.query(query).await
    }

    /// Totals per status for a tenant.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn delivery_counts(&self, tenant_id: TenantId) -> Result<DeliveryCounts> {
        let mut counts = DeliveryCounts::default();
        for (status, count) in self.store.count_by_status(tenant_id).await? {
            match status {
                DeliveryStatus::Pending => counts.pending = count,
                DeliveryStatus::Processing => counts.processing = count,
                DeliveryStatus::Success => counts.success = count,
                DeliveryStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    async fn query(&self, query: DeliveryQuery) -> Result<Vec<Delivery>> {
        Ok(self.store.find_deliveries(query).await?)
    }
}

impl Drop for WebhookEngine {
    fn drop(&mut self) {
        let running = self.dispatcher_handle.as_ref().is_some_and(|h| !h.is_finished());
        if running && !self.cancellation_token.is_cancelled() {
            warn!("webhook engine dropped without shutdown, cancelling dispatcher");
            self.cancellation_token.cancel();
        }
    }
}
