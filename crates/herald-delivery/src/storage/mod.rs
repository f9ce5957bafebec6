//! Storage abstraction layer for the delivery core.
//!
//! [`WebhookStore`] covers every persistence operation the registry, matcher
//! and dispatcher need. Production uses [`PostgresWebhookStore`] over the
//! herald-core repositories; [`MemoryWebhookStore`] keeps everything in
//! process with the same conditional-transition semantics, for tests and
//! single-node embedding.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{
        Delivery, DeliveryId, DeliveryQuery, DeliveryStatus, Endpoint, EndpointId, NewDelivery,
        SigningSecret, TenantId,
    },
};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryWebhookStore;
pub use postgres::PostgresWebhookStore;

/// Boxed `Send` future returned by [`WebhookStore`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence operations of the webhook delivery core.
///
/// Implementations must make `create_delivery`, `claim_due`,
/// `complete_delivery` and `release_stale` safe under concurrent callers,
/// including callers in other processes sharing the same backing store.
pub trait WebhookStore: Send + Sync + 'static {
    /// Inserts a new endpoint.
    fn insert_endpoint(&self, endpoint: Endpoint) -> BoxFuture<'_, Result<()>>;

    /// Finds an endpoint by ID regardless of tenant.
    fn find_endpoint(&self, id: EndpointId) -> BoxFuture<'_, Result<Option<Endpoint>>>;

    /// Lists a tenant's endpoints, oldest first.
    fn list_endpoints(&self, tenant_id: TenantId) -> BoxFuture<'_, Result<Vec<Endpoint>>>;

    /// Enabled endpoints of `tenant_id` subscribed to `event_type`.
    fn find_matching_endpoints<'a>(
        &'a self,
        tenant_id: TenantId,
        event_type: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>>;

    /// Sets the enabled flag. `None` if the tenant owns no such endpoint.
    fn set_endpoint_enabled(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>>;

    /// Stores a pending secret. `None` if the tenant owns no such endpoint.
    fn set_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        secret: SigningSecret,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>>;

    /// Promotes the pending secret. `None` if there is nothing to promote.
    fn promote_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>>;

    /// Inserts a pending delivery; `None` if one already exists for the
    /// same endpoint and event.
    fn create_delivery(
        &self,
        delivery: NewDelivery,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Delivery>>>;

    /// Atomically moves up to `limit` due deliveries to `processing`,
    /// oldest-due first, stamping them with `claim_token`.
    fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_token: Uuid,
    ) -> BoxFuture<'_, Result<Vec<Delivery>>>;

    /// Writes an attempt's result if the row is still `processing` under
    /// `claim_token`. Returns whether the write applied.
    fn complete_delivery(
        &self,
        delivery: Delivery,
        claim_token: Uuid,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Reverts claims older than `cutoff` to `pending`, due at `now`.
    fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64>>;

    /// Finds a delivery by ID.
    fn find_delivery(&self, id: DeliveryId) -> BoxFuture<'_, Result<Option<Delivery>>>;

    /// Lists deliveries matching `query`, newest first.
    fn find_deliveries(&self, query: DeliveryQuery) -> BoxFuture<'_, Result<Vec<Delivery>>>;

    /// Counts a tenant's deliveries per status.
    fn count_by_status(
        &self,
        tenant_id: TenantId,
    ) -> BoxFuture<'_, Result<Vec<(DeliveryStatus, i64)>>>;
}
