//! PostgreSQL implementation of [`WebhookStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{
        Delivery, DeliveryId, DeliveryQuery, DeliveryStatus, Endpoint, EndpointId, NewDelivery,
        SigningSecret, TenantId,
    },
    storage::Storage,
};
use uuid::Uuid;

use super::{BoxFuture, WebhookStore};

/// Production store backed by the herald-core repositories.
///
/// Atomicity comes from the database: unique constraints, `SKIP LOCKED`
/// claims and conditional updates. Several dispatcher processes may share
/// one database.
#[derive(Clone)]
pub struct PostgresWebhookStore {
    storage: Arc<Storage>,
}

impl PostgresWebhookStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Underlying repositories.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl WebhookStore for PostgresWebhookStore {
    fn insert_endpoint(&self, endpoint: Endpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.storage.endpoints.create(&endpoint).await?;
            Ok(())
        })
    }

    fn find_endpoint(&self, id: EndpointId) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move { self.storage.endpoints.find_by_id(id).await })
    }

    fn list_endpoints(&self, tenant_id: TenantId) -> BoxFuture<'_, Result<Vec<Endpoint>>> {
        Box::pin(async move { self.storage.endpoints.find_by_tenant(tenant_id).await })
    }

    fn find_matching_endpoints<'a>(
        &'a self,
        tenant_id: TenantId,
        event_type: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        Box::pin(async move { self.storage.endpoints.find_matching(tenant_id, event_type).await })
    }

    fn set_endpoint_enabled(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move {
            self.storage.endpoints.set_enabled(tenant_id, id, enabled, now).await
        })
    }

    fn set_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        secret: SigningSecret,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move {
            self.storage.endpoints.set_pending_secret(tenant_id, id, &secret, now).await
        })
    }

    fn promote_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move {
            self.storage.endpoints.promote_pending_secret(tenant_id, id, now).await
        })
    }

    fn create_delivery(
        &self,
        delivery: NewDelivery,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move { self.storage.deliveries.create(&delivery, now).await })
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_token: Uuid,
    ) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move { self.storage.deliveries.claim_due(now, limit, claim_token).await })
    }

    fn complete_delivery(
        &self,
        delivery: Delivery,
        claim_token: Uuid,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { self.storage.deliveries.complete(&delivery, claim_token).await })
    }

    fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { self.storage.deliveries.release_stale(cutoff, now).await })
    }

    fn find_delivery(&self, id: DeliveryId) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(id).await })
    }

    fn find_deliveries(&self, query: DeliveryQuery) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move { self.storage.deliveries.find(&query).await })
    }

    fn count_by_status(
        &self,
        tenant_id: TenantId,
    ) -> BoxFuture<'_, Result<Vec<(DeliveryStatus, i64)>>> {
        Box::pin(async move { self.storage.deliveries.count_by_status(tenant_id).await })
    }
}
