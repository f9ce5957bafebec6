//! In-memory implementation of [`WebhookStore`].
//!
//! All state sits behind one async mutex, so every operation is atomic with
//! respect to every other. Supports injecting failures for exercising the
//! matcher and dispatcher error paths. Data is lost on drop.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use herald_core::{
    error::{CoreError, Result},
    models::{
        Delivery, DeliveryId, DeliveryQuery, DeliveryStatus, Endpoint, EndpointId, EventId,
        NewDelivery, SigningSecret, TenantId,
    },
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BoxFuture, WebhookStore};

#[derive(Default)]
struct State {
    endpoints: HashMap<EndpointId, Endpoint>,
    deliveries: HashMap<DeliveryId, Delivery>,
    by_endpoint_event: HashMap<(EndpointId, EventId), DeliveryId>,
}

#[derive(Default)]
struct Faults {
    create_errors: HashSet<EndpointId>,
    matching_error: Option<String>,
    claim_error: Option<String>,
}

/// In-process store with the same transition guarantees as PostgreSQL.
#[derive(Default)]
pub struct MemoryWebhookStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

impl MemoryWebhookStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every delivery insert for `endpoint_id` fail.
    pub async fn inject_create_error(&self, endpoint_id: EndpointId) {
        self.faults.lock().await.create_errors.insert(endpoint_id);
    }

    /// Makes endpoint matching fail with `message`.
    pub async fn inject_matching_error(&self, message: impl Into<String>) {
        self.faults.lock().await.matching_error = Some(message.into());
    }

    /// Makes claiming fail with `message`.
    pub async fn inject_claim_error(&self, message: impl Into<String>) {
        self.faults.lock().await.claim_error = Some(message.into());
    }

    /// Removes all injected failures.
    pub async fn clear_faults(&self) {
        *self.faults.lock().await = Faults::default();
    }

    /// Snapshot of every delivery, oldest first.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state.deliveries.values().cloned().collect();
        all.sort_by_key(|d| (d.created_at, d.id));
        all
    }

    fn endpoint_order(endpoints: &mut [Endpoint]) {
        endpoints.sort_by_key(|e| (e.created_at, e.id));
    }

    fn update_endpoint(
        state: &mut State,
        tenant_id: TenantId,
        id: EndpointId,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut Endpoint) -> bool,
    ) -> Option<Endpoint> {
        let endpoint = state.endpoints.get_mut(&id).filter(|e| e.tenant_id == tenant_id)?;
        if !apply(endpoint) {
            return None;
        }
        endpoint.updated_at = now;
        Some(endpoint.clone())
    }
}

impl WebhookStore for MemoryWebhookStore {
    fn insert_endpoint(&self, endpoint: Endpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.endpoints.contains_key(&endpoint.id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "unique constraint violation: endpoint {} exists",
                    endpoint.id
                )));
            }
            state.endpoints.insert(endpoint.id, endpoint);
            Ok(())
        })
    }

    fn find_endpoint(&self, id: EndpointId) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move { Ok(self.state.lock().await.endpoints.get(&id).cloned()) })
    }

    fn list_endpoints(&self, tenant_id: TenantId) -> BoxFuture<'_, Result<Vec<Endpoint>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut endpoints: Vec<_> =
                state.endpoints.values().filter(|e| e.tenant_id == tenant_id).cloned().collect();
            Self::endpoint_order(&mut endpoints);
            Ok(endpoints)
        })
    }

    fn find_matching_endpoints<'a>(
        &'a self,
        tenant_id: TenantId,
        event_type: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>>> {
        Box::pin(async move {
            if let Some(message) = self.faults.lock().await.matching_error.clone() {
                return Err(CoreError::Database(message));
            }

            let state = self.state.lock().await;
            let mut endpoints: Vec<_> = state
                .endpoints
                .values()
                .filter(|e| e.tenant_id == tenant_id && e.enabled && e.subscribes_to(event_type))
                .cloned()
                .collect();
            Self::endpoint_order(&mut endpoints);
            Ok(endpoints)
        })
    }

    fn set_endpoint_enabled(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Ok(Self::update_endpoint(&mut state, tenant_id, id, now, |e| {
                e.enabled = enabled;
                true
            }))
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
            let mut state = self.state.lock().await;
            Ok(Self::update_endpoint(&mut state, tenant_id, id, now, |e| {
                e.pending_secret = Some(secret);
                true
            }))
        })
    }

    fn promote_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Endpoint>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Ok(Self::update_endpoint(&mut state, tenant_id, id, now, |e| {
                match e.pending_secret.take() {
                    Some(next) => {
                        e.secret = next;
                        true
                    },
                    None => false,
                }
            }))
        })
    }

    fn create_delivery(
        &self,
        delivery: NewDelivery,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move {
            if self.faults.lock().await.create_errors.contains(&delivery.endpoint_id) {
                return Err(CoreError::Database(format!(
                    "injected insert failure for endpoint {}",
                    delivery.endpoint_id
                )));
            }

            let mut state = self.state.lock().await;
            if !state.endpoints.contains_key(&delivery.endpoint_id) {
                return Err(CoreError::ConstraintViolation(format!(
                    "foreign key constraint violation: endpoint {} missing",
                    delivery.endpoint_id
                )));
            }

            let key = (delivery.endpoint_id, delivery.event_id);
            if state.by_endpoint_event.contains_key(&key) {
                return Ok(None);
            }

            let created = delivery.into_delivery(now);
            state.by_endpoint_event.insert(key, created.id);
            state.deliveries.insert(created.id, created.clone());
            Ok(Some(created))
        })
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_token: Uuid,
    ) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            if let Some(message) = self.faults.lock().await.claim_error.clone() {
                return Err(CoreError::Database(message));
            }

            let mut state = self.state.lock().await;
            let mut due: Vec<_> = state
                .deliveries
                .values()
                .filter(|d| d.is_due(now))
                .map(|d| (d.next_attempt_at, d.created_at, d.id))
                .collect();
            due.sort();
            due.truncate(limit);

            let mut claimed = Vec::with_capacity(due.len());
            for (_, _, id) in due {
                if let Some(delivery) = state.deliveries.get_mut(&id) {
                    delivery.status = DeliveryStatus::Processing;
                    delivery.claimed_at = Some(now);
                    delivery.claim_token = Some(claim_token);
                    delivery.updated_at = now;
                    claimed.push(delivery.clone());
                }
            }
            Ok(claimed)
        })
    }

    fn complete_delivery(
        &self,
        delivery: Delivery,
        claim_token: Uuid,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(current) = state.deliveries.get_mut(&delivery.id) else {
                return Ok(false);
            };

            let owned = current.status == DeliveryStatus::Processing
                && current.claim_token == Some(claim_token);
            if !owned || !current.status.can_transition_to(delivery.status) {
                return Ok(false);
            }
            if delivery.attempt_count < current.attempt_count
                || delivery.attempt_count > current.max_attempts
            {
                return Err(CoreError::ConstraintViolation(format!(
                    "check constraint violation: attempt_count {} invalid for delivery {}",
                    delivery.attempt_count, delivery.id
                )));
            }

            current.status = delivery.status;
            current.attempt_count = delivery.attempt_count;
            current.next_attempt_at = delivery.next_attempt_at;
            current.last_response_code = delivery.last_response_code;
            current.last_error = delivery.last_error;
            current.completed_at = delivery.completed_at;
            current.updated_at = delivery.updated_at;
            current.claimed_at = None;
            current.claim_token = None;
            Ok(true)
        })
    }

    fn release_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut released = 0;
            for delivery in state.deliveries.values_mut() {
                let stale = delivery.status == DeliveryStatus::Processing
                    && delivery.claimed_at.is_some_and(|at| at < cutoff);
                if stale {
                    delivery.status = DeliveryStatus::Pending;
                    delivery.next_attempt_at = Some(now);
                    delivery.updated_at = now;
                    delivery.claimed_at = None;
                    delivery.claim_token = None;
                    released += 1;
                }
            }
            Ok(released)
        })
    }

    fn find_delivery(&self, id: DeliveryId) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move { Ok(self.state.lock().await.deliveries.get(&id).cloned()) })
    }

    fn find_deliveries(&self, query: DeliveryQuery) -> BoxFuture<'_, Result<Vec<Delivery>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut found: Vec<_> =
                state.deliveries.values().filter(|d| query.matches(d)).cloned().collect();
            found.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
            found.truncate(usize::try_from(query.limit.max(0)).unwrap_or(usize::MAX));
            Ok(found)
        })
    }

    fn count_by_status(
        &self,
        tenant_id: TenantId,
    ) -> BoxFuture<'_, Result<Vec<(DeliveryStatus, i64)>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut counts: HashMap<DeliveryStatus, i64> = HashMap::new();
            for delivery in state.deliveries.values().filter(|d| d.tenant_id == tenant_id) {
                *counts.entry(delivery.status).or_default() += 1;
            }
            Ok(counts.into_iter().collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use herald_core::Event;

    use super::*;

    fn endpoint(tenant_id: TenantId, events: &[&str]) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: EndpointId::new(),
            tenant_id,
            url: "https://example.com/hook".into(),
            secret: SigningSecret::new("whsec_test"),
            pending_secret: None,
            enabled: true,
            subscribed_events: events.iter().map(|e| (*e).to_string()).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn seeded() -> (MemoryWebhookStore, Endpoint, Delivery) {
        let store = MemoryWebhookStore::new();
        let tenant = TenantId::new();
        let ep = endpoint(tenant, &["a.created"]);
        store.insert_endpoint(ep.clone()).await.unwrap();

        let event = Event::new(tenant, "a.created", b"{}".to_vec());
        let now = Utc::now();
        let created = store
            .create_delivery(NewDelivery::for_endpoint(&ep, &event, b"{}".to_vec(), 3, now), now)
            .await
            .unwrap()
            .unwrap();
        (store, ep, created)
    }

    #[tokio::test]
    async fn duplicate_pairs_are_ignored() {
        let (store, ep, created) = seeded().await;
        let event = Event { id: created.event_id, ..Event::new(ep.tenant_id, "a.created", vec![]) };
        let now = Utc::now();

        let duplicate = store
            .create_delivery(NewDelivery::for_endpoint(&ep, &event, b"{}".to_vec(), 3, now), now)
            .await
            .unwrap();

        assert!(duplicate.is_none());
        assert_eq!(store.deliveries().await.len(), 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (store, _, created) = seeded().await;
        let store = Arc::new(store);
        let now = Utc::now();

        let (a, b) = tokio::join!(
            store.claim_due(now, 10, Uuid::new_v4()),
            store.claim_due(now, 10, Uuid::new_v4())
        );

        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);
        let stored = store.find_delivery(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Processing);
    }

    #[tokio::test]
    async fn completion_requires_current_claim() {
        let (store, _, _) = seeded().await;
        let token = Uuid::new_v4();
        let now = Utc::now();
        let mut claimed = store.claim_due(now, 10, token).await.unwrap().remove(0);
        claimed.status = DeliveryStatus::Success;
        claimed.attempt_count = 1;
        claimed.next_attempt_at = None;

        assert!(!store.complete_delivery(claimed.clone(), Uuid::new_v4()).await.unwrap());
        assert!(store.complete_delivery(claimed.clone(), token).await.unwrap());
        assert!(!store.complete_delivery(claimed, token).await.unwrap());
    }

    #[tokio::test]
    async fn stale_release_keeps_attempt_count() {
        let (store, _, created) = seeded().await;
        let claimed_at = Utc::now();
        store.claim_due(claimed_at, 10, Uuid::new_v4()).await.unwrap();

        let later = claimed_at + chrono::Duration::seconds(61);
        let released =
            store.release_stale(later - chrono::Duration::seconds(60), later).await.unwrap();

        assert_eq!(released, 1);
        let stored = store.find_delivery(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.attempt_count, 0);
        assert!(stored.is_due(later));
    }

    #[tokio::test]
    async fn fresh_claims_survive_sweep() {
        let (store, _, _) = seeded().await;
        let now = Utc::now();
        store.claim_due(now, 10, Uuid::new_v4()).await.unwrap();

        let released = store.release_stale(now - chrono::Duration::seconds(60), now).await.unwrap();
        assert_eq!(released, 0);
    }

    #[tokio::test]
    async fn rotation_requires_pending_secret() {
        let store = MemoryWebhookStore::new();
        let ep = endpoint(TenantId::new(), &["a"]);
        store.insert_endpoint(ep.clone()).await.unwrap();
        let now = Utc::now();

        assert!(store.promote_pending_secret(ep.tenant_id, ep.id, now).await.unwrap().is_none());

        store
            .set_pending_secret(ep.tenant_id, ep.id, SigningSecret::new("whsec_next"), now)
            .await
            .unwrap();
        let rotated =
            store.promote_pending_secret(ep.tenant_id, ep.id, now).await.unwrap().unwrap();
        assert_eq!(rotated.secret.expose(), "whsec_next");
        assert!(rotated.pending_secret.is_none());
    }

    #[tokio::test]
    async fn foreign_tenant_cannot_mutate_endpoint() {
        let store = MemoryWebhookStore::new();
        let ep = endpoint(TenantId::new(), &["a"]);
        store.insert_endpoint(ep.clone()).await.unwrap();

        let result =
            store.set_endpoint_enabled(TenantId::new(), ep.id, false, Utc::now()).await.unwrap();

        assert!(result.is_none());
        assert!(store.find_endpoint(ep.id).await.unwrap().unwrap().enabled);
    }
}
