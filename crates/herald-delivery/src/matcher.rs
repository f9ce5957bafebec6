//! Fan-out of domain events to subscribed endpoints.

use std::sync::Arc;

use herald_core::{Clock, DeliveryPayload, Event, NewDelivery};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, ErrorCategory, Result},
    storage::WebhookStore,
};

/// Turns events into pending deliveries, one per matching endpoint.
#[derive(Clone)]
pub struct SubscriptionMatcher {
    store: Arc<dyn WebhookStore>,
    clock: Arc<dyn Clock>,
    max_attempts: i32,
}

impl SubscriptionMatcher {
    /// Creates a matcher stamping `max_attempts` onto new deliveries.
    pub fn new(store: Arc<dyn WebhookStore>, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        let max_attempts = i32::try_from(max_attempts).unwrap_or(i32::MAX);
        Self { store, clock, max_attempts }
    }

    /// Queues `event` for every enabled endpoint of its tenant subscribed to
    /// its type.
    ///
    /// The body is rendered once, so every endpoint receives the same bytes.
    /// A failed insert for one endpoint is logged and skipped; the others
    /// still get their delivery. Dispatching an event again creates nothing
    /// new. Returns the number of deliveries created by this call.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the matching endpoints
    /// cannot be read, and `DeliveryError::InternalError` if the body cannot
    /// be rendered. Nothing is queued in either case.
    pub async fn dispatch_event(&self, event: &Event) -> Result<usize> {
        let endpoints = self
            .store
            .find_matching_endpoints(event.tenant_id, &event.event_type)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to match endpoints: {e}")))?;

        if endpoints.is_empty() {
            debug!(
                event_id = %event.id,
                tenant_id = %event.tenant_id,
                event_type = %event.event_type,
                "no subscribed endpoints"
            );
            return Ok(0);
        }

        let body = DeliveryPayload::from_event(event)
            .render()
            .map_err(|e| DeliveryError::internal(format!("failed to render payload: {e}")))?;

        let now = self.clock.now();
        let mut created = 0;

        for endpoint in &endpoints {
            let delivery =
                NewDelivery::for_endpoint(endpoint, event, body.clone(), self.max_attempts, now);

            match self.store.create_delivery(delivery, now).await {
                Ok(Some(delivery)) => {
                    debug!(
                        delivery_id = %delivery.id,
                        endpoint_id = %endpoint.id,
                        event_id = %event.id,
                        "delivery queued"
                    );
                    created += 1;
                },
                Ok(None) => {
                    debug!(
                        endpoint_id = %endpoint.id,
                        event_id = %event.id,
                        "delivery already exists, skipping"
                    );
                },
                Err(e) => {
                    warn!(
                        endpoint_id = %endpoint.id,
                        event_id = %event.id,
                        category = %ErrorCategory::from(&e),
                        error = %e,
                        "failed to queue delivery, continuing fan-out"
                    );
                },
            }
        }

        info!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            matched = endpoints.len(),
            created,
            "event dispatched"
        );

        Ok(created)
    }
}
