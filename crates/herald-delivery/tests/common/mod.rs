//! Shared fixtures for delivery integration tests.
//!
//! Each environment owns an in-memory store, a manually driven clock and a
//! wiremock receiver, wired into a real engine.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use herald_core::{Clock, Delivery, DeliveryId, Event, TenantId, TestClock};
use herald_delivery::{
    CreatedEndpoint, DeliveryConfig, MemoryWebhookStore, RetryPolicy, WebhookEngine,
};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

pub struct TestEnv {
    pub store: Arc<MemoryWebhookStore>,
    pub clock: TestClock,
    pub http_mock: MockServer,
    pub engine: WebhookEngine,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: DeliveryConfig) -> Self {
        let store = Arc::new(MemoryWebhookStore::new());
        let clock = TestClock::new();
        let engine = WebhookEngine::new(store.clone(), Arc::new(clock.clone()), config)
            .expect("valid test config");

        Self { store, clock, http_mock: MockServer::start().await, engine }
    }

    /// Receiver URL served by the mock.
    pub fn hook_url(&self) -> String {
        format!("{}/hook", self.http_mock.uri())
    }

    pub async fn create_endpoint(&self, tenant_id: TenantId, events: &[&str]) -> CreatedEndpoint {
        self.engine
            .registry()
            .create_endpoint(tenant_id, &self.hook_url(), events.iter().copied())
            .await
            .expect("endpoint registration")
    }

    /// Mounts a receiver answering every POST with `status`.
    pub async fn respond_with(&self, status: u16) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.http_mock)
            .await;
    }

    pub async fn dispatch(&self, tenant_id: TenantId, event_type: &str) -> Event {
        let payload = br#"{"order_id":"ord_1","total":42}"#.to_vec();
        let event = Event::new(tenant_id, event_type, payload);
        self.engine.dispatch_event(&event).await.expect("dispatch");
        event
    }

    pub async fn run_delivery_cycle(&self) -> usize {
        self.engine.dispatcher().run_cycle().await.expect("delivery cycle")
    }

    pub async fn delivery(&self, id: DeliveryId) -> Delivery {
        self.store.deliveries().await.into_iter().find(|d| d.id == id).expect("delivery exists")
    }

    pub async fn only_delivery(&self) -> Delivery {
        let mut all = self.store.deliveries().await;
        assert_eq!(all.len(), 1, "expected exactly one delivery");
        all.remove(0)
    }

    /// Moves the clock to the delivery's next attempt time.
    pub async fn advance_to_next_attempt(&self, id: DeliveryId) {
        let next = self.delivery(id).await.next_attempt_at.expect("delivery is scheduled");
        if next > self.clock.now() {
            self.clock.jump_to(next);
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

/// Defaults with a short request timeout so failing receivers stay fast.
pub fn test_config() -> DeliveryConfig {
    let mut config = DeliveryConfig::default();
    config.client_config.timeout = Duration::from_secs(2);
    config.stale_after = Duration::from_secs(60);
    config.retry_policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
    config
}
