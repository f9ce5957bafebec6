//! Multi-tenant webhook delivery with signed payloads and bounded retries.
//!
//! This crate fans domain events out to tenant-registered HTTP endpoints,
//! signs every request body with HMAC-SHA256, and delivers with bounded
//! concurrency, linear backoff and terminal dead-lettering.
//!
//! # Architecture
//!
//! Producers call [`WebhookEngine::dispatch_event`] after committing their
//! own state. The matcher renders the body once and queues one delivery per
//! subscribed endpoint. The dispatcher periodically claims due deliveries
//! with a conditional `pending -> processing` transition, so overlapping
//! cycles and parallel instances never send the same delivery twice:
//!
//! 1. **Sweep** - abandoned `processing` claims go back to `pending`
//! 2. **Claim** - oldest-due first, no more than the free concurrency permits
//! 3. **Send** - sign the stored body and POST it with a hard timeout
//! 4. **Record** - one write per attempt, fenced by the claim token
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{Event, RealClock, TenantId};
//! use herald_delivery::{DeliveryConfig, DeliveryError, MemoryWebhookStore, WebhookEngine};
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let mut engine = WebhookEngine::new(
//!     Arc::new(MemoryWebhookStore::new()),
//!     Arc::new(RealClock::new()),
//!     DeliveryConfig::default(),
//! )?;
//! engine.start()?;
//!
//! let tenant = TenantId::new();
//! let created = engine
//!     .registry()
//!     .create_endpoint(tenant, "https://example.com/hooks", ["order.paid"])
//!     .await?;
//! println!("give this secret to the receiver: {}", created.secret);
//!
//! engine.dispatch_event(&Event::new(tenant, "order.paid", br#"{"total":42}"#.to_vec())).await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod registry;
pub mod retry;
pub mod signer;
pub mod storage;

pub use client::{AttemptOutcome, ClientConfig, DeliveryClient};
pub use dispatcher::{DeliveryConfig, Dispatcher, DispatcherStats};
pub use engine::{DeliveryCounts, WebhookEngine};
pub use error::{DeliveryError, Result};
pub use matcher::SubscriptionMatcher;
pub use registry::{CreatedEndpoint, EndpointRegistry};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use storage::{MemoryWebhookStore, PostgresWebhookStore, WebhookStore};

/// Default number of deliveries claimed per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default pause between dispatcher cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default ceiling on concurrent in-flight deliveries.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
