//! Core domain models, persistence and time primitives.
//!
//! Provides strongly-typed identifiers, the endpoint/event/delivery model,
//! PostgreSQL repositories and a clock abstraction for the webhook delivery
//! core. The delivery crate builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Delivery, DeliveryId, DeliveryPayload, DeliveryQuery, DeliveryStatus, Endpoint, EndpointId,
    Event, EventId, NewDelivery, SigningSecret, TenantId, DEFAULT_MAX_ATTEMPTS,
};
pub use time::{Clock, RealClock, TestClock};
