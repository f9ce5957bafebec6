//! Core domain models and strongly-typed identifiers.
//!
//! Defines endpoints, events and deliveries together with newtype ID
//! wrappers for compile-time type safety. Includes database serialization
//! traits and the state transition rules of the delivery lifecycle.

use std::fmt;

use base64::{prelude::BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default number of attempts a delivery gets before it is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Tenant identifier. Every endpoint, event and delivery is partitioned
    /// by it.
    TenantId
}

uuid_id! {
    /// Identifier of a tenant-registered delivery target.
    EndpointId
}

uuid_id! {
    /// Identifier of a domain event produced outside the delivery core.
    ///
    /// # Example
    ///
    /// ```
    /// use herald_core::models::EventId;
    /// let event_id = EventId::new();
    /// println!("dispatching event: {}", event_id);
    /// ```
    EventId
}

uuid_id! {
    /// Identifier of one queued transmission of one event to one endpoint.
    DeliveryId
}

/// Opaque HMAC signing key.
///
/// The value never appears in `Debug` or `Display` output and is skipped
/// during serialization. Use [`SigningSecret::expose`] at the single place
/// the raw bytes are needed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SigningSecret(String);

impl SigningSecret {
    /// Wraps a raw secret string.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Returns the raw secret for signing.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

impl fmt::Display for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl sqlx::Type<PgDb> for SigningSecret {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SigningSecret {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let secret = <String as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(secret))
    }
}

impl sqlx::Encode<'_, PgDb> for SigningSecret {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Tenant-owned HTTP delivery target.
///
/// Endpoints are soft-disabled rather than deleted so delivery history keeps
/// pointing at a valid row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier.
    pub id: EndpointId,

    /// Owning tenant.
    pub tenant_id: TenantId,

    /// Absolute http(s) URL deliveries are POSTed to.
    pub url: String,

    /// Current signing secret.
    #[serde(skip_serializing)]
    pub secret: SigningSecret,

    /// Next secret while a rotation window is open.
    #[serde(skip_serializing, default)]
    pub pending_secret: Option<SigningSecret>,

    /// Whether new events fan out to this endpoint.
    pub enabled: bool,

    /// Event types this endpoint receives.
    pub subscribed_events: Vec<String>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last registry mutation.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Returns true if the endpoint is subscribed to `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.subscribed_events.iter().any(|e| e == event_type)
    }

    /// Returns true if `event` must be fanned out to this endpoint.
    pub fn matches(&self, event: &Event) -> bool {
        self.enabled && self.tenant_id == event.tenant_id && self.subscribes_to(&event.event_type)
    }
}

/// Domain event handed to the delivery core by a producer.
///
/// The payload is opaque at this layer; it is embedded into the outbound
/// body verbatim when it is valid JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Producer-assigned identifier.
    pub id: EventId,
    /// Tenant that produced the event.
    pub tenant_id: TenantId,
    /// Event type, for example `verification.completed`.
    pub event_type: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// When the producer committed the event.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Creates an event stamped with the current time.
    pub fn new(tenant_id: TenantId, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: EventId::new(),
            tenant_id,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Delivery lifecycle state.
///
/// `Pending` and `Processing` alternate during the claim cycle. `Success`
/// and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for `next_attempt_at` to pass.
    Pending,
    /// Claimed by a dispatcher; an attempt is in flight.
    Processing,
    /// Endpoint answered with a 2xx status.
    Success,
    /// Attempts exhausted. The delivery is dead-lettered.
    Failed,
}

impl DeliveryStatus {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Returns true for states no transition leaves.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Returns true if `self -> next` is a legal lifecycle transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Pending | Self::Success | Self::Failed)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One event queued for one endpoint.
///
/// # Invariants
///
/// - Unique per `(endpoint_id, event_id)`.
/// - `0 <= attempt_count <= max_attempts`.
/// - `payload_snapshot` never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier, sent as `X-Delivery-Id`.
    pub id: DeliveryId,
    /// Tenant owning the endpoint and the event.
    pub tenant_id: TenantId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Source event.
    pub event_id: EventId,
    /// Event type, sent as `X-Event-Type`.
    pub event_type: String,
    /// Lifecycle state.
    pub status: DeliveryStatus,
    /// Attempts observed so far.
    pub attempt_count: i32,
    /// Attempt budget, fixed at creation.
    pub max_attempts: i32,
    /// Exact body bytes that are signed and sent.
    pub payload_snapshot: Vec<u8>,
    /// Earliest time the next attempt may be claimed. `None` once terminal.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Fencing token of the current claim.
    #[serde(skip)]
    pub claim_token: Option<Uuid>,
    /// HTTP status of the most recent response, if any.
    pub last_response_code: Option<i32>,
    /// Error description of the most recent failed attempt.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// When the delivery succeeded.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Returns true if the delivery can be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_attempt_at.is_some_and(|at| at <= now)
    }

    /// Returns true once no further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Insert shape for a fresh pending delivery.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    /// Pre-assigned identifier.
    pub id: DeliveryId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Source event.
    pub event_id: EventId,
    /// Event type.
    pub event_type: String,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Rendered body.
    pub payload_snapshot: Vec<u8>,
    /// First eligible claim time.
    pub next_attempt_at: DateTime<Utc>,
}

impl NewDelivery {
    /// Builds a pending delivery of `event` to `endpoint` with a pre-rendered
    /// body.
    pub fn for_endpoint(
        endpoint: &Endpoint,
        event: &Event,
        payload_snapshot: Vec<u8>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            tenant_id: event.tenant_id,
            endpoint_id: endpoint.id,
            event_id: event.id,
            event_type: event.event_type.clone(),
            max_attempts,
            payload_snapshot,
            next_attempt_at: now,
        }
    }

    /// Materializes the row as it looks right after insertion.
    pub fn into_delivery(self, now: DateTime<Utc>) -> Delivery {
        Delivery {
            id: self.id,
            tenant_id: self.tenant_id,
            endpoint_id: self.endpoint_id,
            event_id: self.event_id,
            event_type: self.event_type,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            payload_snapshot: self.payload_snapshot,
            next_attempt_at: Some(self.next_attempt_at),
            claimed_at: None,
            claim_token: None,
            last_response_code: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum PayloadData<'a> {
    Json(&'a RawValue),
    Text(&'a str),
    Binary(String),
}

/// Outbound JSON body: `{"id", "event", "created_at", "data"}`.
///
/// `data` embeds the event payload verbatim when it is valid JSON and as a
/// JSON string when it is other UTF-8 text. Any other payload is sent as
/// standard base64 with an extra `"data_encoding": "base64"` field, so the
/// receiver can always recover the exact bytes.
#[derive(Serialize)]
pub struct DeliveryPayload<'a> {
    id: EventId,
    event: &'a str,
    created_at: DateTime<Utc>,
    data: PayloadData<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_encoding: Option<&'static str>,
}

impl<'a> DeliveryPayload<'a> {
    /// Encoding marker for payloads that are not UTF-8.
    pub const BASE64_ENCODING: &'static str = "base64";

    /// Borrows the body fields from `event`.
    pub fn from_event(event: &'a Event) -> Self {
        let (data, data_encoding) = match serde_json::from_slice::<&RawValue>(&event.payload) {
            Ok(raw) => (PayloadData::Json(raw), None),
            Err(_) => match std::str::from_utf8(&event.payload) {
                Ok(text) => (PayloadData::Text(text), None),
                Err(_) => (
                    PayloadData::Binary(BASE64_STANDARD.encode(&event.payload)),
                    Some(Self::BASE64_ENCODING),
                ),
            },
        };

        Self {
            id: event.id,
            event: &event.event_type,
            created_at: event.created_at,
            data,
            data_encoding,
        }
    }

    /// Serializes the body into the bytes that get signed and sent.
    pub fn render(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Filter for delivery history and dead-letter listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryQuery {
    /// Tenant scope. Always required.
    pub tenant_id: TenantId,
    /// Restrict to one endpoint.
    pub endpoint_id: Option<EndpointId>,
    /// Restrict to one status.
    pub status: Option<DeliveryStatus>,
    /// Maximum number of rows, newest first.
    pub limit: i64,
}

impl DeliveryQuery {
    /// Default page size.
    pub const DEFAULT_LIMIT: i64 = 100;

    /// All deliveries of a tenant.
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self { tenant_id, endpoint_id: None, status: None, limit: Self::DEFAULT_LIMIT }
    }

    /// Narrows the query to one endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint_id: EndpointId) -> Self {
        self.endpoint_id = Some(endpoint_id);
        self
    }

    /// Narrows the query to one status.
    #[must_use]
    pub fn status(mut self, status: DeliveryStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Caps the number of rows returned.
    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Returns true if `delivery` satisfies the filter.
    pub fn matches(&self, delivery: &Delivery) -> bool {
        delivery.tenant_id == self.tenant_id
            && self.endpoint_id.is_none_or(|id| delivery.endpoint_id == id)
            && self.status.is_none_or(|s| delivery.status == s)
    }
}
