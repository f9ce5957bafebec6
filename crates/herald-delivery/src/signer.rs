//! HMAC-SHA256 payload signing and outbound header construction.
//!
//! The signature covers exactly the bytes placed on the wire, which are the
//! stored `payload_snapshot`. Nothing is re-serialized between signing and
//! sending. The timestamp header is informational and not signed.

use chrono::{DateTime, SecondsFormat, Utc};
use herald_core::{Delivery, Endpoint, SigningSecret};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the body under the current secret.
pub const HEADER_SIGNATURE: &str = "X-Signature";
/// Hex HMAC-SHA256 of the body under the pending secret during rotation.
pub const HEADER_SIGNATURE_NEXT: &str = "X-Signature-Next";
/// RFC3339 UTC send time.
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
/// Delivery identifier, stable across retries.
pub const HEADER_DELIVERY_ID: &str = "X-Delivery-Id";
/// Event type of the delivered event.
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";

/// Signing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The key could not initialize the MAC.
    #[error("invalid secret key")]
    InvalidSecret,
}

/// Computes the lowercase hex HMAC-SHA256 of `payload` under `secret`.
///
/// # Example
///
/// ```
/// use herald_core::SigningSecret;
/// use herald_delivery::signer::sign;
///
/// let secret = SigningSecret::new("whsec_example");
/// let signature = sign(br#"{"id":"1"}"#, &secret).unwrap();
/// assert_eq!(signature.len(), 64);
/// ```
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the MAC rejects the key.
pub fn sign(payload: &[u8], secret: &SigningSecret) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
        .map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks `signature_hex` against `payload` in constant time.
///
/// Receivers use the same check; it is exposed for them and for tests.
pub fn verify(payload: &[u8], secret: &SigningSecret, signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose().as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Per-attempt signature and identification headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// Signature under the endpoint's current secret.
    pub signature: String,
    /// Signature under the pending secret, when dual signing.
    pub next_signature: Option<String>,
    /// Send time, RFC3339 UTC with second precision.
    pub timestamp: String,
    /// Delivery identifier.
    pub delivery_id: String,
    /// Event type.
    pub event_type: String,
}

impl SignedHeaders {
    /// Signs `delivery.payload_snapshot` for `endpoint` at `sent_at`.
    ///
    /// With `dual_sign` set and a rotation in progress, the body is also
    /// signed with the pending secret so receivers can switch keys without
    /// dropping deliveries.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError` if either secret cannot key the MAC.
    pub fn new(
        delivery: &Delivery,
        endpoint: &Endpoint,
        sent_at: DateTime<Utc>,
        dual_sign: bool,
    ) -> Result<Self, SignatureError> {
        let signature = sign(&delivery.payload_snapshot, &endpoint.secret)?;
        let next_signature = match (&endpoint.pending_secret, dual_sign) {
            (Some(pending), true) => Some(sign(&delivery.payload_snapshot, pending)?),
            _ => None,
        };

        Ok(Self {
            signature,
            next_signature,
            timestamp: sent_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            delivery_id: delivery.id.to_string(),
            event_type: delivery.event_type.clone(),
        })
    }

    /// Header name/value pairs in a stable order.
    pub fn to_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![
            (HEADER_SIGNATURE, self.signature.as_str()),
            (HEADER_TIMESTAMP, self.timestamp.as_str()),
            (HEADER_DELIVERY_ID, self.delivery_id.as_str()),
            (HEADER_EVENT_TYPE, self.event_type.as_str()),
        ];
        if let Some(next) = &self.next_signature {
            pairs.push((HEADER_SIGNATURE_NEXT, next.as_str()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use herald_core::{EndpointId, Event, NewDelivery, TenantId};

    use super::*;

    fn endpoint(pending: Option<&str>) -> Endpoint {
        Endpoint {
            id: EndpointId::new(),
            tenant_id: TenantId::new(),
            url: "https://example.com/hook".into(),
            secret: SigningSecret::new("whsec_current"),
            pending_secret: pending.map(SigningSecret::new),
            enabled: true,
            subscribed_events: vec!["a.created".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn delivery(endpoint: &Endpoint) -> Delivery {
        let event = Event::new(endpoint.tenant_id, "a.created", br#"{"k":1}"#.to_vec());
        NewDelivery::for_endpoint(endpoint, &event, br#"{"id":"x"}"#.to_vec(), 3, Utc::now())
            .into_delivery(Utc::now())
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let secret = SigningSecret::new("Jefe");
        let signature = sign(b"what do ya want for nothing?", &secret).unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signing_is_deterministic_and_keyed() {
        let a = SigningSecret::new("whsec_a");
        let b = SigningSecret::new("whsec_b");

        assert_eq!(sign(b"body", &a).unwrap(), sign(b"body", &a).unwrap());
        assert_ne!(sign(b"body", &a).unwrap(), sign(b"body", &b).unwrap());
        assert_ne!(sign(b"body", &a).unwrap(), sign(b"body ", &a).unwrap());
    }

    #[test]
    fn verify_accepts_only_matching_signatures() {
        let secret = SigningSecret::new("whsec_a");
        let signature = sign(b"payload", &secret).unwrap();

        assert!(verify(b"payload", &secret, &signature));
        assert!(verify(b"payload", &secret, &signature.to_uppercase()));
        assert!(!verify(b"payload!", &secret, &signature));
        assert!(!verify(b"payload", &SigningSecret::new("other"), &signature));
        assert!(!verify(b"payload", &secret, "not-hex"));
    }

    #[test]
    fn headers_sign_the_snapshot() {
        let endpoint = endpoint(None);
        let delivery = delivery(&endpoint);
        let sent_at = DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap();

        let headers = SignedHeaders::new(&delivery, &endpoint, sent_at, true).unwrap();

        assert!(verify(&delivery.payload_snapshot, &endpoint.secret, &headers.signature));
        assert_eq!(headers.timestamp, "2023-11-14T22:13:20Z");
        assert_eq!(headers.delivery_id, delivery.id.to_string());
        assert_eq!(headers.event_type, "a.created");
        assert!(headers.next_signature.is_none());
        assert_eq!(headers.to_pairs().len(), 4);
    }

    #[test]
    fn dual_signing_during_rotation() {
        let endpoint = endpoint(Some("whsec_next"));
        let delivery = delivery(&endpoint);

        let headers = SignedHeaders::new(&delivery, &endpoint, Utc::now(), true).unwrap();
        let next = headers.next_signature.clone().unwrap();
        assert!(verify(&delivery.payload_snapshot, &SigningSecret::new("whsec_next"), &next));
        assert!(headers.to_pairs().contains(&(HEADER_SIGNATURE_NEXT, next.as_str())));

        let single = SignedHeaders::new(&delivery, &endpoint, Utc::now(), false).unwrap();
        assert!(single.next_signature.is_none());
    }
}
