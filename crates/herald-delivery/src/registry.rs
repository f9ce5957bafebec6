//! Tenant-scoped endpoint registration and secret management.
//!
//! Validation happens here, before anything reaches the delivery queue: a
//! malformed URL or an empty subscription set is rejected synchronously.
//! Signing secrets are returned exactly once, when issued.

use std::{collections::BTreeSet, sync::Arc};

use herald_core::{Clock, Endpoint, EndpointId, SigningSecret, TenantId};
use tracing::info;

use crate::{
    error::{DeliveryError, Result},
    storage::WebhookStore,
};

/// Prefix of generated signing secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// A newly created endpoint together with its signing secret.
///
/// This is the only place the plaintext secret is ever handed out.
#[derive(Debug, Clone)]
pub struct CreatedEndpoint {
    /// The stored endpoint. Serializing it omits the secret.
    pub endpoint: Endpoint,
    /// Plaintext secret for the receiver to verify signatures with.
    pub secret: String,
}

/// Endpoint registry backed by a [`WebhookStore`].
#[derive(Clone)]
pub struct EndpointRegistry {
    store: Arc<dyn WebhookStore>,
    clock: Arc<dyn Clock>,
}

impl EndpointRegistry {
    /// Creates a registry over `store`.
    pub fn new(store: Arc<dyn WebhookStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Registers an endpoint and issues its signing secret.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidEndpoint` if the URL is not an absolute
    /// http(s) URL with a host or if no event type is given, and
    /// `DeliveryError::DatabaseError` if the insert fails.
    pub async fn create_endpoint<I, S>(
        &self,
        tenant_id: TenantId,
        url: &str,
        subscribed_events: I,
    ) -> Result<CreatedEndpoint>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let url = validate_url(url)?;
        let events = normalize_events(subscribed_events)?;

        let secret = generate_secret();
        let now = self.clock.now();
        let endpoint = Endpoint {
            id: EndpointId::new(),
            tenant_id,
            url,
            secret: SigningSecret::new(secret.clone()),
            pending_secret: None,
            enabled: true,
            subscribed_events: events,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_endpoint(endpoint.clone()).await?;

        info!(
            endpoint_id = %endpoint.id,
            tenant_id = %tenant_id,
            events = endpoint.subscribed_events.len(),
            "endpoint registered"
        );

        Ok(CreatedEndpoint { endpoint, secret })
    }

    /// Lists a tenant's endpoints, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::DatabaseError` if the query fails.
    pub async fn list_endpoints(&self, tenant_id: TenantId) -> Result<Vec<Endpoint>> {
        Ok(self.store.list_endpoints(tenant_id).await?)
    }

    /// Fetches one of the tenant's endpoints.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such endpoint.
    pub async fn get_endpoint(&self, tenant_id: TenantId, id: EndpointId) -> Result<Endpoint> {
        self.store
            .find_endpoint(id)
            .await?
            .filter(|endpoint| endpoint.tenant_id == tenant_id)
            .ok_or_else(|| endpoint_not_found(id))
    }

    /// Re-enables deliveries to an endpoint.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such endpoint.
    pub async fn enable_endpoint(&self, tenant_id: TenantId, id: EndpointId) -> Result<Endpoint> {
        self.set_enabled(tenant_id, id, true).await
    }

    /// Stops new deliveries to an endpoint. History is preserved.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such endpoint.
    pub async fn disable_endpoint(&self, tenant_id: TenantId, id: EndpointId) -> Result<Endpoint> {
        self.set_enabled(tenant_id, id, false).await
    }

    async fn set_enabled(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        enabled: bool,
    ) -> Result<Endpoint> {
        let endpoint = self
            .store
            .set_endpoint_enabled(tenant_id, id, enabled, self.clock.now())
            .await?
            .ok_or_else(|| endpoint_not_found(id))?;

        info!(endpoint_id = %id, tenant_id = %tenant_id, enabled, "endpoint updated");
        Ok(endpoint)
    }

    /// Issues a pending secret. Until the rotation completes, deliveries are
    /// signed with the current secret and, when dual signing is on, also
    /// with the pending one. Starting again replaces the pending secret.
    ///
    /// Returns the plaintext pending secret.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such endpoint.
    pub async fn begin_secret_rotation(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
    ) -> Result<String> {
        let secret = generate_secret();
        self.store
            .set_pending_secret(tenant_id, id, SigningSecret::new(secret.clone()), self.clock.now())
            .await?
            .ok_or_else(|| endpoint_not_found(id))?;

        info!(endpoint_id = %id, tenant_id = %tenant_id, "secret rotation started");
        Ok(secret)
    }

    /// Promotes the pending secret to current.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the tenant owns no such endpoint
    /// and `DeliveryError::InvalidEndpoint` if no rotation is in progress.
    pub async fn complete_secret_rotation(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
    ) -> Result<Endpoint> {
        if let Some(endpoint) =
            self.store.promote_pending_secret(tenant_id, id, self.clock.now()).await?
        {
            info!(endpoint_id = %id, tenant_id = %tenant_id, "secret rotation completed");
            return Ok(endpoint);
        }

        // Distinguish a missing endpoint from one with nothing to promote.
        self.get_endpoint(tenant_id, id).await?;
        Err(DeliveryError::invalid_endpoint("no secret rotation in progress"))
    }
}

fn endpoint_not_found(id: EndpointId) -> DeliveryError {
    DeliveryError::not_found(format!("endpoint {id}"))
}

fn validate_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| DeliveryError::invalid_endpoint(format!("malformed url: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DeliveryError::invalid_endpoint(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(DeliveryError::invalid_endpoint("url has no host"));
    }

    Ok(trimmed.to_string())
}

fn normalize_events<I, S>(events: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let unique: BTreeSet<String> = events
        .into_iter()
        .map(|event| event.as_ref().trim().to_string())
        .filter(|event| !event.is_empty())
        .collect();

    if unique.is_empty() {
        return Err(DeliveryError::invalid_endpoint("at least one event type is required"));
    }
    Ok(unique.into_iter().collect())
}

fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}
