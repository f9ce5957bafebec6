//! Repository for endpoint database operations.
//!
//! Endpoints are tenant-owned delivery targets. Every read and mutation is
//! scoped by tenant; rows are soft-disabled and never deleted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Endpoint, EndpointId, SigningSecret, TenantId},
};

/// Repository for endpoint database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_endpoints (
                id, tenant_id, url, secret, pending_secret, enabled,
                subscribed_events, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(endpoint.id)
        .bind(endpoint.tenant_id)
        .bind(&endpoint.url)
        .bind(&endpoint.secret)
        .bind(&endpoint.pending_secret)
        .bind(endpoint.enabled)
        .bind(&endpoint.subscribed_events)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an endpoint by ID regardless of tenant.
    ///
    /// Used by the dispatcher, which only holds delivery rows.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            SELECT id, tenant_id, url, secret, pending_secret, enabled,
                   subscribed_events, created_at, updated_at
            FROM webhook_endpoints
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Lists all endpoints of a tenant, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_tenant(&self, tenant_id: TenantId) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(
            r#"
            SELECT id, tenant_id, url, secret, pending_secret, enabled,
                   subscribed_events, created_at, updated_at
            FROM webhook_endpoints
            WHERE tenant_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Finds enabled endpoints of a tenant subscribed to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_matching(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(
            r#"
            SELECT id, tenant_id, url, secret, pending_secret, enabled,
                   subscribed_events, created_at, updated_at
            FROM webhook_endpoints
            WHERE tenant_id = $1
              AND enabled = TRUE
              AND $2 = ANY(subscribed_events)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Enables or disables an endpoint.
    ///
    /// Returns `None` if the endpoint does not exist for this tenant.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn set_enabled(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE webhook_endpoints
            SET enabled = $3, updated_at = $4
            WHERE id = $1 AND tenant_id = $2
            RETURNING id, tenant_id, url, secret, pending_secret, enabled,
                      subscribed_events, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(enabled)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Stores the next secret of a rotation window.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn set_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        pending_secret: &SigningSecret,
        now: DateTime<Utc>,
    ) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE webhook_endpoints
            SET pending_secret = $3, updated_at = $4
            WHERE id = $1 AND tenant_id = $2
            RETURNING id, tenant_id, url, secret, pending_secret, enabled,
                      subscribed_events, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(pending_secret)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Replaces the current secret with the pending one.
    ///
    /// Returns `None` if the endpoint does not exist or has no pending
    /// secret.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn promote_pending_secret(
        &self,
        tenant_id: TenantId,
        id: EndpointId,
        now: DateTime<Utc>,
    ) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r#"
            UPDATE webhook_endpoints
            SET secret = pending_secret, pending_secret = NULL, updated_at = $3
            WHERE id = $1 AND tenant_id = $2 AND pending_secret IS NOT NULL
            RETURNING id, tenant_id, url, secret, pending_secret, enabled,
                      subscribed_events, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }
}
