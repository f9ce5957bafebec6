//! Repository for delivery queue operations.
//!
//! The delivery table is the only state shared between concurrent
//! dispatchers. Every state change is a single conditional statement so
//! correctness does not depend on in-process locking:
//!
//! - creation relies on `UNIQUE (endpoint_id, event_id)`;
//! - claiming uses `FOR UPDATE SKIP LOCKED` plus a `status = 'pending'` guard;
//! - completion is fenced by `status = 'processing'` and the claim token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Delivery, DeliveryId, DeliveryQuery, DeliveryStatus, NewDelivery, TenantId},
};

/// Repository for delivery queue operations.
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

    /// Inserts a pending delivery.
    ///
    /// Returns `None` when a delivery for the same endpoint and event already
    /// exists, which makes re-dispatching an event a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails for any other reason.
    pub async fn create(
        &self,
        delivery: &NewDelivery,
        now: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let created = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO webhook_deliveries (
                id, tenant_id, endpoint_id, event_id, event_type, status,
                attempt_count, max_attempts, payload_snapshot, next_attempt_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $7, $8, $9, $9)
            ON CONFLICT (endpoint_id, event_id) DO NOTHING
            RETURNING id, tenant_id, endpoint_id, event_id, event_type, status,
                      attempt_count, max_attempts, payload_snapshot, next_attempt_at,
                      claimed_at, claim_token, last_response_code, last_error,
                      created_at, updated_at, completed_at
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.tenant_id)
        .bind(delivery.endpoint_id)
        .bind(delivery.event_id)
        .bind(&delivery.event_type)
        .bind(delivery.max_attempts)
        .bind(&delivery.payload_snapshot)
        .bind(delivery.next_attempt_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(created)
    }

    /// Claims up to `limit` due deliveries, oldest-due first.
    ///
    /// Selection and the `pending -> processing` transition happen in one
    /// statement. Rows locked by a concurrent claimer are skipped, and the
    /// outer `status = 'pending'` guard drops any row that changed state
    /// between selection and update. Every claimed row carries
    /// `claim_token`, which the completing write must present.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_token: Uuid,
    ) -> Result<Vec<Delivery>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut claimed = sqlx::query_as::<_, Delivery>(
            r#"
            WITH due AS (
                SELECT id FROM webhook_deliveries
                WHERE status = 'pending'
                  AND next_attempt_at <= $1
                ORDER BY next_attempt_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_deliveries d
            SET status = 'processing', claimed_at = $1, claim_token = $3, updated_at = $1
            FROM due
            WHERE d.id = due.id AND d.status = 'pending'
            RETURNING d.id, d.tenant_id, d.endpoint_id, d.event_id, d.event_type, d.status,
                      d.attempt_count, d.max_attempts, d.payload_snapshot, d.next_attempt_at,
                      d.claimed_at, d.claim_token, d.last_response_code, d.last_error,
                      d.created_at, d.updated_at, d.completed_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(claim_token)
        .fetch_all(&*self.pool)
        .await?;

        // RETURNING order is unspecified.
        claimed.sort_by_key(|d| d.next_attempt_at);

        Ok(claimed)
    }

    /// Persists the outcome of one attempt.
    ///
    /// The write applies only while the row is still `processing` under
    /// `claim_token`. Returns `false` when the claim was lost, for example to
    /// the stale sweep, in which case nothing is written.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails or violates a constraint.
    pub async fn complete(&self, delivery: &Delivery, claim_token: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = $3,
                attempt_count = $4,
                next_attempt_at = $5,
                last_response_code = $6,
                last_error = $7,
                completed_at = $8,
                updated_at = $9,
                claimed_at = NULL,
                claim_token = NULL
            WHERE id = $1
              AND status = 'processing'
              AND claim_token = $2
            "#,
        )
        .bind(delivery.id)
        .bind(claim_token)
        .bind(delivery.status)
        .bind(delivery.attempt_count)
        .bind(delivery.next_attempt_at)
        .bind(delivery.last_response_code)
        .bind(&delivery.last_error)
        .bind(delivery.completed_at)
        .bind(delivery.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Returns deliveries stuck in `processing` since before `cutoff` to
    /// `pending`, due immediately.
    ///
    /// `attempt_count` is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending',
                next_attempt_at = $2,
                updated_at = $2,
                claimed_at = NULL,
                claim_token = NULL
            WHERE status = 'processing'
              AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            SELECT id, tenant_id, endpoint_id, event_id, event_type, status,
                   attempt_count, max_attempts, payload_snapshot, next_attempt_at,
                   claimed_at, claim_token, last_response_code, last_error,
                   created_at, updated_at, completed_at
            FROM webhook_deliveries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Lists deliveries matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, query: &DeliveryQuery) -> Result<Vec<Delivery>> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            r#"
            SELECT id, tenant_id, endpoint_id, event_id, event_type, status,
                   attempt_count, max_attempts, payload_snapshot, next_attempt_at,
                   claimed_at, claim_token, last_response_code, last_error,
                   created_at, updated_at, completed_at
            FROM webhook_deliveries
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR endpoint_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(query.tenant_id)
        .bind(query.endpoint_id)
        .bind(query.status)
        .bind(query.limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Counts a tenant's deliveries per status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<(DeliveryStatus, i64)>> {
        let counts = sqlx::query_as::<_, (DeliveryStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM webhook_deliveries
            WHERE tenant_id = $1
            GROUP BY status
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(counts)
    }
}
