use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    error::{map_db_error, AppError, AppResult},
    models::{
        AttemptStatus, AttemptUpdate, AutopayStatus, ClientAccount, Initiator, Lease,
        NewPaymentAttempt, PaymentAttempt, Property, TenantPaymentProfile, WebhookEventRecord,
        WebhookEventStatus,
    },
    repository::{GuardedWrite, LeaseStore, LedgerStore, PaymentProfileStore},
};

/// Postgres-backed stores. Every read selects `row_to_json(t) AS row` and is
/// decoded with serde, the same way the generic table service reads rows.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_row<T: DeserializeOwned>(row: PgRow) -> AppResult<T> {
    let value = row
        .try_get::<Option<Value>, _>("row")
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::Internal("Query returned an empty row.".to_string()))?;
    serde_json::from_value(value).map_err(|error| {
        tracing::error!(error = %error, "Could not decode database row");
        AppError::Internal("Stored record has an unexpected shape.".to_string())
    })
}

fn decode_optional<T: DeserializeOwned>(row: Option<PgRow>) -> AppResult<Option<T>> {
    row.map(decode_row).transpose()
}

fn decode_all<T: DeserializeOwned>(rows: Vec<PgRow>) -> AppResult<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

fn status_list(statuses: &[AttemptStatus]) -> Vec<String> {
    statuses
        .iter()
        .map(|status| status.as_str().to_string())
        .collect()
}

#[async_trait]
impl LeaseStore for PgStore {
    async fn list_autopay_leases(&self, after: Option<&str>, limit: i64) -> AppResult<Vec<Lease>> {
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM leases t
             WHERE t.autopay_enabled = true
               AND t.lease_status = 'active'
               AND ($2::uuid IS NULL OR t.id > $2::uuid)
             ORDER BY t.id
             LIMIT $1",
        )
        .bind(limit.max(1))
        .bind(after)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_all(rows)
    }

    async fn get_lease(&self, lease_id: &str) -> AppResult<Option<Lease>> {
        let row = sqlx::query("SELECT row_to_json(t) AS row FROM leases t WHERE t.id = $1::uuid")
            .bind(lease_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn get_property(&self, property_id: &str) -> AppResult<Option<Property>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM (SELECT id, organization_id, timezone FROM properties WHERE id = $1::uuid) t",
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn get_client(&self, organization_id: &str) -> AppResult<Option<ClientAccount>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM (SELECT id, stripe_account_id, status FROM organizations WHERE id = $1::uuid) t",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn find_client_by_account(
        &self,
        stripe_account_id: &str,
    ) -> AppResult<Option<ClientAccount>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM (
               SELECT id, stripe_account_id, status
               FROM organizations
               WHERE stripe_account_id = $1
               ORDER BY created_at
               LIMIT 1
             ) t",
        )
        .bind(stripe_account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn set_autopay_status(&self, lease_id: &str, status: AutopayStatus) -> AppResult<()> {
        sqlx::query(
            "UPDATE leases
             SET autopay_status = $2, updated_at = now()
             WHERE id = $1::uuid AND autopay_status IS DISTINCT FROM $2",
        )
        .bind(lease_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    async fn set_autopay_enabled(
        &self,
        lease_id: &str,
        enabled: bool,
        status: AutopayStatus,
    ) -> AppResult<Lease> {
        let row = sqlx::query(
            "UPDATE leases t
             SET autopay_enabled = $2, autopay_status = $3, updated_at = now()
             WHERE t.id = $1::uuid
             RETURNING row_to_json(t) AS row",
        )
        .bind(lease_id)
        .bind(enabled)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)?
            .ok_or_else(|| AppError::NotFound("leases record not found.".to_string()))
    }

    async fn reactivate_pending_leases(
        &self,
        tenant_id: &str,
        organization_id: &str,
    ) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE leases l
             SET autopay_status = 'active', updated_at = now()
             FROM properties p
             WHERE l.property_id = p.id
               AND p.organization_id = $2::uuid
               AND l.tenant_id = $1::uuid
               AND l.autopay_enabled = true
               AND l.autopay_status = 'pending_method'",
        )
        .bind(tenant_id)
        .bind(organization_id)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    async fn member_role(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> AppResult<Option<String>> {
        let row = sqlx::query(
            "SELECT role
             FROM organization_members
             WHERE organization_id = $1::uuid AND user_id = $2::uuid
             LIMIT 1",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.and_then(|row| row.try_get::<Option<String>, _>("role").ok().flatten()))
    }

    async fn is_platform_admin(&self, user_id: &str) -> AppResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM platform_admins WHERE user_id = $1::uuid) AS is_admin",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(row.try_get::<bool, _>("is_admin").unwrap_or(false))
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn list_attempts(
        &self,
        lease_id: &str,
        period: Option<&str>,
    ) -> AppResult<Vec<PaymentAttempt>> {
        let rows = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM payment_attempts t
             WHERE t.lease_id = $1::uuid
               AND ($2::text IS NULL OR t.period = $2)
             ORDER BY t.period DESC, t.created_at DESC",
        )
        .bind(lease_id)
        .bind(period)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_all(rows)
    }

    async fn find_attempt(
        &self,
        lease_id: &str,
        period: &str,
        initiator: Initiator,
        attempt_no: i32,
    ) -> AppResult<Option<PaymentAttempt>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM payment_attempts t
             WHERE t.lease_id = $1::uuid
               AND t.period = $2
               AND t.initiator = $3
               AND t.attempt_no = $4",
        )
        .bind(lease_id)
        .bind(period)
        .bind(initiator.as_str())
        .bind(attempt_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn get_attempt(&self, attempt_id: &str) -> AppResult<Option<PaymentAttempt>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row FROM payment_attempts t WHERE t.id = $1::uuid",
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn find_attempt_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> AppResult<Option<PaymentAttempt>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM payment_attempts t
             WHERE t.payment_intent_id = $1
             LIMIT 1",
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn insert_attempt(&self, attempt: &NewPaymentAttempt) -> AppResult<PaymentAttempt> {
        let row = sqlx::query(
            "INSERT INTO payment_attempts AS t (
               lease_id, property_id, organization_id, period, attempt_no, initiator,
               amount_minor, currency, stripe_account_id, idempotency_key, status
             )
             VALUES ($1::uuid, $2::uuid, $3::uuid, $4, $5, $6, $7, $8, $9, $10, 'processing')
             RETURNING row_to_json(t) AS row",
        )
        .bind(&attempt.lease_id)
        .bind(&attempt.property_id)
        .bind(&attempt.organization_id)
        .bind(&attempt.period)
        .bind(attempt.attempt_no)
        .bind(attempt.initiator.as_str())
        .bind(attempt.amount_minor)
        .bind(attempt.currency.as_str())
        .bind(&attempt.stripe_account_id)
        .bind(&attempt.idempotency_key)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_row(row)
    }

    async fn transition_attempt(
        &self,
        attempt_id: &str,
        status: AttemptStatus,
        allowed_from: &[AttemptStatus],
        update: &AttemptUpdate,
    ) -> AppResult<Option<GuardedWrite>> {
        let row = sqlx::query(
            "WITH previous AS (
               SELECT id, status FROM payment_attempts WHERE id = $1::uuid FOR UPDATE
             )
             UPDATE payment_attempts t
             SET status = $2,
                 payment_intent_id = COALESCE($4, t.payment_intent_id),
                 charge_id = COALESCE($5, t.charge_id),
                 failure_code = CASE WHEN $9 THEN NULL ELSE COALESCE($6, t.failure_code) END,
                 failure_message = CASE WHEN $9 THEN NULL ELSE COALESCE($7, t.failure_message) END,
                 last_event_id = COALESCE($8, t.last_event_id),
                 updated_at = now()
             FROM previous p
             WHERE t.id = p.id
               AND p.status = ANY($3::text[])
             RETURNING json_build_object(
               'attempt', row_to_json(t),
               'previous_status', p.status
             ) AS row",
        )
        .bind(attempt_id)
        .bind(status.as_str())
        .bind(status_list(allowed_from))
        .bind(update.payment_intent_id.as_deref())
        .bind(update.charge_id.as_deref())
        .bind(update.failure_code.as_deref())
        .bind(update.failure_message.as_deref())
        .bind(update.last_event_id.as_deref())
        .bind(update.clear_failure)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn record_event_receipt(
        &self,
        event_id: &str,
        event_type: &str,
        stripe_account_id: Option<&str>,
        payload: &Value,
    ) -> AppResult<WebhookEventRecord> {
        let row = sqlx::query(
            "INSERT INTO processor_webhook_events AS t (
               event_id, event_type, stripe_account_id, status, attempt_count, payload
             )
             VALUES ($1, $2, $3, 'received', 1, $4)
             ON CONFLICT (event_id) DO UPDATE
               SET attempt_count = t.attempt_count + 1,
                   status = 'received',
                   updated_at = now()
               WHERE t.status <> 'processed'
             RETURNING row_to_json(t) AS row",
        )
        .bind(event_id)
        .bind(event_type)
        .bind(stripe_account_id)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        if let Some(record) = decode_optional(row)? {
            return Ok(record);
        }

        // The conflict guard skipped the update: the event is already processed.
        let existing = sqlx::query(
            "SELECT row_to_json(t) AS row FROM processor_webhook_events t WHERE t.event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(existing)?.ok_or_else(|| {
            AppError::Internal(format!("Webhook event {event_id} vanished after upsert."))
        })
    }

    async fn finish_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        error_message: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE processor_webhook_events
             SET status = $2,
                 error_message = $3,
                 processed_at = CASE WHEN $2 = 'processed' THEN now() ELSE processed_at END,
                 updated_at = now()
             WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }
}

#[async_trait]
impl PaymentProfileStore for PgStore {
    async fn get_profile(
        &self,
        tenant_id: &str,
        organization_id: &str,
    ) -> AppResult<Option<TenantPaymentProfile>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM tenant_payment_profiles t
             WHERE t.tenant_id = $1::uuid AND t.organization_id = $2::uuid",
        )
        .bind(tenant_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn find_profile_by_customer(
        &self,
        organization_id: &str,
        stripe_customer_id: &str,
    ) -> AppResult<Option<TenantPaymentProfile>> {
        let row = sqlx::query(
            "SELECT row_to_json(t) AS row
             FROM tenant_payment_profiles t
             WHERE t.organization_id = $1::uuid AND t.stripe_customer_id = $2
             LIMIT 1",
        )
        .bind(organization_id)
        .bind(stripe_customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_optional(row)
    }

    async fn upsert_profile(
        &self,
        profile: &TenantPaymentProfile,
    ) -> AppResult<TenantPaymentProfile> {
        let summary = profile
            .method_summary
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|error| AppError::Internal(error.to_string()))?;

        let row = sqlx::query(
            "INSERT INTO tenant_payment_profiles AS t (
               tenant_id, organization_id, stripe_customer_id,
               default_payment_method_id, method_summary, status
             )
             VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6)
             ON CONFLICT (tenant_id, organization_id) DO UPDATE
               SET stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, t.stripe_customer_id),
                   default_payment_method_id = EXCLUDED.default_payment_method_id,
                   method_summary = EXCLUDED.method_summary,
                   status = EXCLUDED.status,
                   updated_at = now()
             RETURNING row_to_json(t) AS row",
        )
        .bind(&profile.tenant_id)
        .bind(&profile.organization_id)
        .bind(profile.stripe_customer_id.as_deref())
        .bind(profile.default_payment_method_id.as_deref())
        .bind(summary)
        .bind(profile.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;
        decode_row(row)
    }
}
