use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::AppResult,
    models::{
        AttemptStatus, AttemptUpdate, AutopayStatus, ClientAccount, Initiator, Lease,
        NewPaymentAttempt, PaymentAttempt, Property, TenantPaymentProfile, WebhookEventRecord,
        WebhookEventStatus,
    },
};

#[cfg(test)]
pub mod memory_store;
pub mod pg_store;

/// An accepted status write together with the status the row held before it.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardedWrite {
    pub attempt: PaymentAttempt,
    pub previous_status: AttemptStatus,
}

/// Leases, properties, clients and the membership data used for authorization.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// One page of leases with autopay enabled and an active lease status,
    /// ordered by id and starting strictly after `after`.
    async fn list_autopay_leases(&self, after: Option<&str>, limit: i64) -> AppResult<Vec<Lease>>;

    async fn get_lease(&self, lease_id: &str) -> AppResult<Option<Lease>>;

    async fn get_property(&self, property_id: &str) -> AppResult<Option<Property>>;

    async fn get_client(&self, organization_id: &str) -> AppResult<Option<ClientAccount>>;

    async fn find_client_by_account(
        &self,
        stripe_account_id: &str,
    ) -> AppResult<Option<ClientAccount>>;

    async fn set_autopay_status(&self, lease_id: &str, status: AutopayStatus) -> AppResult<()>;

    async fn set_autopay_enabled(
        &self,
        lease_id: &str,
        enabled: bool,
        status: AutopayStatus,
    ) -> AppResult<Lease>;

    /// Moves the tenant's `pending_method` leases under this client back to `active`.
    async fn reactivate_pending_leases(
        &self,
        tenant_id: &str,
        organization_id: &str,
    ) -> AppResult<u64>;

    async fn member_role(&self, organization_id: &str, user_id: &str)
        -> AppResult<Option<String>>;

    async fn is_platform_admin(&self, user_id: &str) -> AppResult<bool>;
}

/// Payment attempts plus the processor webhook receipts that touch them.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn list_attempts(
        &self,
        lease_id: &str,
        period: Option<&str>,
    ) -> AppResult<Vec<PaymentAttempt>>;

    async fn find_attempt(
        &self,
        lease_id: &str,
        period: &str,
        initiator: Initiator,
        attempt_no: i32,
    ) -> AppResult<Option<PaymentAttempt>>;

    async fn get_attempt(&self, attempt_id: &str) -> AppResult<Option<PaymentAttempt>>;

    async fn find_attempt_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> AppResult<Option<PaymentAttempt>>;

    /// Inserts a `processing` row. A duplicate (lease, period, initiator, attempt)
    /// fails with `AppError::Conflict`.
    async fn insert_attempt(&self, attempt: &NewPaymentAttempt) -> AppResult<PaymentAttempt>;

    /// Single-row compare-and-swap: writes `status` and the given fields only
    /// while the stored status is one of `allowed_from`. Returns `None` when the
    /// guard rejected the write.
    async fn transition_attempt(
        &self,
        attempt_id: &str,
        status: AttemptStatus,
        allowed_from: &[AttemptStatus],
        update: &AttemptUpdate,
    ) -> AppResult<Option<GuardedWrite>>;

    /// Records the first sight of an event, or bumps the attempt count of a
    /// redelivery that has not been processed yet. A processed event is
    /// returned unchanged.
    async fn record_event_receipt(
        &self,
        event_id: &str,
        event_type: &str,
        stripe_account_id: Option<&str>,
        payload: &Value,
    ) -> AppResult<WebhookEventRecord>;

    async fn finish_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        error_message: Option<&str>,
    ) -> AppResult<()>;
}

#[async_trait]
pub trait PaymentProfileStore: Send + Sync {
    async fn get_profile(
        &self,
        tenant_id: &str,
        organization_id: &str,
    ) -> AppResult<Option<TenantPaymentProfile>>;

    async fn find_profile_by_customer(
        &self,
        organization_id: &str,
        stripe_customer_id: &str,
    ) -> AppResult<Option<TenantPaymentProfile>>;

    async fn upsert_profile(
        &self,
        profile: &TenantPaymentProfile,
    ) -> AppResult<TenantPaymentProfile>;
}
