use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{
        AttemptStatus, AttemptUpdate, AutopayStatus, ClientAccount, ClientStatus, Initiator,
        Lease, LeaseStatus, NewPaymentAttempt, PaymentAttempt, Property, ProfileStatus,
        TenantPaymentProfile, WebhookEventRecord, WebhookEventStatus, WeekendRule,
    },
    repository::{GuardedWrite, LeaseStore, LedgerStore, PaymentProfileStore},
};

#[derive(Default)]
struct Tables {
    leases: HashMap<String, Lease>,
    properties: HashMap<String, Property>,
    clients: HashMap<String, ClientAccount>,
    members: HashMap<(String, String), String>,
    platform_admins: Vec<String>,
    attempts: Vec<PaymentAttempt>,
    events: HashMap<String, WebhookEventRecord>,
    profiles: HashMap<(String, String), TenantPaymentProfile>,
}

/// Single-lock store with the same single-row atomicity the Postgres store offers.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap()
    }

    pub fn put_lease(&self, lease: Lease) {
        self.lock().leases.insert(lease.id.clone(), lease);
    }

    pub fn put_property(&self, property: Property) {
        self.lock().properties.insert(property.id.clone(), property);
    }

    pub fn put_client(&self, client: ClientAccount) {
        self.lock().clients.insert(client.id.clone(), client);
    }

    pub fn put_member(&self, organization_id: &str, user_id: &str, role: &str) {
        self.lock().members.insert(
            (organization_id.to_string(), user_id.to_string()),
            role.to_string(),
        );
    }

    pub fn put_platform_admin(&self, user_id: &str) {
        self.lock().platform_admins.push(user_id.to_string());
    }

    pub fn put_profile(&self, profile: TenantPaymentProfile) {
        self.lock().profiles.insert(
            (profile.tenant_id.clone(), profile.organization_id.clone()),
            profile,
        );
    }

    pub fn lease(&self, lease_id: &str) -> Lease {
        self.lock().leases[lease_id].clone()
    }

    pub fn attempts(&self) -> Vec<PaymentAttempt> {
        self.lock().attempts.clone()
    }

    pub fn event(&self, event_id: &str) -> Option<WebhookEventRecord> {
        self.lock().events.get(event_id).cloned()
    }

    pub fn profile(&self, tenant_id: &str, organization_id: &str) -> Option<TenantPaymentProfile> {
        self.lock()
            .profiles
            .get(&(tenant_id.to_string(), organization_id.to_string()))
            .cloned()
    }

    /// Forces a ledger row into `status`, bypassing the transition guard.
    pub fn force_attempt_status(&self, attempt_id: &str, status: AttemptStatus) {
        let mut tables = self.lock();
        if let Some(row) = tables.attempts.iter_mut().find(|row| row.id == attempt_id) {
            row.status = status;
        }
    }

    /// One organization `org-1` on `acct_1`, property `prop-1` in UTC, tenant
    /// `tenant-1` with an active card, and an autopay lease `lease-1` due on
    /// the 15th.
    pub fn seeded() -> Self {
        let store = Self::new();
        store.put_client(ClientAccount {
            id: "org-1".to_string(),
            stripe_account_id: Some("acct_1".to_string()),
            status: ClientStatus::Active,
        });
        store.put_property(Property {
            id: "prop-1".to_string(),
            organization_id: "org-1".to_string(),
            timezone: Some("UTC".to_string()),
        });
        store.put_profile(active_profile("tenant-1", "org-1"));
        store.put_lease(sample_lease("lease-1"));
        store
    }
}

pub fn sample_lease(id: &str) -> Lease {
    Lease {
        id: id.to_string(),
        property_id: "prop-1".to_string(),
        tenant_id: Some("tenant-1".to_string()),
        amount_minor: 150_000,
        currency: "usd".to_string(),
        billing_day: 15,
        weekend_rule: WeekendRule::ShiftToNextBusinessDay,
        autopay_enabled: true,
        autopay_status: AutopayStatus::Active,
        lease_status: LeaseStatus::Active,
    }
}

pub fn active_profile(tenant_id: &str, organization_id: &str) -> TenantPaymentProfile {
    TenantPaymentProfile {
        tenant_id: tenant_id.to_string(),
        organization_id: organization_id.to_string(),
        stripe_customer_id: Some("cus_1".to_string()),
        default_payment_method_id: Some("pm_1".to_string()),
        method_summary: None,
        status: ProfileStatus::Active,
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn list_autopay_leases(&self, after: Option<&str>, limit: i64) -> AppResult<Vec<Lease>> {
        let tables = self.lock();
        let mut leases: Vec<Lease> = tables
            .leases
            .values()
            .filter(|lease| lease.autopay_enabled && lease.lease_status == LeaseStatus::Active)
            .filter(|lease| after.map_or(true, |cursor| lease.id.as_str() > cursor))
            .cloned()
            .collect();
        leases.sort_by(|left, right| left.id.cmp(&right.id));
        leases.truncate(limit.max(1) as usize);
        Ok(leases)
    }

    async fn get_lease(&self, lease_id: &str) -> AppResult<Option<Lease>> {
        Ok(self.lock().leases.get(lease_id).cloned())
    }

    async fn get_property(&self, property_id: &str) -> AppResult<Option<Property>> {
        Ok(self.lock().properties.get(property_id).cloned())
    }

    async fn get_client(&self, organization_id: &str) -> AppResult<Option<ClientAccount>> {
        Ok(self.lock().clients.get(organization_id).cloned())
    }

    async fn find_client_by_account(
        &self,
        stripe_account_id: &str,
    ) -> AppResult<Option<ClientAccount>> {
        Ok(self
            .lock()
            .clients
            .values()
            .find(|client| client.stripe_account_id.as_deref() == Some(stripe_account_id))
            .cloned())
    }

    async fn set_autopay_status(&self, lease_id: &str, status: AutopayStatus) -> AppResult<()> {
        if let Some(lease) = self.lock().leases.get_mut(lease_id) {
            lease.autopay_status = status;
        }
        Ok(())
    }

    async fn set_autopay_enabled(
        &self,
        lease_id: &str,
        enabled: bool,
        status: AutopayStatus,
    ) -> AppResult<Lease> {
        let mut tables = self.lock();
        let lease = tables
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| AppError::NotFound("leases record not found.".to_string()))?;
        lease.autopay_enabled = enabled;
        lease.autopay_status = status;
        Ok(lease.clone())
    }

    async fn reactivate_pending_leases(
        &self,
        tenant_id: &str,
        organization_id: &str,
    ) -> AppResult<u64> {
        let mut tables = self.lock();
        let properties: Vec<String> = tables
            .properties
            .values()
            .filter(|property| property.organization_id == organization_id)
            .map(|property| property.id.clone())
            .collect();
        let mut changed = 0;
        for lease in tables.leases.values_mut() {
            if lease.tenant_id.as_deref() == Some(tenant_id)
                && properties.contains(&lease.property_id)
                && lease.autopay_enabled
                && lease.autopay_status == AutopayStatus::PendingMethod
            {
                lease.autopay_status = AutopayStatus::Active;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn member_role(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> AppResult<Option<String>> {
        Ok(self
            .lock()
            .members
            .get(&(organization_id.to_string(), user_id.to_string()))
            .cloned())
    }

    async fn is_platform_admin(&self, user_id: &str) -> AppResult<bool> {
        Ok(self.lock().platform_admins.iter().any(|id| id == user_id))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn list_attempts(
        &self,
        lease_id: &str,
        period: Option<&str>,
    ) -> AppResult<Vec<PaymentAttempt>> {
        Ok(self
            .lock()
            .attempts
            .iter()
            .filter(|row| row.lease_id == lease_id)
            .filter(|row| period.map_or(true, |period| row.period == period))
            .cloned()
            .collect())
    }

    async fn find_attempt(
        &self,
        lease_id: &str,
        period: &str,
        initiator: Initiator,
        attempt_no: i32,
    ) -> AppResult<Option<PaymentAttempt>> {
        Ok(self
            .lock()
            .attempts
            .iter()
            .find(|row| {
                row.lease_id == lease_id
                    && row.period == period
                    && row.initiator == initiator
                    && row.attempt_no == attempt_no
            })
            .cloned())
    }

    async fn get_attempt(&self, attempt_id: &str) -> AppResult<Option<PaymentAttempt>> {
        Ok(self
            .lock()
            .attempts
            .iter()
            .find(|row| row.id == attempt_id)
            .cloned())
    }

    async fn find_attempt_by_intent(
        &self,
        payment_intent_id: &str,
    ) -> AppResult<Option<PaymentAttempt>> {
        Ok(self
            .lock()
            .attempts
            .iter()
            .find(|row| row.payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn insert_attempt(&self, attempt: &NewPaymentAttempt) -> AppResult<PaymentAttempt> {
        let mut tables = self.lock();
        let duplicate = tables.attempts.iter().any(|row| {
            row.lease_id == attempt.lease_id
                && row.period == attempt.period
                && row.initiator == attempt.initiator
                && row.attempt_no == attempt.attempt_no
        });
        if duplicate {
            return Err(AppError::Conflict(
                "Duplicate value violates a unique constraint.".to_string(),
            ));
        }
        let now = Utc::now();
        let row = PaymentAttempt {
            id: Uuid::new_v4().to_string(),
            lease_id: attempt.lease_id.clone(),
            property_id: attempt.property_id.clone(),
            organization_id: attempt.organization_id.clone(),
            period: attempt.period.clone(),
            attempt_no: attempt.attempt_no,
            initiator: attempt.initiator,
            amount_minor: attempt.amount_minor,
            currency: attempt.currency.as_str().to_string(),
            stripe_account_id: attempt.stripe_account_id.clone(),
            idempotency_key: attempt.idempotency_key.clone(),
            payment_intent_id: None,
            charge_id: None,
            status: AttemptStatus::Processing,
            failure_code: None,
            failure_message: None,
            last_event_id: None,
            created_at: now,
            updated_at: now,
        };
        tables.attempts.push(row.clone());
        Ok(row)
    }

    async fn transition_attempt(
        &self,
        attempt_id: &str,
        status: AttemptStatus,
        allowed_from: &[AttemptStatus],
        update: &AttemptUpdate,
    ) -> AppResult<Option<GuardedWrite>> {
        let mut tables = self.lock();
        let Some(row) = tables.attempts.iter_mut().find(|row| row.id == attempt_id) else {
            return Ok(None);
        };
        if !allowed_from.contains(&row.status) {
            return Ok(None);
        }
        let previous_status = row.status;
        row.status = status;
        if let Some(value) = &update.payment_intent_id {
            row.payment_intent_id = Some(value.clone());
        }
        if let Some(value) = &update.charge_id {
            row.charge_id = Some(value.clone());
        }
        if update.clear_failure {
            row.failure_code = None;
            row.failure_message = None;
        } else {
            if let Some(value) = &update.failure_code {
                row.failure_code = Some(value.clone());
            }
            if let Some(value) = &update.failure_message {
                row.failure_message = Some(value.clone());
            }
        }
        if let Some(value) = &update.last_event_id {
            row.last_event_id = Some(value.clone());
        }
        row.updated_at = Utc::now();
        Ok(Some(GuardedWrite {
            attempt: row.clone(),
            previous_status,
        }))
    }

    async fn record_event_receipt(
        &self,
        event_id: &str,
        event_type: &str,
        stripe_account_id: Option<&str>,
        payload: &Value,
    ) -> AppResult<WebhookEventRecord> {
        let mut tables = self.lock();
        let record = tables
            .events
            .entry(event_id.to_string())
            .and_modify(|existing| {
                if existing.status != WebhookEventStatus::Processed {
                    existing.attempt_count += 1;
                    existing.status = WebhookEventStatus::Received;
                }
            })
            .or_insert_with(|| WebhookEventRecord {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                stripe_account_id: stripe_account_id.map(ToOwned::to_owned),
                status: WebhookEventStatus::Received,
                attempt_count: 1,
                payload: payload.clone(),
                error_message: None,
            });
        Ok(record.clone())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        error_message: Option<&str>,
    ) -> AppResult<()> {
        if let Some(record) = self.lock().events.get_mut(event_id) {
            record.status = status;
            record.error_message = error_message.map(ToOwned::to_owned);
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProfileStore for MemoryStore {
    async fn get_profile(
        &self,
        tenant_id: &str,
        organization_id: &str,
    ) -> AppResult<Option<TenantPaymentProfile>> {
        Ok(self.profile(tenant_id, organization_id))
    }

    async fn find_profile_by_customer(
        &self,
        organization_id: &str,
        stripe_customer_id: &str,
    ) -> AppResult<Option<TenantPaymentProfile>> {
        Ok(self
            .lock()
            .profiles
            .values()
            .find(|profile| {
                profile.organization_id == organization_id
                    && profile.stripe_customer_id.as_deref() == Some(stripe_customer_id)
            })
            .cloned())
    }

    async fn upsert_profile(
        &self,
        profile: &TenantPaymentProfile,
    ) -> AppResult<TenantPaymentProfile> {
        let mut tables = self.lock();
        let key = (profile.tenant_id.clone(), profile.organization_id.clone());
        let mut stored = profile.clone();
        if stored.stripe_customer_id.is_none() {
            stored.stripe_customer_id = tables
                .profiles
                .get(&key)
                .and_then(|existing| existing.stripe_customer_id.clone());
        }
        tables.profiles.insert(key, stored.clone());
        Ok(stored)
    }
}
