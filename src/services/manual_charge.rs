use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::{AppError, AppResult},
    models::{
        AttemptStatus, AutopayStatus, Initiator, Lease, LeaseStatus, NewPaymentAttempt,
        PaymentAttempt, Property,
    },
    services::{
        autopay_runner::{charge_amount_is_valid, submit_charge, ChargeTarget},
        calendar,
        idempotency::{idempotency_key, is_valid_period, AttemptKind},
        notifications::AuditEntry,
    },
    state::BillingContext,
};

/// Manual charges always use attempt 1 in their own namespace.
const MANUAL_ATTEMPT_NO: i32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct ChargeOutcome {
    pub payment_attempt_id: String,
    pub payment_intent_id: Option<String>,
    pub status: AttemptStatus,
}

impl From<&PaymentAttempt> for ChargeOutcome {
    fn from(attempt: &PaymentAttempt) -> Self {
        Self {
            payment_attempt_id: attempt.id.clone(),
            payment_intent_id: attempt.payment_intent_id.clone(),
            status: attempt.status,
        }
    }
}

async fn load_lease(ctx: &BillingContext, lease_id: &str) -> AppResult<(Lease, Property)> {
    let lease_id = lease_id.trim();
    if lease_id.is_empty() {
        return Err(AppError::InvalidArgument("lease_id is required.".to_string()));
    }
    let lease = ctx
        .leases
        .get_lease(lease_id)
        .await?
        .ok_or_else(|| AppError::NotFound("leases record not found.".to_string()))?;
    let property = ctx
        .leases
        .get_property(&lease.property_id)
        .await?
        .ok_or_else(|| AppError::NotFound("properties record not found.".to_string()))?;
    Ok((lease, property))
}

/// Loads the lease and checks the caller may act on it, before anything is written.
async fn authorized_lease(
    ctx: &BillingContext,
    user_id: &str,
    lease_id: &str,
) -> AppResult<(Lease, Property)> {
    let (lease, property) = load_lease(ctx, lease_id).await?;
    ctx.roles
        .assert_billing_admin(user_id, &property.organization_id)
        .await?;
    Ok((lease, property))
}

async fn charge_target(
    ctx: &BillingContext,
    lease: Lease,
    property: &Property,
) -> AppResult<ChargeTarget> {
    let precondition = |reason: &str| AppError::PreconditionFailed(reason.to_string());

    if lease.lease_status != LeaseStatus::Active {
        return Err(precondition("Lease is not active."));
    }
    let tenant_id = lease
        .tenant_id
        .clone()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| precondition("Lease has no tenant assigned."))?;

    let connected_account = ctx
        .leases
        .get_client(&property.organization_id)
        .await?
        .and_then(|client| client.connected_account().map(ToOwned::to_owned))
        .ok_or_else(|| {
            precondition("The organization has no active connected payment account.")
        })?;

    let profile = ctx
        .profiles
        .get_profile(&tenant_id, &property.organization_id)
        .await?;
    let (customer_id, payment_method_id) = profile
        .as_ref()
        .and_then(|profile| profile.chargeable_method())
        .map(|(customer, method)| (customer.to_string(), method.to_string()))
        .ok_or_else(|| precondition("Tenant has no active saved payment method."))?;

    let currency = charge_amount_is_valid(&lease)
        .ok_or_else(|| precondition("Lease amount or currency cannot be charged."))?;

    Ok(ChargeTarget {
        lease,
        organization_id: property.organization_id.clone(),
        connected_account,
        customer_id,
        payment_method_id,
        currency,
    })
}

/// Charge a lease for the current period on behalf of an admin.
///
/// Repeating the command reuses the same manual attempt row and idempotency
/// key, so the processor collapses retries into a single charge. A row that
/// already settled is returned as-is without calling the processor. Any other
/// attempt in the period that is in flight or settled refuses the command.
pub async fn charge_lease_now(
    ctx: &BillingContext,
    user_id: &str,
    lease_id: &str,
    now: DateTime<Utc>,
) -> AppResult<ChargeOutcome> {
    let (lease, property) = authorized_lease(ctx, user_id, lease_id).await?;
    let tz = calendar::resolve_timezone(property.timezone.as_deref(), ctx.settings.default_timezone)?;
    let period = calendar::period_of(now, tz);
    let target = charge_target(ctx, lease, &property).await?;

    let blocking = ctx
        .ledger
        .list_attempts(&target.lease.id, Some(&period))
        .await?
        .into_iter()
        .find(|row| {
            !is_manual_row(row)
                && matches!(
                    row.status,
                    AttemptStatus::Processing | AttemptStatus::Succeeded
                )
        });
    if let Some(row) = blocking {
        tracing::info!(
            lease_id = %row.lease_id,
            payment_attempt_id = %row.id,
            status = row.status.as_str(),
            "Manual charge refused; period already has a live attempt"
        );
        return Err(AppError::PreconditionFailed(
            "A charge for this period is already in flight or settled.".to_string(),
        ));
    }

    let key = idempotency_key(
        &target.lease.id,
        &period,
        AttemptKind::Manual,
        i64::from(MANUAL_ATTEMPT_NO),
    )?;

    let existing = ctx
        .ledger
        .find_attempt(&target.lease.id, &period, Initiator::Admin, MANUAL_ATTEMPT_NO)
        .await?;
    let attempt = match existing {
        Some(row) => row,
        None => {
            let inserted = ctx
                .ledger
                .insert_attempt(&NewPaymentAttempt {
                    lease_id: target.lease.id.clone(),
                    property_id: property.id.clone(),
                    organization_id: property.organization_id.clone(),
                    period: period.clone(),
                    attempt_no: MANUAL_ATTEMPT_NO,
                    initiator: Initiator::Admin,
                    amount_minor: target.lease.amount_minor,
                    currency: target.currency,
                    stripe_account_id: target.connected_account.clone(),
                    idempotency_key: key,
                })
                .await;
            match inserted {
                Ok(row) => row,
                // A concurrent command created it first.
                Err(AppError::Conflict(_)) => ctx
                    .ledger
                    .find_attempt(&target.lease.id, &period, Initiator::Admin, MANUAL_ATTEMPT_NO)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal("Manual attempt vanished after conflict.".to_string())
                    })?,
                Err(error) => return Err(error),
            }
        }
    };

    if attempt.status.is_terminal() {
        tracing::info!(
            lease_id = %attempt.lease_id,
            payment_attempt_id = %attempt.id,
            status = attempt.status.as_str(),
            "Manual charge already settled for this period"
        );
        return Ok(ChargeOutcome::from(&attempt));
    }

    let submission = submit_charge(ctx, &attempt, &target, Some(user_id)).await?;
    Ok(ChargeOutcome::from(&submission.attempt))
}

fn is_manual_row(row: &PaymentAttempt) -> bool {
    row.initiator == Initiator::Admin && row.attempt_no == MANUAL_ATTEMPT_NO
}

/// Turn autopay on or off for a lease. Enabling lands in `pending_method`
/// until the tenant has a chargeable saved method.
pub async fn set_autopay(
    ctx: &BillingContext,
    user_id: &str,
    lease_id: &str,
    enabled: bool,
) -> AppResult<Lease> {
    let (lease, property) = authorized_lease(ctx, user_id, lease_id).await?;

    let status = if enabled {
        if lease.lease_status != LeaseStatus::Active {
            return Err(AppError::PreconditionFailed(
                "Autopay can only be enabled on an active lease.".to_string(),
            ));
        }
        let chargeable = match lease.tenant_id.as_deref() {
            Some(tenant_id) => ctx
                .profiles
                .get_profile(tenant_id, &property.organization_id)
                .await?
                .is_some_and(|profile| profile.chargeable_method().is_some()),
            None => false,
        };
        if chargeable {
            AutopayStatus::Active
        } else {
            AutopayStatus::PendingMethod
        }
    } else {
        AutopayStatus::Paused
    };

    let updated = ctx
        .leases
        .set_autopay_enabled(&lease.id, enabled, status)
        .await?;
    ctx.events
        .audit(
            AuditEntry::new(
                if enabled {
                    "autopay.enabled"
                } else {
                    "autopay.disabled"
                },
                "leases",
                &lease.id,
            )
            .organization(&property.organization_id)
            .actor(Some(user_id))
            .after(serde_json::json!({
                "autopay_enabled": updated.autopay_enabled,
                "autopay_status": updated.autopay_status.as_str(),
            })),
        )
        .await;
    Ok(updated)
}

pub async fn list_attempts(
    ctx: &BillingContext,
    user_id: &str,
    lease_id: &str,
    period: Option<&str>,
) -> AppResult<Vec<PaymentAttempt>> {
    let period = period.map(str::trim).filter(|value| !value.is_empty());
    if let Some(period) = period {
        if !is_valid_period(period) {
            return Err(AppError::InvalidArgument(format!(
                "period '{period}' must be exactly six digits (YYYYMM)."
            )));
        }
    }
    let (lease, _) = authorized_lease(ctx, user_id, lease_id).await?;
    ctx.ledger.list_attempts(&lease.id, period).await
}
