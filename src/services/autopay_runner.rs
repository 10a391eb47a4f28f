use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::{
    error::{AppError, AppResult},
    models::{
        AttemptStatus, AttemptUpdate, AutopayStatus, Currency, Initiator, Lease,
        NewPaymentAttempt, PaymentAttempt,
    },
    services::{
        calendar,
        gateway::{GatewayError, OffSessionChargeRequest, GATEWAY_ERROR},
        idempotency::{idempotency_key, AttemptKind},
        ledger::{self, apply_transition, sync_rollup},
        notifications::{self, AuditEntry},
    },
    state::BillingContext,
};

const AUTHENTICATION_REQUIRED: &str = "authentication_required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoTenant,
    ClientInactive,
    NotDueToday,
    PaymentMethodMissing,
    AlreadyInFlight,
    AttemptCapReached,
    InvalidLeaseData,
    ConcurrentRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaseFailure {
    pub lease_id: String,
    pub payment_attempt_id: Option<String>,
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub examined: usize,
    /// Leases evaluated without a failure (including skips).
    pub processed: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub failed: usize,
    pub failures: Vec<LeaseFailure>,
    pub failures_truncated: bool,
}

impl RunSummary {
    fn skip(&mut self, reason: SkipReason) {
        self.processed += 1;
        *self.skipped.entry(reason).or_insert(0) += 1;
    }

    fn fail(&mut self, failure: LeaseFailure, cap: usize) {
        self.failed += 1;
        if self.failures.len() < cap {
            self.failures.push(failure);
        } else {
            self.failures_truncated = true;
        }
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

/// Everything needed to put a charge on the wire for one lease.
#[derive(Debug, Clone)]
pub(crate) struct ChargeTarget {
    pub lease: Lease,
    pub organization_id: String,
    pub connected_account: String,
    pub customer_id: String,
    pub payment_method_id: String,
    pub currency: Currency,
}

/// Result of a charge the processor answered.
#[derive(Debug, Clone)]
pub(crate) struct Submission {
    /// Row after the guarded write; its status is authoritative.
    pub attempt: PaymentAttempt,
    /// Processor decline code, when the charge was refused.
    pub declined: Option<String>,
}

pub fn map_processor_status(status: &str) -> AttemptStatus {
    match status.trim() {
        "succeeded" => AttemptStatus::Succeeded,
        "requires_action" => AttemptStatus::RequiresAction,
        _ => AttemptStatus::Processing,
    }
}

pub(crate) fn charge_amount_is_valid(lease: &Lease) -> Option<Currency> {
    if lease.amount_minor <= 0 {
        return None;
    }
    Currency::parse(&lease.currency)
}

/// Sends the charge for an inserted ledger row and writes the outcome back.
///
/// Declines are an answer, not an error: the row moves to `failed` (or
/// `requires_action` when the bank wants the cardholder) and `Ok` is returned.
/// Transport and API failures leave the row `processing` with a
/// `gateway_error` note and come back as `Err`; the next run resubmits such a
/// row with its stored key. Amount and currency come from the row so a
/// resubmission repeats the original request exactly.
pub(crate) async fn submit_charge(
    ctx: &BillingContext,
    attempt: &PaymentAttempt,
    target: &ChargeTarget,
    actor_user_id: Option<&str>,
) -> AppResult<Submission> {
    let kind = AttemptKind::from(attempt.initiator);
    let mut metadata = BTreeMap::new();
    metadata.insert("lease_id".to_string(), target.lease.id.clone());
    metadata.insert("payment_attempt_id".to_string(), attempt.id.clone());
    metadata.insert("period".to_string(), attempt.period.clone());
    metadata.insert("attempt_no".to_string(), attempt.attempt_no.to_string());
    metadata.insert("kind".to_string(), kind.as_str().to_string());

    let request = OffSessionChargeRequest {
        connected_account: target.connected_account.clone(),
        customer_id: target.customer_id.clone(),
        payment_method_id: target.payment_method_id.clone(),
        amount_minor: attempt.amount_minor,
        currency: attempt.currency.as_str().to_string(),
        idempotency_key: attempt.idempotency_key.clone(),
        metadata,
    };

    let (next, update, declined) = match ctx.gateway.create_off_session_charge(&request).await {
        Ok(response) => {
            let next = map_processor_status(&response.status);
            let update = AttemptUpdate {
                payment_intent_id: Some(response.payment_intent_id),
                charge_id: response.charge_id,
                clear_failure: next != AttemptStatus::RequiresAction,
                ..AttemptUpdate::default()
            };
            (next, update, None)
        }
        Err(GatewayError::Declined {
            code,
            message,
            payment_intent_id,
            charge_id,
        }) => {
            let code = ledger::sanitize_failure_code(&code);
            let message = ledger::sanitize_failure_message(&message);
            let next = if code == AUTHENTICATION_REQUIRED {
                AttemptStatus::RequiresAction
            } else {
                AttemptStatus::Failed
            };
            let update = AttemptUpdate {
                payment_intent_id,
                charge_id,
                failure_code: Some(code.clone()),
                failure_message: message,
                ..AttemptUpdate::default()
            };
            (next, update, Some(code))
        }
        Err(error) => {
            tracing::warn!(
                lease_id = %target.lease.id,
                payment_attempt_id = %attempt.id,
                error = %error,
                "Autopay charge did not reach a processor decision"
            );
            let update = AttemptUpdate {
                failure_code: Some(error.failure_code()),
                failure_message: error.failure_message(),
                ..AttemptUpdate::default()
            };
            apply_transition(
                ctx.ledger.as_ref(),
                &attempt.id,
                AttemptStatus::Processing,
                &update,
            )
            .await?;
            ctx.events
                .audit(
                    AuditEntry::new("autopay.charge_failed", "payment_attempts", &attempt.id)
                        .organization(&target.organization_id)
                        .actor(actor_user_id)
                        .after(json!({
                            "status": AttemptStatus::Processing.as_str(),
                            "failure_code": GATEWAY_ERROR,
                        })),
                )
                .await;
            return Err(AppError::from(error));
        }
    };

    let result = apply_transition(ctx.ledger.as_ref(), &attempt.id, next, &update).await?;
    let row = result.attempt;
    sync_rollup(ctx.leases.as_ref(), &row.lease_id, row.status).await?;

    // A webhook that already recorded this decline has told staff about it.
    let announce_decline = declined.is_some() && result.changed;
    let action = if announce_decline {
        "autopay.charge_failed"
    } else {
        "autopay.charge_attempted"
    };
    ctx.events
        .audit(
            AuditEntry::new(action, "payment_attempts", &row.id)
                .organization(&target.organization_id)
                .actor(actor_user_id)
                .after(json!({
                    "lease_id": row.lease_id,
                    "period": row.period,
                    "attempt_no": row.attempt_no,
                    "kind": kind.as_str(),
                    "status": row.status.as_str(),
                    "payment_intent_id": row.payment_intent_id,
                    "failure_code": row.failure_code,
                })),
        )
        .await;
    if let Some(code) = declined.as_deref().filter(|_| announce_decline) {
        ctx.events
            .notify(notifications::charge_failed(
                &target.organization_id,
                &row.lease_id,
                &row.period,
                code,
            ))
            .await;
    }

    Ok(Submission {
        attempt: row,
        declined,
    })
}

enum LeaseOutcome {
    Skipped(SkipReason),
    Charged(PaymentAttempt),
    Declined(PaymentAttempt, String),
    Unresolved(PaymentAttempt, AppError),
}

/// One pass over every autopay-enabled active lease, read in keyset pages of
/// `batch_size`. Per-lease problems are recorded in the summary and never
/// abort the batch.
pub async fn run_autopay(ctx: &BillingContext, now: DateTime<Utc>, batch_size: i64) -> RunSummary {
    let mut summary = RunSummary::default();
    let cap = ctx.settings.max_reported_failures;
    let page_size = batch_size.max(1);
    let mut cursor: Option<String> = None;

    tracing::info!(batch_size = page_size, "Autopay run started");

    loop {
        let page = match ctx
            .leases
            .list_autopay_leases(cursor.as_deref(), page_size)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                tracing::error!(error = %error, after = ?cursor, "Autopay run could not list leases");
                summary.fail(
                    LeaseFailure {
                        lease_id: String::new(),
                        payment_attempt_id: None,
                        code: error.code().to_string(),
                        error: error.to_string(),
                    },
                    cap,
                );
                break;
            }
        };
        let full_page = page.len() as i64 >= page_size;
        cursor = page.last().map(|lease| lease.id.clone());
        tracing::debug!(leases = page.len(), "Autopay run page loaded");

        for lease in page {
            summary.examined += 1;
            let lease_id = lease.id.clone();
            let outcome = process_lease(ctx, lease, now).await;
            record_outcome(&mut summary, lease_id, outcome, cap);
        }

        if !full_page || cursor.is_none() {
            break;
        }
    }

    tracing::info!(
        examined = summary.examined,
        processed = summary.processed,
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        skipped = summary.skipped_total(),
        failed = summary.failed,
        "Autopay run completed"
    );
    summary
}

fn record_outcome(
    summary: &mut RunSummary,
    lease_id: String,
    outcome: AppResult<LeaseOutcome>,
    cap: usize,
) {
    match outcome {
        Ok(LeaseOutcome::Skipped(reason)) => {
            tracing::debug!(lease_id = %lease_id, reason = ?reason, "Autopay skipped lease");
            summary.skip(reason);
        }
        Ok(LeaseOutcome::Charged(attempt)) => {
            summary.processed += 1;
            summary.attempted += 1;
            if attempt.status == AttemptStatus::Succeeded {
                summary.succeeded += 1;
            }
        }
        Ok(LeaseOutcome::Declined(attempt, code)) => {
            summary.attempted += 1;
            summary.fail(
                LeaseFailure {
                    lease_id,
                    payment_attempt_id: Some(attempt.id),
                    code,
                    error: attempt
                        .failure_message
                        .unwrap_or_else(|| "Payment declined.".to_string()),
                },
                cap,
            );
        }
        Ok(LeaseOutcome::Unresolved(attempt, error)) => {
            summary.attempted += 1;
            summary.fail(
                LeaseFailure {
                    lease_id,
                    payment_attempt_id: Some(attempt.id),
                    code: error.code().to_string(),
                    error: ledger::sanitize_failure_message(&error.to_string())
                        .unwrap_or_default(),
                },
                cap,
            );
        }
        Err(error) => {
            tracing::warn!(lease_id = %lease_id, error = %error, "Autopay lease failed");
            summary.fail(
                LeaseFailure {
                    lease_id,
                    payment_attempt_id: None,
                    code: error.code().to_string(),
                    error: ledger::sanitize_failure_message(&error.to_string())
                        .unwrap_or_default(),
                },
                cap,
            );
        }
    }
}

/// A scheduled row whose charge never reached a processor decision.
fn is_stalled(row: &PaymentAttempt) -> bool {
    row.initiator == Initiator::System
        && row.status == AttemptStatus::Processing
        && row.payment_intent_id.is_none()
        && row.failure_code.as_deref() == Some(GATEWAY_ERROR)
}

async fn submit_for_lease(
    ctx: &BillingContext,
    attempt: PaymentAttempt,
    target: &ChargeTarget,
) -> LeaseOutcome {
    match submit_charge(ctx, &attempt, target, None).await {
        Ok(Submission {
            attempt,
            declined: Some(code),
        }) => LeaseOutcome::Declined(attempt, code),
        Ok(Submission { attempt, .. }) => LeaseOutcome::Charged(attempt),
        Err(error) => LeaseOutcome::Unresolved(attempt, error),
    }
}

async fn process_lease(
    ctx: &BillingContext,
    lease: Lease,
    now: DateTime<Utc>,
) -> AppResult<LeaseOutcome> {
    let Some(tenant_id) = lease
        .tenant_id
        .clone()
        .filter(|value| !value.trim().is_empty())
    else {
        return Ok(LeaseOutcome::Skipped(SkipReason::NoTenant));
    };

    let property = ctx
        .leases
        .get_property(&lease.property_id)
        .await?
        .ok_or_else(|| AppError::NotFound("properties record not found.".to_string()))?;
    let Some(client) = ctx.leases.get_client(&property.organization_id).await? else {
        return Ok(LeaseOutcome::Skipped(SkipReason::ClientInactive));
    };
    let Some(connected_account) = client.connected_account().map(ToOwned::to_owned) else {
        return Ok(LeaseOutcome::Skipped(SkipReason::ClientInactive));
    };

    let tz = calendar::resolve_timezone(property.timezone.as_deref(), ctx.settings.default_timezone)?;
    let today = calendar::local_date(now, tz);
    if !calendar::is_due_on(today, lease.billing_day, lease.weekend_rule, tz) {
        return Ok(LeaseOutcome::Skipped(SkipReason::NotDueToday));
    }
    let period = calendar::period_for_date(today);

    let profile = ctx
        .profiles
        .get_profile(&tenant_id, &property.organization_id)
        .await?;
    let Some((customer_id, payment_method_id)) = profile
        .as_ref()
        .and_then(|profile| profile.chargeable_method())
        .map(|(customer, method)| (customer.to_string(), method.to_string()))
    else {
        if lease.autopay_status != AutopayStatus::PendingMethod {
            ctx.leases
                .set_autopay_status(&lease.id, AutopayStatus::PendingMethod)
                .await?;
            ctx.events
                .notify(notifications::payment_method_missing(
                    &property.organization_id,
                    &lease.id,
                    &tenant_id,
                ))
                .await;
        }
        return Ok(LeaseOutcome::Skipped(SkipReason::PaymentMethodMissing));
    };

    let existing = ctx.ledger.list_attempts(&lease.id, Some(&period)).await?;
    if let Some(stalled) = existing.iter().find(|row| is_stalled(row)).cloned() {
        tracing::info!(
            lease_id = %lease.id,
            payment_attempt_id = %stalled.id,
            "Resubmitting autopay attempt that never reached the processor"
        );
        let target = ChargeTarget {
            currency: stalled.currency,
            lease,
            organization_id: property.organization_id,
            connected_account: stalled.stripe_account_id.clone(),
            customer_id,
            payment_method_id,
        };
        return Ok(submit_for_lease(ctx, stalled, &target).await);
    }
    if existing.iter().any(|row| {
        matches!(
            row.status,
            AttemptStatus::Processing | AttemptStatus::Succeeded
        )
    }) {
        return Ok(LeaseOutcome::Skipped(SkipReason::AlreadyInFlight));
    }

    let used: BTreeSet<i32> = existing
        .iter()
        .filter(|row| row.initiator == Initiator::System)
        .map(|row| row.attempt_no)
        .collect();
    let next_attempt = used.last().copied().unwrap_or(0) + 1;
    if next_attempt > ctx.settings.max_attempts_per_period {
        return Ok(LeaseOutcome::Skipped(SkipReason::AttemptCapReached));
    }

    let Some(currency) = charge_amount_is_valid(&lease) else {
        tracing::warn!(
            lease_id = %lease.id,
            amount_minor = lease.amount_minor,
            currency = %lease.currency,
            "Autopay lease has an unusable amount or currency"
        );
        return Ok(LeaseOutcome::Skipped(SkipReason::InvalidLeaseData));
    };

    let key = idempotency_key(
        &lease.id,
        &period,
        AttemptKind::Scheduled,
        i64::from(next_attempt),
    )?;
    let inserted = ctx
        .ledger
        .insert_attempt(&NewPaymentAttempt {
            lease_id: lease.id.clone(),
            property_id: property.id.clone(),
            organization_id: property.organization_id.clone(),
            period: period.clone(),
            attempt_no: next_attempt,
            initiator: Initiator::System,
            amount_minor: lease.amount_minor,
            currency,
            stripe_account_id: connected_account.clone(),
            idempotency_key: key,
        })
        .await;
    let attempt = match inserted {
        Ok(attempt) => attempt,
        Err(AppError::Conflict(_)) => {
            return Ok(LeaseOutcome::Skipped(SkipReason::ConcurrentRun));
        }
        Err(error) => return Err(error),
    };

    let target = ChargeTarget {
        lease,
        organization_id: property.organization_id,
        connected_account,
        customer_id,
        payment_method_id,
        currency,
    };
    Ok(submit_for_lease(ctx, attempt, &target).await)
}
