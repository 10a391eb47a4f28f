use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    models::{AttemptStatus, AttemptUpdate, PaymentAttempt, WebhookEventStatus},
    services::{
        ledger::{self, apply_transition, sync_rollup},
        notifications::{self, AuditEntry},
        payment_profiles,
        stripe_gateway::expandable_id,
    },
    state::BillingContext,
};

pub const PAYMENT_INTENT_SUCCEEDED: &str = "payment_intent.succeeded";
pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";
pub const PAYMENT_INTENT_REQUIRES_ACTION: &str = "payment_intent.requires_action";
pub const SETUP_INTENT_SUCCEEDED: &str = "setup_intent.succeeded";

/// A verified processor event, reduced to the fields reconciliation reads.
#[derive(Debug, Clone)]
pub struct ProcessorEvent {
    pub id: String,
    pub event_type: String,
    /// Connected account the event belongs to (`account` on Connect events).
    pub account: Option<String>,
    /// `data.object`.
    pub object: Value,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Processed,
    Duplicate,
    Ignored,
    /// Processing failed; the error is stored on the event record.
    Failed,
}

enum Handled {
    Applied,
    Ignored,
}

fn text(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

pub fn parse_event(body: &[u8]) -> AppResult<ProcessorEvent> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|_| AppError::InvalidArgument("Webhook body is not valid JSON.".to_string()))?;
    let id = text(&payload, "id")
        .ok_or_else(|| AppError::InvalidArgument("Webhook event has no id.".to_string()))?;
    let event_type = text(&payload, "type")
        .ok_or_else(|| AppError::InvalidArgument("Webhook event has no type.".to_string()))?;
    let object = payload
        .get("data")
        .and_then(|data| data.get("object"))
        .cloned()
        .unwrap_or(Value::Null);
    Ok(ProcessorEvent {
        id,
        event_type,
        account: text(&payload, "account"),
        object,
        payload,
    })
}

/// Applies one processor event at most once.
///
/// Storage errors while recording the receipt propagate so the processor
/// redelivers. Anything that goes wrong after that is stored on the event as
/// `failed` and reported as `Failed`, never as an error.
pub async fn reconcile_event(
    ctx: &BillingContext,
    event: &ProcessorEvent,
) -> AppResult<ReconcileOutcome> {
    let receipt = ctx
        .ledger
        .record_event_receipt(
            &event.id,
            &event.event_type,
            event.account.as_deref(),
            &event.payload,
        )
        .await?;
    if receipt.status == WebhookEventStatus::Processed {
        tracing::info!(event_id = %event.id, "Duplicate webhook event acknowledged");
        return Ok(ReconcileOutcome::Duplicate);
    }

    match dispatch(ctx, event).await {
        Ok(handled) => {
            ctx.ledger
                .finish_event(&event.id, WebhookEventStatus::Processed, None)
                .await?;
            Ok(match handled {
                Handled::Applied => ReconcileOutcome::Processed,
                Handled::Ignored => ReconcileOutcome::Ignored,
            })
        }
        Err(error) => {
            let message = ledger::sanitize_failure_message(&error.to_string())
                .unwrap_or_else(|| error.code().to_string());
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                attempt_count = receipt.attempt_count,
                error = %message,
                "Webhook event processing failed"
            );
            ctx.ledger
                .finish_event(&event.id, WebhookEventStatus::Failed, Some(&message))
                .await?;
            Ok(ReconcileOutcome::Failed)
        }
    }
}

async fn dispatch(ctx: &BillingContext, event: &ProcessorEvent) -> AppResult<Handled> {
    match event.event_type.as_str() {
        PAYMENT_INTENT_SUCCEEDED => {
            apply_payment_intent(ctx, event, AttemptStatus::Succeeded).await
        }
        PAYMENT_INTENT_FAILED => apply_payment_intent(ctx, event, AttemptStatus::Failed).await,
        PAYMENT_INTENT_REQUIRES_ACTION => {
            apply_payment_intent(ctx, event, AttemptStatus::RequiresAction).await
        }
        SETUP_INTENT_SUCCEEDED => {
            let setup_intent_id = text(&event.object, "id").ok_or_else(|| {
                AppError::InvalidArgument("setup_intent event has no object id.".to_string())
            })?;
            let event_tenant = event
                .object
                .get("metadata")
                .and_then(|metadata| text(metadata, "tenant_id"));
            payment_profiles::activate_from_setup_intent(
                ctx,
                event.account.as_deref(),
                &setup_intent_id,
                event_tenant.as_deref(),
            )
            .await?;
            Ok(Handled::Applied)
        }
        other => {
            tracing::debug!(event_type = %other, "Webhook event type not handled");
            Ok(Handled::Ignored)
        }
    }
}

/// Row for a payment intent, falling back to the `payment_attempt_id`
/// metadata attached at charge time when the intent id was never stored.
async fn locate_attempt(
    ctx: &BillingContext,
    intent_id: &str,
    object: &Value,
) -> AppResult<Option<PaymentAttempt>> {
    if let Some(row) = ctx.ledger.find_attempt_by_intent(intent_id).await? {
        return Ok(Some(row));
    }
    let Some(attempt_id) = object
        .get("metadata")
        .and_then(|metadata| text(metadata, "payment_attempt_id"))
    else {
        return Ok(None);
    };
    if uuid::Uuid::parse_str(&attempt_id).is_err() {
        return Ok(None);
    }
    let row = ctx.ledger.get_attempt(&attempt_id).await?;
    Ok(row.filter(|row| {
        row.payment_intent_id
            .as_deref()
            .map_or(true, |stored| stored == intent_id)
    }))
}

async fn apply_payment_intent(
    ctx: &BillingContext,
    event: &ProcessorEvent,
    next: AttemptStatus,
) -> AppResult<Handled> {
    let intent_id = text(&event.object, "id").ok_or_else(|| {
        AppError::InvalidArgument("payment_intent event has no object id.".to_string())
    })?;

    let Some(row) = locate_attempt(ctx, &intent_id, &event.object).await? else {
        tracing::info!(
            event_id = %event.id,
            payment_intent_id = %intent_id,
            "Webhook payment intent is unmatched; acknowledging"
        );
        return Ok(Handled::Ignored);
    };
    if let Some(account) = event.account.as_deref() {
        if account != row.stripe_account_id {
            tracing::warn!(
                event_id = %event.id,
                payment_attempt_id = %row.id,
                "Webhook account does not match the attempt; acknowledging"
            );
            return Ok(Handled::Ignored);
        }
    }

    let mut update = AttemptUpdate {
        payment_intent_id: Some(intent_id.clone()),
        charge_id: expandable_id(event.object.get("latest_charge")),
        last_event_id: Some(event.id.clone()),
        ..AttemptUpdate::default()
    };
    match next {
        AttemptStatus::Succeeded => update.clear_failure = true,
        AttemptStatus::Failed | AttemptStatus::RequiresAction => {
            let last_error = event
                .object
                .get("last_payment_error")
                .cloned()
                .unwrap_or(Value::Null);
            let code = text(&last_error, "decline_code").or_else(|| text(&last_error, "code"));
            update.failure_code = match (next, code) {
                (_, Some(code)) => Some(ledger::sanitize_failure_code(&code)),
                (AttemptStatus::RequiresAction, None) => Some("requires_action".to_string()),
                _ => Some("unknown".to_string()),
            };
            update.failure_message = text(&last_error, "message")
                .as_deref()
                .and_then(ledger::sanitize_failure_message);
        }
        _ => {}
    }

    let result = apply_transition(ctx.ledger.as_ref(), &row.id, next, &update).await?;
    if !result.applied {
        return Ok(Handled::Applied);
    }
    let row = result.attempt;
    sync_rollup(ctx.leases.as_ref(), &row.lease_id, row.status).await?;
    if !result.changed {
        // The synchronous response already settled this status and told staff.
        return Ok(Handled::Applied);
    }

    ctx.events
        .audit(
            AuditEntry::new("autopay.webhook_reconciled", "payment_attempts", &row.id)
                .organization(&row.organization_id)
                .after(json!({
                    "event_id": event.id,
                    "event_type": event.event_type,
                    "status": row.status.as_str(),
                    "failure_code": row.failure_code,
                })),
        )
        .await;
    if row.status == AttemptStatus::Failed {
        ctx.events
            .notify(notifications::charge_failed(
                &row.organization_id,
                &row.lease_id,
                &row.period,
                row.failure_code.as_deref().unwrap_or("unknown"),
            ))
            .await;
    }
    Ok(Handled::Applied)
}
