use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    services::{
        stripe_gateway::verify_stripe_signature,
        webhook_reconciler::{parse_event, reconcile_event},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/webhooks/stripe", axum::routing::post(stripe_webhook))
}

/// Connect webhook. Anything accepted gets a 200 so Stripe stops retrying;
/// only signature and payload problems are rejected.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .filter(|secret| !secret.trim().is_empty())
        .ok_or_else(|| {
            AppError::Dependency("STRIPE_WEBHOOK_SECRET is not configured.".to_string())
        })?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::SignatureInvalid("Missing Stripe-Signature header.".to_string()))?;
    verify_stripe_signature(
        &body,
        signature,
        secret,
        state.config.stripe_webhook_tolerance_seconds,
        Utc::now().timestamp(),
    )?;

    let event = parse_event(&body)?;
    let ctx = state.billing()?;
    let outcome = reconcile_event(ctx, &event).await?;
    tracing::info!(
        event_id = %event.id,
        event_type = %event.event_type,
        outcome = ?outcome,
        "Stripe webhook handled"
    );

    Ok(Json(json!({
        "ok": true,
        "event_id": event.id,
        "outcome": outcome,
    })))
}
