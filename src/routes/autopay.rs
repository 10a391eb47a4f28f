use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    auth::{require_internal_api_key, require_user_id},
    error::{AppError, AppResult},
    schemas::{
        validate_input, LeasePath, PaymentAttemptsQuery, RunAutopayInput, SetAutopayInput,
    },
    services::{autopay_runner::run_autopay, manual_charge},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/leases/{lease_id}/autopay",
            axum::routing::post(set_lease_autopay),
        )
        .route(
            "/leases/{lease_id}/autopay/charge",
            axum::routing::post(charge_lease),
        )
        .route(
            "/leases/{lease_id}/payment-attempts",
            axum::routing::get(list_payment_attempts),
        )
        .route(
            "/internal/autopay/run",
            axum::routing::post(run_autopay_batch),
        )
}

async fn charge_lease(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = state.billing()?;
    let outcome =
        manual_charge::charge_lease_now(ctx, &user_id, &path.lease_id, Utc::now()).await?;
    Ok(Json(json!({
        "ok": true,
        "payment_attempt_id": outcome.payment_attempt_id,
        "payment_intent_id": outcome.payment_intent_id,
        "status": outcome.status,
    })))
}

async fn set_lease_autopay(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    headers: HeaderMap,
    Json(payload): Json<SetAutopayInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = state.billing()?;
    let lease = manual_charge::set_autopay(ctx, &user_id, &path.lease_id, payload.enabled).await?;
    Ok(Json(json!({
        "ok": true,
        "lease_id": lease.id,
        "autopay_enabled": lease.autopay_enabled,
        "autopay_status": lease.autopay_status,
    })))
}

async fn list_payment_attempts(
    State(state): State<AppState>,
    Path(path): Path<LeasePath>,
    Query(query): Query<PaymentAttemptsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let user_id = require_user_id(&state, &headers).await?;
    let ctx = state.billing()?;
    let rows =
        manual_charge::list_attempts(ctx, &user_id, &path.lease_id, query.period.as_deref())
            .await?;
    Ok(Json(json!({ "data": rows })))
}

/// Cron entry point for the daily autopay run.
async fn run_autopay_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    require_internal_api_key(&state, &headers)?;
    let input = if body.iter().all(u8::is_ascii_whitespace) {
        RunAutopayInput::default()
    } else {
        serde_json::from_slice::<RunAutopayInput>(&body)
            .map_err(|error| AppError::InvalidArgument(format!("Invalid request body: {error}")))?
    };
    validate_input(&input)?;

    let ctx = state.billing()?;
    let batch_size = state.config.autopay_batch_size(input.batch_size);
    let summary = run_autopay(ctx, Utc::now(), batch_size).await;

    Ok(Json(json!({
        "ok": true,
        "examined": summary.examined,
        "processed": summary.processed,
        "attempted": summary.attempted,
        "succeeded": summary.succeeded,
        "skipped": summary.skipped_total(),
        "skipped_by_reason": summary.skipped,
        "failed": summary.failed,
        "failures": summary.failures,
        "failures_truncated": summary.failures_truncated,
    })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        repository::LedgerStore,
        routes::v1_router,
        state::testing::{app_state, harness, Harness},
    };

    fn app(h: &Harness) -> Router {
        Router::new()
            .nest("/v1", v1_router())
            .with_state(app_state(h))
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post(uri: &str, user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn admin_charge_returns_the_attempt() {
        let h = harness();
        h.store.put_member("org-1", "admin-1", "owner_admin");

        let (status, body) = send(
            app(&h),
            post("/v1/leases/lease-1/autopay/charge", Some("admin-1"), json!({})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["status"], "succeeded");
        assert!(body["payment_intent_id"].is_string());
        assert_eq!(h.gateway.charge_count(), 1);
    }

    #[tokio::test]
    async fn charge_without_identity_or_role_is_refused() {
        let h = harness();
        h.store.put_member("org-1", "viewer-1", "viewer");

        let (status, body) = send(
            app(&h),
            post("/v1/leases/lease-1/autopay/charge", None, json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = send(
            app(&h),
            post("/v1/leases/lease-1/autopay/charge", Some("viewer-1"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(h.gateway.charge_count(), 0);
    }

    #[tokio::test]
    async fn accepts_a_signed_bearer_token() {
        let h = harness();
        h.store.put_member("org-1", "admin-1", "owner_admin");
        let token = crate::auth::test_tokens::signed("admin-1", "authenticated", "test-jwt-secret");

        let request = Request::builder()
            .method("POST")
            .uri("/v1/leases/lease-1/autopay")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(json!({"enabled": false}).to_string()))
            .unwrap();
        let (status, body) = send(app(&h), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["autopay_enabled"], false);
        assert_eq!(body["autopay_status"], "paused");
    }

    #[tokio::test]
    async fn lists_attempts_for_a_period() {
        let h = harness();
        h.store.put_member("org-1", "admin-1", "owner_admin");
        send(
            app(&h),
            post("/v1/leases/lease-1/autopay/charge", Some("admin-1"), json!({})),
        )
        .await;

        let period = h.store.list_attempts("lease-1", None).await.unwrap()[0]
            .period
            .clone();
        let request = Request::builder()
            .uri(format!("/v1/leases/lease-1/payment-attempts?period={period}"))
            .header("x-user-id", "admin-1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&h), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let request = Request::builder()
            .uri("/v1/leases/lease-1/payment-attempts?period=2026")
            .header("x-user-id", "admin-1")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&h), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn internal_run_requires_the_api_key() {
        let h = harness();
        let (status, _) = send(app(&h), post("/v1/internal/autopay/run", None, json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .method("POST")
            .uri("/v1/internal/autopay/run")
            .header("x-api-key", "internal-key")
            .header("content-type", "application/json")
            .body(Body::from(json!({"batchSize": 10}).to_string()))
            .unwrap();
        let (status, body) = send(app(&h), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["examined"], 1);
        assert!(body["failures"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_run_accepts_an_empty_body() {
        let h = harness();
        let request = Request::builder()
            .method("POST")
            .uri("/v1/internal/autopay/run")
            .header("x-api-key", "internal-key")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&h), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["failed"], 0);
    }
}
