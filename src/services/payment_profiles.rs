use serde_json::json;

use crate::{
    error::{AppError, AppResult},
    models::{ProfileStatus, TenantPaymentProfile},
    services::notifications::AuditEntry,
    state::BillingContext,
};

const SETUP_SUCCEEDED: &str = "succeeded";

/// Turns a completed setup intent into the tenant's active default payment
/// method for the connected account's organization.
///
/// The tenant comes from the setup intent's `tenant_id` metadata, falling back
/// to the profile already holding the intent's customer.
pub async fn activate_from_setup_intent(
    ctx: &BillingContext,
    connected_account: Option<&str>,
    setup_intent_id: &str,
    event_tenant_id: Option<&str>,
) -> AppResult<TenantPaymentProfile> {
    let account = connected_account
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::InvalidArgument("setup_intent event has no connected account.".to_string())
        })?;
    let client = ctx
        .leases
        .find_client_by_account(account)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("No organization uses connected account {account}."))
        })?;

    let intent = ctx
        .gateway
        .retrieve_setup_intent(setup_intent_id, account)
        .await
        .map_err(AppError::from)?;
    if intent.status != SETUP_SUCCEEDED {
        return Err(AppError::PreconditionFailed(format!(
            "Setup intent {} is '{}', not succeeded.",
            intent.id, intent.status
        )));
    }
    let payment_method_id = intent.payment_method_id.clone().ok_or_else(|| {
        AppError::InvalidArgument("Setup intent has no payment method.".to_string())
    })?;

    let existing = match intent.customer_id.as_deref() {
        Some(customer) => {
            ctx.profiles
                .find_profile_by_customer(&client.id, customer)
                .await?
        }
        None => None,
    };
    let tenant_id = intent
        .metadata
        .get("tenant_id")
        .map(String::as_str)
        .or(event_tenant_id)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| existing.as_ref().map(|profile| profile.tenant_id.clone()))
        .ok_or_else(|| {
            AppError::NotFound("Setup intent cannot be matched to a tenant.".to_string())
        })?;

    let current = ctx.profiles.get_profile(&tenant_id, &client.id).await?;
    let customer_id = intent
        .customer_id
        .clone()
        .or_else(|| current.as_ref().and_then(|profile| profile.stripe_customer_id.clone()))
        .ok_or_else(|| {
            AppError::PreconditionFailed("Setup intent has no customer to attach to.".to_string())
        })?;

    let method = ctx
        .gateway
        .retrieve_payment_method(&payment_method_id, account)
        .await
        .map_err(AppError::from)?;
    if method.customer_id.as_deref() != Some(customer_id.as_str()) {
        ctx.gateway
            .attach_payment_method(&payment_method_id, &customer_id, account)
            .await
            .map_err(AppError::from)?;
    }
    ctx.gateway
        .set_default_payment_method(&customer_id, &payment_method_id, account)
        .await
        .map_err(AppError::from)?;

    let profile = ctx
        .profiles
        .upsert_profile(&TenantPaymentProfile {
            tenant_id: tenant_id.clone(),
            organization_id: client.id.clone(),
            stripe_customer_id: Some(customer_id),
            default_payment_method_id: Some(payment_method_id),
            method_summary: Some(method.summary),
            status: ProfileStatus::Active,
        })
        .await?;

    let reactivated = ctx
        .leases
        .reactivate_pending_leases(&tenant_id, &client.id)
        .await?;
    tracing::info!(
        tenant_id = %tenant_id,
        organization_id = %client.id,
        reactivated,
        "Tenant payment profile activated"
    );

    ctx.events
        .audit(
            AuditEntry::new("payment_profile.activated", "tenant_payment_profiles", &tenant_id)
                .organization(&client.id)
                .after(json!({
                    "status": profile.status.as_str(),
                    "default_payment_method_id": profile.default_payment_method_id,
                    "method_summary": profile.method_summary,
                    "reactivated_leases": reactivated,
                })),
        )
        .await;

    Ok(profile)
}
