use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{error::AppError, models::PaymentMethodSummary, services::ledger};

/// Off-session, confirm-immediately charge against a saved payment method.
#[derive(Debug, Clone)]
pub struct OffSessionChargeRequest {
    pub connected_account: String,
    pub customer_id: String,
    pub payment_method_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub idempotency_key: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ChargeResponse {
    pub payment_intent_id: String,
    /// Raw processor status, e.g. `succeeded`, `processing`, `requires_action`.
    pub status: String,
    pub charge_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SetupIntentInfo {
    pub id: String,
    pub status: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PaymentMethodInfo {
    pub id: String,
    pub customer_id: Option<String>,
    pub summary: PaymentMethodSummary,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// The processor evaluated the charge and refused it.
    #[error("payment declined ({code}): {message}")]
    Declined {
        code: String,
        message: String,
        payment_intent_id: Option<String>,
        charge_id: Option<String>,
    },
    #[error("processor API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("processor request failed: {0}")]
    Transport(String),
    #[error("payment processor is not configured")]
    NotConfigured,
}

/// Failure code for a charge that never got a processor decision.
pub const GATEWAY_ERROR: &str = "gateway_error";

impl GatewayError {
    /// Short token stored on the ledger row.
    pub fn failure_code(&self) -> String {
        match self {
            Self::Declined { code, .. } => ledger::sanitize_failure_code(code),
            Self::Api { .. } | Self::Transport(_) | Self::NotConfigured => {
                GATEWAY_ERROR.to_string()
            }
        }
    }

    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Declined { message, .. } => ledger::sanitize_failure_message(message),
            other => ledger::sanitize_failure_message(&other.to_string()),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::NotConfigured => {
                AppError::Dependency("Payment processor is not configured.".to_string())
            }
            other => AppError::Upstream(
                ledger::sanitize_failure_message(&other.to_string())
                    .unwrap_or_else(|| "Payment processor error.".to_string()),
            ),
        }
    }
}

/// Processor operations the billing core depends on. Every call runs on
/// behalf of one connected account.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_off_session_charge(
        &self,
        request: &OffSessionChargeRequest,
    ) -> Result<ChargeResponse, GatewayError>;

    async fn retrieve_setup_intent(
        &self,
        setup_intent_id: &str,
        connected_account: &str,
    ) -> Result<SetupIntentInfo, GatewayError>;

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
        connected_account: &str,
    ) -> Result<PaymentMethodInfo, GatewayError>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        connected_account: &str,
    ) -> Result<(), GatewayError>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        connected_account: &str,
    ) -> Result<(), GatewayError>;
}
