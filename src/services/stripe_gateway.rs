use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use sha2::Sha256;
use url::Url;

use crate::{
    config::AppConfig,
    error::AppError,
    models::PaymentMethodSummary,
    services::gateway::{
        ChargeResponse, GatewayError, OffSessionChargeRequest, PaymentGateway, PaymentMethodInfo,
        SetupIntentInfo,
    },
};

type HmacSha256 = Hmac<Sha256>;

/// Stripe Connect client. Requests are form-encoded and carry the connected
/// account in the `Stripe-Account` header.
#[derive(Clone)]
pub struct StripeGateway {
    http_client: Client,
    secret_key: Option<String>,
    api_base: Url,
    timeout: Duration,
}

impl StripeGateway {
    pub fn from_config(http_client: Client, config: &AppConfig) -> Result<Self, AppError> {
        let api_base = Url::parse(&config.stripe_api_base).map_err(|error| {
            AppError::Internal(format!("Invalid STRIPE_API_BASE: {error}"))
        })?;
        Ok(Self {
            http_client,
            secret_key: config
                .stripe_secret_key
                .clone()
                .filter(|key| !key.trim().is_empty()),
            api_base,
            timeout: Duration::from_secs(config.stripe_timeout_seconds.max(1)),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.api_base
            .join(path)
            .map_err(|error| GatewayError::Transport(format!("invalid endpoint {path}: {error}")))
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        connected_account: &str,
    ) -> Result<RequestBuilder, GatewayError> {
        let secret_key = self
            .secret_key
            .as_deref()
            .ok_or(GatewayError::NotConfigured)?;
        Ok(self
            .http_client
            .request(method, self.endpoint(path)?)
            .basic_auth(secret_key, None::<&str>)
            .header("Stripe-Account", connected_account)
            .timeout(self.timeout))
    }

    async fn send(&self, request: RequestBuilder, operation: &str) -> Result<Value, GatewayError> {
        let response = request.send().await.map_err(|error| {
            tracing::error!(error = %error, operation, "Stripe API request failed");
            GatewayError::Transport("Stripe API request failed.".to_string())
        })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"error": {"message": "failed to parse response"}}));

        if status.is_success() {
            return Ok(body);
        }
        let error = classify_error(status.as_u16(), &body);
        tracing::warn!(
            operation,
            status = status.as_u16(),
            error = %error,
            "Stripe API returned an error"
        );
        Err(error)
    }
}

/// Card errors are declines; everything else is an API failure.
fn classify_error(status: u16, body: &Value) -> GatewayError {
    let error = body.get("error").cloned().unwrap_or(Value::Null);
    let message = str_field(&error, "message").unwrap_or_else(|| "Unknown Stripe error".to_string());
    if str_field(&error, "type").as_deref() == Some("card_error") {
        let code = str_field(&error, "decline_code")
            .or_else(|| str_field(&error, "code"))
            .unwrap_or_else(|| "card_declined".to_string());
        return GatewayError::Declined {
            code,
            message,
            payment_intent_id: expandable_id(error.get("payment_intent")),
            charge_id: str_field(&error, "charge"),
        };
    }
    GatewayError::Api { status, message }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Stripe fields that are either an id string or an expanded object.
pub fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Object(object) => object
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        _ => None,
    }
}

fn metadata_map(value: Option<&Value>) -> std::collections::BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| value.as_str().map(|text| (key.clone(), text.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn card_summary(method: &Value) -> PaymentMethodSummary {
    let card = method.get("card").cloned().unwrap_or(Value::Null);
    PaymentMethodSummary {
        brand: str_field(&card, "brand"),
        last4: str_field(&card, "last4"),
        exp_month: card
            .get("exp_month")
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok()),
        exp_year: card
            .get("exp_year")
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok()),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_off_session_charge(
        &self,
        request: &OffSessionChargeRequest,
    ) -> Result<ChargeResponse, GatewayError> {
        let amount = request.amount_minor.to_string();
        let currency = request.currency.to_ascii_lowercase();
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), amount),
            ("currency".to_string(), currency),
            ("customer".to_string(), request.customer_id.clone()),
            ("payment_method".to_string(), request.payment_method_id.clone()),
            ("off_session".to_string(), "true".to_string()),
            ("confirm".to_string(), "true".to_string()),
        ];
        for (key, value) in &request.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        let builder = self
            .request(
                reqwest::Method::POST,
                "/v1/payment_intents",
                &request.connected_account,
            )?
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form);
        let body = self.send(builder, "create_payment_intent").await?;

        let payment_intent_id = str_field(&body, "id").ok_or_else(|| {
            GatewayError::Transport("Stripe response is missing the payment intent id.".to_string())
        })?;
        Ok(ChargeResponse {
            payment_intent_id,
            status: str_field(&body, "status").unwrap_or_else(|| "processing".to_string()),
            charge_id: expandable_id(body.get("latest_charge")),
        })
    }

    async fn retrieve_setup_intent(
        &self,
        setup_intent_id: &str,
        connected_account: &str,
    ) -> Result<SetupIntentInfo, GatewayError> {
        let path = format!("/v1/setup_intents/{setup_intent_id}");
        let builder = self.request(reqwest::Method::GET, &path, connected_account)?;
        let body = self.send(builder, "retrieve_setup_intent").await?;
        Ok(SetupIntentInfo {
            id: str_field(&body, "id").unwrap_or_else(|| setup_intent_id.to_string()),
            status: str_field(&body, "status").unwrap_or_default(),
            customer_id: expandable_id(body.get("customer")),
            payment_method_id: expandable_id(body.get("payment_method")),
            metadata: metadata_map(body.get("metadata")),
        })
    }

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
        connected_account: &str,
    ) -> Result<PaymentMethodInfo, GatewayError> {
        let path = format!("/v1/payment_methods/{payment_method_id}");
        let builder = self.request(reqwest::Method::GET, &path, connected_account)?;
        let body = self.send(builder, "retrieve_payment_method").await?;
        Ok(PaymentMethodInfo {
            id: str_field(&body, "id").unwrap_or_else(|| payment_method_id.to_string()),
            customer_id: expandable_id(body.get("customer")),
            summary: card_summary(&body),
        })
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
        connected_account: &str,
    ) -> Result<(), GatewayError> {
        let path = format!("/v1/payment_methods/{payment_method_id}/attach");
        let builder = self
            .request(reqwest::Method::POST, &path, connected_account)?
            .form(&[("customer", customer_id)]);
        self.send(builder, "attach_payment_method").await?;
        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
        connected_account: &str,
    ) -> Result<(), GatewayError> {
        let path = format!("/v1/customers/{customer_id}");
        let builder = self
            .request(reqwest::Method::POST, &path, connected_account)?
            .form(&[(
                "invoice_settings[default_payment_method]",
                payment_method_id,
            )]);
        self.send(builder, "set_default_payment_method").await?;
        Ok(())
    }
}

/// Verify a Stripe webhook signature using HMAC-SHA256.
///
/// The `Stripe-Signature` header looks like `t=<unix>,v1=<hex>[,v1=<hex>...]`.
/// The signed payload is `<t>.<raw body>`; any `v1` entry may match, compared
/// in constant time. Timestamps further than `tolerance_seconds` from `now`
/// are rejected.
pub fn verify_stripe_signature(
    payload: &[u8],
    signature_header: &str,
    webhook_secret: &str,
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), AppError> {
    let invalid = |reason: &str| AppError::SignatureInvalid(reason.to_string());

    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = Some(t);
        } else if let Some(v1) = part.strip_prefix("v1=") {
            signatures.push(v1);
        }
    }

    let ts_str = timestamp.ok_or_else(|| invalid("Signature header has no timestamp."))?;
    if signatures.is_empty() {
        return Err(invalid("Signature header has no v1 signature."));
    }
    let ts = ts_str
        .parse::<i64>()
        .map_err(|_| invalid("Signature timestamp is not a number."))?;

    let delta = (now - ts).abs();
    if delta > tolerance_seconds.max(0) {
        tracing::warn!(delta_seconds = delta, "Stripe webhook signature outside tolerance");
        return Err(invalid("Signature timestamp is outside the tolerance window."));
    }

    let mut mac = HmacSha256::new_from_slice(webhook_secret.as_bytes())
        .map_err(|_| invalid("Webhook secret is unusable."))?;
    mac.update(ts_str.as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|expected| mac.clone().verify_slice(&expected).is_ok())
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(invalid("No signature matches the payload."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_768_435_200;

    fn sign(payload: &[u8], timestamp: i64, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = format!("t={NOW},v1={}", sign(body, NOW, SECRET));
        assert!(verify_stripe_signature(body, &header, SECRET, 300, NOW + 10).is_ok());
    }

    #[test]
    fn any_v1_entry_may_match() {
        let body = br#"{"id":"evt_1"}"#;
        let header = format!(
            "t={NOW},v1={},v1={}",
            sign(body, NOW, "whsec_old"),
            sign(body, NOW, SECRET)
        );
        assert!(verify_stripe_signature(body, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn rejects_tampered_body() {
        let header = format!("t={NOW},v1={}", sign(br#"{"id":"evt_1"}"#, NOW, SECRET));
        assert!(matches!(
            verify_stripe_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 300, NOW),
            Err(AppError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn rejects_stale_and_malformed_headers() {
        let body = br#"{"id":"evt_1"}"#;
        let header = format!("t={NOW},v1={}", sign(body, NOW, SECRET));
        assert!(verify_stripe_signature(body, &header, SECRET, 300, NOW + 301).is_err());
        assert!(verify_stripe_signature(body, "", SECRET, 300, NOW).is_err());
        assert!(verify_stripe_signature(body, &format!("t={NOW}"), SECRET, 300, NOW).is_err());
        assert!(verify_stripe_signature(body, "t=abc,v1=00", SECRET, 300, NOW).is_err());
        assert!(
            verify_stripe_signature(body, &format!("t={NOW},v1=zz"), SECRET, 300, NOW).is_err()
        );
    }

    #[test]
    fn card_errors_become_declines() {
        let body = json!({
            "error": {
                "type": "card_error",
                "code": "card_declined",
                "decline_code": "insufficient_funds",
                "message": "Your card has insufficient funds.",
                "payment_intent": {"id": "pi_1", "status": "requires_payment_method"},
                "charge": "ch_1"
            }
        });
        match classify_error(402, &body) {
            GatewayError::Declined {
                code,
                payment_intent_id,
                charge_id,
                ..
            } => {
                assert_eq!(code, "insufficient_funds");
                assert_eq!(payment_intent_id.as_deref(), Some("pi_1"));
                assert_eq!(charge_id.as_deref(), Some("ch_1"));
            }
            other => panic!("expected decline, got {other:?}"),
        }

        let api = classify_error(500, &json!({"error": {"type": "api_error", "message": "boom"}}));
        assert!(matches!(api, GatewayError::Api { status: 500, .. }));
    }

    #[test]
    fn expandable_ids_accept_strings_and_objects() {
        assert_eq!(expandable_id(Some(&json!("ch_1"))).as_deref(), Some("ch_1"));
        assert_eq!(
            expandable_id(Some(&json!({"id": "ch_2", "object": "charge"}))).as_deref(),
            Some("ch_2")
        );
        assert_eq!(expandable_id(Some(&Value::Null)), None);
        assert_eq!(expandable_id(None), None);
    }

    #[tokio::test]
    async fn unconfigured_gateway_refuses_to_charge() {
        let mut config = crate::config::test_config();
        config.stripe_secret_key = None;
        let gateway = StripeGateway::from_config(Client::new(), &config).unwrap();
        let result = gateway
            .create_off_session_charge(&OffSessionChargeRequest {
                connected_account: "acct_1".into(),
                customer_id: "cus_1".into(),
                payment_method_id: "pm_1".into(),
                amount_minor: 100,
                currency: "usd".into(),
                idempotency_key: "lease:l:202601:scheduled:1".into(),
                metadata: Default::default(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::NotConfigured)));
    }
}
