use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Paused,
    Ended,
}

/// Derived summary of the most recent attempts. The ledger is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopayStatus {
    Active,
    PendingMethod,
    Failing,
    Paused,
}

impl AutopayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PendingMethod => "pending_method",
            Self::Failing => "failing",
            Self::Paused => "paused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekendRule {
    #[serde(alias = "shift_forward")]
    ShiftToNextBusinessDay,
    #[serde(alias = "shift_backward")]
    ShiftToPreviousBusinessDay,
    NoShift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Usd,
    Mxn,
}

impl Currency {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "usd" => Some(Self::Usd),
            "mxn" => Some(Self::Mxn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Mxn => "mxn",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub property_id: String,
    pub tenant_id: Option<String>,
    pub amount_minor: i64,
    /// Kept raw so bad data surfaces as a runner skip instead of a decode error.
    pub currency: String,
    pub billing_day: i32,
    pub weekend_rule: WeekendRule,
    pub autopay_enabled: bool,
    pub autopay_status: AutopayStatus,
    pub lease_status: LeaseStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub organization_id: String,
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Active,
    Disabled,
}

/// Owner/manager grouping with its own connected sub-account at the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAccount {
    pub id: String,
    pub stripe_account_id: Option<String>,
    pub status: ClientStatus,
}

impl ClientAccount {
    pub fn connected_account(&self) -> Option<&str> {
        if self.status != ClientStatus::Active {
            return None;
        }
        self.stripe_account_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Active,
    Pending,
    MissingMethod,
    Disabled,
}

impl ProfileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::MissingMethod => "missing_method",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodSummary {
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<u32>,
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPaymentProfile {
    pub tenant_id: String,
    pub organization_id: String,
    pub stripe_customer_id: Option<String>,
    pub default_payment_method_id: Option<String>,
    #[serde(default)]
    pub method_summary: Option<PaymentMethodSummary>,
    pub status: ProfileStatus,
}

impl TenantPaymentProfile {
    /// Customer and payment-method ids, when the profile can back an off-session charge.
    pub fn chargeable_method(&self) -> Option<(&str, &str)> {
        if self.status != ProfileStatus::Active {
            return None;
        }
        let customer = self
            .stripe_customer_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())?;
        let method = self
            .default_payment_method_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())?;
        Some((customer, method))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Scheduled,
    Processing,
    Succeeded,
    Failed,
    RequiresAction,
    Canceled,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RequiresAction => "requires_action",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    System,
    Admin,
}

impl Initiator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: String,
    pub lease_id: String,
    pub property_id: String,
    pub organization_id: String,
    pub period: String,
    pub attempt_no: i32,
    pub initiator: Initiator,
    pub amount_minor: i64,
    pub currency: String,
    pub stripe_account_id: String,
    pub idempotency_key: String,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub status: AttemptStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub last_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a ledger row that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewPaymentAttempt {
    pub lease_id: String,
    pub property_id: String,
    pub organization_id: String,
    pub period: String,
    pub attempt_no: i32,
    pub initiator: Initiator,
    pub amount_minor: i64,
    pub currency: Currency,
    pub stripe_account_id: String,
    pub idempotency_key: String,
}

/// A guarded status write. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct AttemptUpdate {
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub last_event_id: Option<String>,
    /// Null out failure code and message (a later success supersedes them).
    pub clear_failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub stripe_account_id: Option<String>,
    pub status: WebhookEventStatus,
    pub attempt_count: i32,
    pub payload: Value,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn weekend_rule_accepts_short_aliases() {
        let forward: WeekendRule = serde_json::from_value(json!("shift_forward")).unwrap();
        let next: WeekendRule =
            serde_json::from_value(json!("shift_to_next_business_day")).unwrap();
        assert_eq!(forward, next);
        let back: WeekendRule = serde_json::from_value(json!("shift_backward")).unwrap();
        assert_eq!(back, WeekendRule::ShiftToPreviousBusinessDay);
    }

    #[test]
    fn currency_parse_is_case_insensitive_and_closed() {
        assert_eq!(Currency::parse(" USD "), Some(Currency::Usd));
        assert_eq!(Currency::parse("mxn"), Some(Currency::Mxn));
        assert_eq!(Currency::parse("pyg"), None);
    }

    #[test]
    fn profile_requires_active_status_and_both_ids() {
        let mut profile = TenantPaymentProfile {
            tenant_id: "t1".into(),
            organization_id: "c1".into(),
            stripe_customer_id: Some("cus_1".into()),
            default_payment_method_id: Some("pm_1".into()),
            method_summary: None,
            status: ProfileStatus::Active,
        };
        assert_eq!(profile.chargeable_method(), Some(("cus_1", "pm_1")));
        profile.default_payment_method_id = Some("  ".into());
        assert_eq!(profile.chargeable_method(), None);
        profile.default_payment_method_id = Some("pm_1".into());
        profile.status = ProfileStatus::Pending;
        assert_eq!(profile.chargeable_method(), None);
    }

    #[test]
    fn disabled_client_has_no_connected_account() {
        let mut client = ClientAccount {
            id: "c1".into(),
            stripe_account_id: Some("acct_1".into()),
            status: ClientStatus::Active,
        };
        assert_eq!(client.connected_account(), Some("acct_1"));
        client.status = ClientStatus::Disabled;
        assert_eq!(client.connected_account(), None);
    }
}
