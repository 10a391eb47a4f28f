use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde_json::{json, Value};
use sqlx::PgPool;
use url::Url;

use crate::config::AppConfig;

/// Append-only audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub organization_id: Option<String>,
    pub actor_user_id: Option<String>,
    pub action: String,
    pub entity_name: String,
    pub entity_id: Option<String>,
    pub after_state: Option<Value>,
}

impl AuditEntry {
    pub fn new(action: &str, entity_name: &str, entity_id: &str) -> Self {
        Self {
            organization_id: None,
            actor_user_id: None,
            action: action.to_string(),
            entity_name: entity_name.to_string(),
            entity_id: Some(entity_id.to_string()),
            after_state: None,
        }
    }

    pub fn organization(mut self, organization_id: &str) -> Self {
        self.organization_id = Some(organization_id.to_string());
        self
    }

    pub fn actor(mut self, user_id: Option<&str>) -> Self {
        self.actor_user_id = user_id.map(ToOwned::to_owned);
        self
    }

    pub fn after(mut self, state: Value) -> Self {
        self.after_state = Some(state);
        self
    }
}

#[derive(Debug, Clone)]
pub struct BillingNotification {
    pub organization_id: String,
    pub event_type: String,
    pub severity: String,
    pub title: String,
    pub body: String,
    pub lease_id: Option<String>,
    pub payload: Value,
}

/// Where billing side effects go. Delivery is best effort: a failure is
/// logged and never propagated into the charge path.
#[async_trait]
pub trait BillingEventSink: Send + Sync {
    async fn audit(&self, entry: AuditEntry);

    async fn notify(&self, notification: BillingNotification);
}

pub fn payment_method_missing(
    organization_id: &str,
    lease_id: &str,
    tenant_id: &str,
) -> BillingNotification {
    BillingNotification {
        organization_id: organization_id.to_string(),
        event_type: "autopay.payment_method_missing".to_string(),
        severity: "warning".to_string(),
        title: "Autopay needs a payment method".to_string(),
        body: "The tenant has no active saved payment method, so this month's autopay charge was not attempted.".to_string(),
        lease_id: Some(lease_id.to_string()),
        payload: json!({ "lease_id": lease_id, "tenant_id": tenant_id }),
    }
}

pub fn charge_failed(
    organization_id: &str,
    lease_id: &str,
    period: &str,
    failure_code: &str,
) -> BillingNotification {
    BillingNotification {
        organization_id: organization_id.to_string(),
        event_type: "autopay.charge_failed".to_string(),
        severity: "critical".to_string(),
        title: "Autopay charge failed".to_string(),
        body: format!("The autopay charge for period {period} did not go through ({failure_code})."),
        lease_id: Some(lease_id.to_string()),
        payload: json!({ "lease_id": lease_id, "period": period, "failure_code": failure_code }),
    }
}

/// Writes `audit_logs` and `notification_events` rows, and forwards
/// notifications to the automation webhook when one is configured.
pub struct PgEventSink {
    pool: PgPool,
    automation: Option<AutomationWebhook>,
}

impl PgEventSink {
    pub fn new(pool: PgPool, automation: Option<AutomationWebhook>) -> Self {
        Self { pool, automation }
    }
}

#[async_trait]
impl BillingEventSink for PgEventSink {
    async fn audit(&self, entry: AuditEntry) {
        let result = sqlx::query(
            "INSERT INTO audit_logs (
               organization_id, actor_user_id, action, entity_name, entity_id, after_state
             )
             VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6)",
        )
        .bind(entry.organization_id.as_deref())
        .bind(entry.actor_user_id.as_deref())
        .bind(&entry.action)
        .bind(&entry.entity_name)
        .bind(entry.entity_id.as_deref())
        .bind(entry.after_state.as_ref())
        .execute(&self.pool)
        .await;
        if let Err(error) = result {
            tracing::warn!(error = %error, action = %entry.action, "Failed to write audit log");
        }
    }

    async fn notify(&self, notification: BillingNotification) {
        let result = sqlx::query(
            "INSERT INTO notification_events (
               organization_id, event_type, category, severity, title, body,
               source_table, source_id, payload
             )
             VALUES ($1::uuid, $2, 'payments', $3, $4, $5, 'leases', $6, $7)",
        )
        .bind(&notification.organization_id)
        .bind(&notification.event_type)
        .bind(&notification.severity)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(notification.lease_id.as_deref())
        .bind(&notification.payload)
        .execute(&self.pool)
        .await;
        if let Err(error) = result {
            tracing::warn!(
                error = %error,
                event_type = %notification.event_type,
                "Failed to write notification event"
            );
        }

        if let Some(webhook) = &self.automation {
            webhook.dispatch(json!({
                "event_type": notification.event_type,
                "organization_id": notification.organization_id,
                "lease_id": notification.lease_id,
                "severity": notification.severity,
                "payload": notification.payload,
            }));
        }
    }
}

/// Fire-and-forget POST to an external automation endpoint with bounded,
/// jittered exponential backoff.
#[derive(Clone)]
pub struct AutomationWebhook {
    http_client: Client,
    url: Url,
    max_attempts: u32,
    initial_delay: Duration,
}

impl AutomationWebhook {
    pub fn from_config(http_client: Client, config: &AppConfig) -> Option<Self> {
        let url = config
            .automation_webhook_url
            .as_deref()
            .and_then(|raw| Url::parse(raw).ok())?;
        Some(Self {
            http_client,
            url,
            max_attempts: config.automation_webhook_max_attempts.clamp(1, 10),
            initial_delay: Duration::from_millis(500),
        })
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, plus
    /// up to 25% jitter, capped at 30 seconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64() * 2f64.powi((attempt - 1) as i32);
        let jitter = 1.0 + rand::rng().random_range(0.0..0.25);
        Duration::from_secs_f64((base * jitter).min(30.0))
    }

    pub fn dispatch(&self, body: Value) {
        let webhook = self.clone();
        tokio::spawn(async move {
            webhook.deliver(&body).await;
        });
    }

    async fn deliver(&self, body: &Value) {
        for attempt in 0..self.max_attempts {
            tokio::time::sleep(self.delay_for_attempt(attempt)).await;
            match self
                .http_client
                .post(self.url.clone())
                .timeout(Duration::from_secs(10))
                .json(body)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => tracing::warn!(
                    status = response.status().as_u16(),
                    attempt = attempt + 1,
                    "Automation webhook rejected the event"
                ),
                Err(error) => tracing::warn!(
                    error = %error,
                    attempt = attempt + 1,
                    "Automation webhook request failed"
                ),
            }
        }
        tracing::error!(
            attempts = self.max_attempts,
            "Automation webhook gave up after retries"
        );
    }
}

#[cfg(test)]
pub mod recording {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingSink {
        pub audits: Mutex<Vec<AuditEntry>>,
        pub notifications: Mutex<Vec<BillingNotification>>,
    }

    impl RecordingSink {
        pub fn actions(&self) -> Vec<String> {
            self.audits
                .lock()
                .unwrap()
                .iter()
                .map(|entry| entry.action.clone())
                .collect()
        }

        pub fn notification_types(&self) -> Vec<String> {
            self.notifications
                .lock()
                .unwrap()
                .iter()
                .map(|notification| notification.event_type.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BillingEventSink for RecordingSink {
        async fn audit(&self, entry: AuditEntry) {
            self.audits.lock().unwrap().push(entry);
        }

        async fn notify(&self, notification: BillingNotification) {
            self.notifications.lock().unwrap().push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook() -> AutomationWebhook {
        let mut config = crate::config::test_config();
        config.automation_webhook_url = Some("https://hooks.example.com/autopay".to_string());
        config.automation_webhook_max_attempts = 4;
        AutomationWebhook::from_config(Client::new(), &config).unwrap()
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let webhook = webhook();
        assert_eq!(webhook.delay_for_attempt(0), Duration::ZERO);
        for attempt in 1..=3u32 {
            let base = 0.5 * 2f64.powi((attempt - 1) as i32);
            let delay = webhook.delay_for_attempt(attempt).as_secs_f64();
            assert!(delay >= base && delay <= base * 1.25, "attempt {attempt}: {delay}");
        }
        assert!(webhook.delay_for_attempt(30).as_secs_f64() <= 30.0);
    }

    #[test]
    fn missing_or_invalid_url_disables_the_webhook() {
        let mut config = crate::config::test_config();
        config.automation_webhook_url = None;
        assert!(AutomationWebhook::from_config(Client::new(), &config).is_none());
        config.automation_webhook_url = Some("not a url".to_string());
        assert!(AutomationWebhook::from_config(Client::new(), &config).is_none());
    }

    #[test]
    fn audit_entry_builder_fills_fields() {
        let entry = AuditEntry::new("autopay.charge_attempted", "payment_attempts", "pa-1")
            .organization("org-1")
            .actor(Some("user-1"))
            .after(json!({"status": "succeeded"}));
        assert_eq!(entry.organization_id.as_deref(), Some("org-1"));
        assert_eq!(entry.actor_user_id.as_deref(), Some("user-1"));
        assert_eq!(entry.after_state, Some(json!({"status": "succeeded"})));
    }
}
