use std::env;

use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Disabled,
    InProcess,
}

impl SchedulerMode {
    fn from_env(value: Option<String>) -> Self {
        match value
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "in_process" | "in-process" | "internal" => Self::InProcess,
            _ => Self::Disabled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::InProcess => "in_process",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub dev_auth_overrides_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub request_timeout_seconds: u64,
    pub supabase_jwt_secret: Option<String>,
    pub supabase_db_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub org_membership_cache_ttl_seconds: u64,
    pub org_membership_cache_max_entries: u64,
    pub internal_api_key: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_api_base: String,
    pub stripe_timeout_seconds: u64,
    pub stripe_webhook_tolerance_seconds: i64,
    pub autopay: AutopaySettings,
    pub scheduler_mode: SchedulerMode,
    pub automation_webhook_url: Option<String>,
    pub automation_webhook_max_attempts: u32,
}

/// Tunables for the runner and the on-demand command.
#[derive(Debug, Clone)]
pub struct AutopaySettings {
    pub max_attempts_per_period: i32,
    pub default_batch_size: i64,
    pub max_batch_size: i64,
    pub max_reported_failures: usize,
    pub default_timezone: Tz,
    pub daily_run_hour_utc: u32,
    pub admin_roles: Vec<String>,
}

impl Default for AutopaySettings {
    fn default() -> Self {
        Self {
            max_attempts_per_period: 3,
            default_batch_size: 500,
            max_batch_size: 5000,
            max_reported_failures: 50,
            default_timezone: chrono_tz::UTC,
            daily_run_hour_utc: 13,
            admin_roles: vec!["owner_admin".to_string()],
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = AutopaySettings::default();
        Self {
            app_name: env_or("APP_NAME", "Casaora Autopay"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: parse_csv(&env_or("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            request_timeout_seconds: env_parse_or("REQUEST_TIMEOUT_SECONDS", 30),
            supabase_jwt_secret: env_opt("SUPABASE_JWT_SECRET"),
            supabase_db_url: env_opt("SUPABASE_DB_URL").or_else(|| env_opt("DATABASE_URL")),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            org_membership_cache_ttl_seconds: env_parse_or("ORG_MEMBERSHIP_CACHE_TTL_SECONDS", 30),
            org_membership_cache_max_entries: env_parse_or(
                "ORG_MEMBERSHIP_CACHE_MAX_ENTRIES",
                10000,
            ),
            internal_api_key: env_opt("INTERNAL_API_KEY"),
            stripe_secret_key: env_opt("STRIPE_SECRET_KEY"),
            stripe_webhook_secret: env_opt("STRIPE_WEBHOOK_SECRET"),
            stripe_api_base: env_or("STRIPE_API_BASE", "https://api.stripe.com"),
            stripe_timeout_seconds: env_parse_or("STRIPE_TIMEOUT_SECONDS", 20),
            stripe_webhook_tolerance_seconds: env_parse_or("STRIPE_WEBHOOK_TOLERANCE_SECONDS", 300),
            autopay: AutopaySettings {
                max_attempts_per_period: env_parse_or(
                    "AUTOPAY_MAX_ATTEMPTS_PER_PERIOD",
                    defaults.max_attempts_per_period,
                )
                .max(1),
                default_batch_size: env_parse_or(
                    "AUTOPAY_DEFAULT_BATCH_SIZE",
                    defaults.default_batch_size,
                ),
                max_batch_size: env_parse_or("AUTOPAY_MAX_BATCH_SIZE", defaults.max_batch_size),
                max_reported_failures: env_parse_or(
                    "AUTOPAY_MAX_REPORTED_FAILURES",
                    defaults.max_reported_failures,
                ),
                default_timezone: env_opt("AUTOPAY_DEFAULT_TIMEZONE")
                    .and_then(|name| name.parse::<Tz>().ok())
                    .unwrap_or(defaults.default_timezone),
                daily_run_hour_utc: env_parse_or(
                    "AUTOPAY_DAILY_RUN_HOUR_UTC",
                    defaults.daily_run_hour_utc,
                )
                .min(23),
                admin_roles: {
                    let roles = parse_csv(&env_or("AUTOPAY_ADMIN_ROLES", "owner_admin"));
                    if roles.is_empty() {
                        defaults.admin_roles
                    } else {
                        roles
                    }
                },
            },
            scheduler_mode: SchedulerMode::from_env(env_opt("AUTOPAY_SCHEDULER_MODE")),
            automation_webhook_url: env_opt("AUTOMATION_WEBHOOK_URL")
                .filter(|raw| url::Url::parse(raw).is_ok()),
            automation_webhook_max_attempts: env_parse_or("AUTOMATION_WEBHOOK_MAX_ATTEMPTS", 4),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }

    pub fn scheduler_enabled(&self) -> bool {
        self.scheduler_mode == SchedulerMode::InProcess
    }

    /// Clamp a caller-supplied batch size into the configured window.
    pub fn autopay_batch_size(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.autopay.default_batch_size)
            .clamp(1, self.autopay.max_batch_size.max(1))
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        app_name: "Casaora Autopay".to_string(),
        environment: "test".to_string(),
        api_prefix: "/v1".to_string(),
        host: "127.0.0.1".to_string(),
        port: 8000,
        cors_origins: vec!["*".to_string()],
        trusted_hosts: vec!["localhost".to_string()],
        dev_auth_overrides_enabled: true,
        rate_limit_per_second: 10,
        rate_limit_burst_size: 100,
        request_timeout_seconds: 30,
        supabase_jwt_secret: Some("test-jwt-secret".to_string()),
        supabase_db_url: None,
        db_pool_max_connections: 1,
        db_pool_min_connections: 0,
        db_pool_acquire_timeout_seconds: 1,
        db_pool_idle_timeout_seconds: 60,
        org_membership_cache_ttl_seconds: 30,
        org_membership_cache_max_entries: 100,
        internal_api_key: Some("internal-key".to_string()),
        stripe_secret_key: Some("sk_test_123".to_string()),
        stripe_webhook_secret: Some("whsec_test".to_string()),
        stripe_api_base: "https://api.stripe.com".to_string(),
        stripe_timeout_seconds: 5,
        stripe_webhook_tolerance_seconds: 300,
        autopay: AutopaySettings::default(),
        scheduler_mode: SchedulerMode::Disabled,
        automation_webhook_url: None,
        automation_webhook_max_attempts: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, parse_csv, test_config, SchedulerMode};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }

    #[test]
    fn parses_csv_skipping_blanks() {
        assert_eq!(parse_csv("owner_admin, ,accountant"), vec!["owner_admin", "accountant"]);
        assert!(parse_csv(" , ").is_empty());
    }

    #[test]
    fn scheduler_mode_defaults_to_disabled() {
        assert_eq!(SchedulerMode::from_env(None), SchedulerMode::Disabled);
        assert_eq!(
            SchedulerMode::from_env(Some(" In_Process ".to_string())),
            SchedulerMode::InProcess
        );
        assert_eq!(
            SchedulerMode::from_env(Some("cron".to_string())),
            SchedulerMode::Disabled
        );
    }

    #[test]
    fn clamps_batch_size() {
        let config = test_config();
        assert_eq!(config.autopay_batch_size(None), 500);
        assert_eq!(config.autopay_batch_size(Some(0)), 1);
        assert_eq!(config.autopay_batch_size(Some(99_999)), 5000);
    }
}
