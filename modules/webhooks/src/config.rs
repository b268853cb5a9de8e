use payment_contracts::Provider;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    // Transport
    pub bus_type: String,
    pub nats_url: String,
    pub stream_subject_prefix: String,
    pub stream_max_attempts: u32,
    pub stream_initial_backoff_ms: u64,
    pub stream_max_backoff_ms: u64,

    // Provider secrets
    pub paystack_secret_key: Option<String>,
    pub airtel_webhook_secret: Option<String>,
    pub mtn_callback_token: Option<String>,
    pub mpesa_callback_token: Option<String>,
    /// Providers allowed to accept callbacks when no secret is configured
    pub allow_unsigned: Vec<Provider>,
    pub airtel_default_currency: String,

    // Circuit breaker
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_reset_timeout_ms: u64,

    // Dedup cache
    pub dedup_max_entries: usize,
    pub dedup_ttl_secs: u64,
    pub dedup_sweep_interval_secs: u64,

    pub recent_requests_capacity: usize,

    // Push channel
    pub push_jwt_secret: Option<String>,
    pub push_max_connections_per_user: usize,
    pub push_messages_per_minute: u32,
    pub push_outbound_buffer: usize,

    // Notifications
    pub notify_sms_primary_url: Option<String>,
    pub notify_sms_fallback_url: Option<String>,
    pub notify_email_url: Option<String>,
    pub notify_push_url: Option<String>,
    pub notify_api_key: Option<String>,
    pub notify_timeout_ms: u64,

    pub shutdown_grace_secs: u64,
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn flag(key: &str) -> bool {
    matches!(
        env::var(key).map(|v| v.to_lowercase()).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let allow_unsigned = Provider::ALL
            .into_iter()
            .filter(|p| flag(&format!("{}_ALLOW_UNSIGNED", p.as_str().to_uppercase())))
            .collect();

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT").unwrap_or_else(|_| "8090".to_string()).parse()?,

            bus_type: env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string()),
            nats_url: env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            stream_subject_prefix: env::var("STREAM_SUBJECT_PREFIX").unwrap_or_else(|_| "payments".to_string()),
            stream_max_attempts: env::var("STREAM_MAX_ATTEMPTS").unwrap_or_else(|_| "5".to_string()).parse()?,
            stream_initial_backoff_ms: env::var("STREAM_INITIAL_BACKOFF_MS").unwrap_or_else(|_| "200".to_string()).parse()?,
            stream_max_backoff_ms: env::var("STREAM_MAX_BACKOFF_MS").unwrap_or_else(|_| "30000".to_string()).parse()?,

            paystack_secret_key: optional("PAYSTACK_SECRET_KEY"),
            airtel_webhook_secret: optional("AIRTEL_WEBHOOK_SECRET"),
            mtn_callback_token: optional("MTN_CALLBACK_TOKEN"),
            mpesa_callback_token: optional("MPESA_CALLBACK_TOKEN"),
            allow_unsigned,
            airtel_default_currency: env::var("AIRTEL_DEFAULT_CURRENCY").unwrap_or_else(|_| "KES".to_string()),

            breaker_failure_threshold: env::var("BREAKER_FAILURE_THRESHOLD").unwrap_or_else(|_| "5".to_string()).parse()?,
            breaker_success_threshold: env::var("BREAKER_SUCCESS_THRESHOLD").unwrap_or_else(|_| "3".to_string()).parse()?,
            breaker_reset_timeout_ms: env::var("BREAKER_RESET_TIMEOUT_MS").unwrap_or_else(|_| "30000".to_string()).parse()?,

            dedup_max_entries: env::var("DEDUP_MAX_ENTRIES").unwrap_or_else(|_| "10000".to_string()).parse()?,
            dedup_ttl_secs: env::var("DEDUP_TTL_SECS").unwrap_or_else(|_| "86400".to_string()).parse()?,
            dedup_sweep_interval_secs: env::var("DEDUP_SWEEP_INTERVAL_SECS").unwrap_or_else(|_| "60".to_string()).parse()?,

            recent_requests_capacity: env::var("RECENT_REQUESTS_CAPACITY").unwrap_or_else(|_| "200".to_string()).parse()?,

            push_jwt_secret: optional("PUSH_JWT_SECRET"),
            push_max_connections_per_user: env::var("PUSH_MAX_CONNECTIONS_PER_USER").unwrap_or_else(|_| "5".to_string()).parse()?,
            push_messages_per_minute: env::var("PUSH_MESSAGES_PER_MINUTE").unwrap_or_else(|_| "60".to_string()).parse()?,
            push_outbound_buffer: env::var("PUSH_OUTBOUND_BUFFER").unwrap_or_else(|_| "256".to_string()).parse()?,

            notify_sms_primary_url: optional("NOTIFY_SMS_PRIMARY_URL"),
            notify_sms_fallback_url: optional("NOTIFY_SMS_FALLBACK_URL"),
            notify_email_url: optional("NOTIFY_EMAIL_URL"),
            notify_push_url: optional("NOTIFY_PUSH_URL"),
            notify_api_key: optional("NOTIFY_API_KEY"),
            notify_timeout_ms: env::var("NOTIFY_TIMEOUT_MS").unwrap_or_else(|_| "5000".to_string()).parse()?,

            shutdown_grace_secs: env::var("SHUTDOWN_GRACE_SECS").unwrap_or_else(|_| "10".to_string()).parse()?,
        })
    }

    /// Secret or token checked by `provider`'s verifier
    pub fn secret_for(&self, provider: Provider) -> Option<String> {
        match provider {
            Provider::Mpesa => self.mpesa_callback_token.clone(),
            Provider::Paystack => self.paystack_secret_key.clone(),
            Provider::Mtn => self.mtn_callback_token.clone(),
            Provider::Airtel => self.airtel_webhook_secret.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for Config {
    /// Local development defaults; no secrets configured.
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            bus_type: "inmemory".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            stream_subject_prefix: "payments".to_string(),
            stream_max_attempts: 5,
            stream_initial_backoff_ms: 200,
            stream_max_backoff_ms: 30_000,
            paystack_secret_key: None,
            airtel_webhook_secret: None,
            mtn_callback_token: None,
            mpesa_callback_token: None,
            allow_unsigned: Vec::new(),
            airtel_default_currency: "KES".to_string(),
            breaker_failure_threshold: 5,
            breaker_success_threshold: 3,
            breaker_reset_timeout_ms: 30_000,
            dedup_max_entries: 10_000,
            dedup_ttl_secs: 86_400,
            dedup_sweep_interval_secs: 60,
            recent_requests_capacity: 200,
            push_jwt_secret: None,
            push_max_connections_per_user: 5,
            push_messages_per_minute: 60,
            push_outbound_buffer: 256,
            notify_sms_primary_url: None,
            notify_sms_fallback_url: None,
            notify_email_url: None,
            notify_push_url: None,
            notify_api_key: None,
            notify_timeout_ms: 5000,
            shutdown_grace_secs: 10,
        }
    }
}
