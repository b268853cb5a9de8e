//! # Webhooks
//!
//! Ingestion service for payment-provider callbacks (M-Pesa, Paystack, MTN
//! MoMo, Airtel Money).
//!
//! A callback is acknowledged as soon as its raw body is captured. A tracked
//! background task then runs the provider's circuit breaker gate, signature
//! verification and normalization into a canonical [`PaymentEvent`], and
//! publishes it on the [`IdempotentBus`]. Bus subscribers fan the event out
//! to the WebSocket push channel and the durable event stream, whose
//! consumer groups drive notifications and the audit log.
//!
//! [`PaymentEvent`]: payment_contracts::PaymentEvent

pub mod bridges;
pub mod bus;
pub mod config;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod providers;
pub mod realtime;
pub mod recent;
pub mod redact;
pub mod routes;
pub mod shutdown;
pub mod verification;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use event_stream::{
    BusDeadLetters, DeadLetterSink, EventBus, EventStream, InMemoryDeadLetters, RetryConfig,
    StreamConfig, StreamError, SubscribeOptions,
};
use notifications_rs::{Channel, HttpProvider, LogProvider, NotificationDispatcher, NotificationProvider};
use payment_contracts::PaymentEventType;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::bridges::{
    AuditConsumer, MeteredDeadLetters, NotificationConsumer, PushBridge, StreamBridge, AUDIT_GROUP,
    NOTIFICATION_GROUP,
};
use crate::bus::{DedupConfig, IdempotentBus};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::middleware::metrics::{metrics_middleware, MetricsMiddlewareState};
use crate::middleware::tracing::trace_id_middleware;
use crate::pipeline::WebhookProcessor;
use crate::providers::ProviderRegistry;
use crate::realtime::{push_auth_middleware, ws_handler, PushAuth, PushConfig, PushHub};
use crate::recent::RecentRequests;
use crate::shutdown::InFlight;

/// Everything the HTTP layer and background tasks share
pub struct AppState {
    pub config: Config,
    pub metrics: Metrics,
    pub providers: Arc<ProviderRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub bus: Arc<IdempotentBus>,
    pub recent: Arc<RecentRequests>,
    pub processor: Arc<WebhookProcessor>,
    pub hub: Arc<PushHub>,
    pub stream: Arc<EventStream>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub inflight: InFlight,
}

fn http_provider(
    name: &str,
    url: Option<&String>,
    config: &Config,
) -> Option<Arc<dyn NotificationProvider>> {
    let url = url?;
    match HttpProvider::new(
        name,
        url.as_str(),
        config.notify_api_key.clone(),
        Duration::from_millis(config.notify_timeout_ms),
    ) {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            tracing::error!(provider = %name, error = %e, "Notification provider unavailable, using log provider");
            None
        }
    }
}

fn build_dispatcher(config: &Config, breakers: Arc<CircuitBreakerRegistry>) -> NotificationDispatcher {
    let or_log = |p: Option<Arc<dyn NotificationProvider>>, channel: Channel| {
        p.unwrap_or_else(|| Arc::new(LogProvider::new(channel)) as Arc<dyn NotificationProvider>)
    };

    let sms_primary = http_provider("sms-regional", config.notify_sms_primary_url.as_ref(), config);
    let sms_fallback = http_provider("sms-global", config.notify_sms_fallback_url.as_ref(), config);
    let email = http_provider("email", config.notify_email_url.as_ref(), config);
    let push = http_provider("push-gateway", config.notify_push_url.as_ref(), config);

    NotificationDispatcher::new(breakers, Duration::from_millis(config.notify_timeout_ms))
        .with_channel(Channel::Sms, or_log(sms_primary, Channel::Sms), sms_fallback)
        .with_channel(Channel::Email, or_log(email, Channel::Email), None)
        .with_channel(Channel::Push, or_log(push, Channel::Push), None)
}

impl AppState {
    /// Wire the service over `bus`. Must run inside a Tokio runtime.
    pub fn build(config: Config, bus: Arc<dyn EventBus>) -> Arc<Self> {
        let metrics = Metrics::new();

        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.breaker_failure_threshold,
            success_threshold: config.breaker_success_threshold,
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            ..CircuitBreakerConfig::default()
        }));

        let providers = Arc::new(ProviderRegistry::from_config(&config));
        let recent = Arc::new(RecentRequests::new(config.recent_requests_capacity));
        let idempotent_bus = Arc::new(IdempotentBus::new(DedupConfig {
            max_entries: config.dedup_max_entries,
            ttl: Duration::from_secs(config.dedup_ttl_secs),
        }));

        let sink: Arc<dyn DeadLetterSink> = if config.bus_type.eq_ignore_ascii_case("nats") {
            Arc::new(BusDeadLetters::new(bus.clone(), config.stream_subject_prefix.clone()))
        } else {
            Arc::new(InMemoryDeadLetters::new(1000))
        };
        let stream = Arc::new(EventStream::new(
            bus,
            StreamConfig {
                subject_prefix: config.stream_subject_prefix.clone(),
                retry: RetryConfig {
                    max_attempts: config.stream_max_attempts,
                    initial_backoff: Duration::from_millis(config.stream_initial_backoff_ms),
                    max_backoff: Duration::from_millis(config.stream_max_backoff_ms),
                },
                ..StreamConfig::default()
            },
            Arc::new(MeteredDeadLetters::new(sink, metrics.clone())),
        ));

        let hub = Arc::new(PushHub::new(
            PushConfig {
                max_connections_per_user: config.push_max_connections_per_user,
                messages_per_minute: config.push_messages_per_minute,
                outbound_buffer: config.push_outbound_buffer,
            },
            config.push_jwt_secret.as_deref().map(PushAuth::new),
        ));
        if hub.auth().is_none() {
            tracing::warn!("PUSH_JWT_SECRET not set, push channel disabled");
        }

        let dispatcher = Arc::new(build_dispatcher(&config, breakers.clone()));

        let push = Arc::new(PushBridge::new(hub.clone()));
        idempotent_bus.subscribe_all(push.clone());
        idempotent_bus.subscribe(PaymentEventType::WebhookError, push);
        idempotent_bus.subscribe_all(Arc::new(StreamBridge::new(stream.clone())));

        let processor = Arc::new(WebhookProcessor::new(
            providers.clone(),
            idempotent_bus.clone(),
            breakers.clone(),
            recent.clone(),
            metrics.clone(),
        ));

        Arc::new(Self {
            config,
            metrics,
            providers,
            breakers,
            bus: idempotent_bus,
            recent,
            processor,
            hub,
            stream,
            dispatcher,
            inflight: InFlight::new(),
        })
    }

    /// Join the notification and audit consumer groups on the event stream.
    pub async fn start_consumers(&self) -> Result<(), StreamError> {
        let payment_types: Vec<&str> = PaymentEventType::PAYMENT_EVENTS
            .iter()
            .map(|t| t.as_str())
            .collect();

        let notifications = NotificationConsumer::new(
            self.dispatcher.clone(),
            self.metrics.clone(),
            self.stream.config().retry.max_attempts,
        );
        self.stream
            .subscribe(
                NOTIFICATION_GROUP,
                &payment_types,
                Arc::new(notifications),
                SubscribeOptions::default(),
            )
            .await?;

        self.stream
            .subscribe(
                AUDIT_GROUP,
                &payment_types,
                Arc::new(AuditConsumer),
                SubscribeOptions::default(),
            )
            .await?;
        Ok(())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let metrics_mw_state = Arc::new(MetricsMiddlewareState {
        metrics: state.metrics.clone(),
    });

    let push_router = Router::new()
        .route("/ws", get(ws_handler))
        .route_layer(from_fn_with_state(state.hub.clone(), push_auth_middleware))
        .with_state(state.hub.clone());

    Router::new()
        .route("/webhooks/recent", get(routes::webhooks::recent_webhooks))
        .route("/webhooks/{provider}", post(routes::webhooks::receive_webhook))
        .route("/health", get(routes::health::health))
        .route("/metrics", get(routes::metrics::metrics))
        .route("/circuit-breaker/reset", post(routes::breaker::reset_breaker))
        .with_state(state)
        .merge(push_router)
        // request duration metrics
        .layer(from_fn_with_state(metrics_mw_state, metrics_middleware))
        .layer(from_fn(trace_id_middleware))
        .layer(TraceLayer::new_for_http())
}
