//! Post-acknowledgement processing of one provider callback.
//!
//! Order: record → breaker gate → verify → normalize → publish. Every
//! outcome is counted in `webhook_outcomes_total` and rejected callbacks are
//! reported as `webhook.error`.

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use circuit_breaker::CircuitBreakerRegistry;
use payment_contracts::{PaymentEvent, Provider, WebhookEvent};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{IdempotentBus, PublishOutcome};
use crate::metrics::Metrics;
use crate::providers::{NormalizationError, ProviderRegistry};
use crate::recent::RecentRequests;
use crate::redact::redact;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("verification failed: {0}")]
    Verification(String),

    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("circuit open for provider {0}")]
    CircuitOpen(Provider),

    #[error("provider not registered: {0}")]
    UnknownProvider(Provider),
}

impl IngestError {
    /// Label for `webhook_outcomes_total`
    pub fn outcome(&self) -> &'static str {
        match self {
            IngestError::Verification(_) | IngestError::UnknownProvider(_) => "verification_failed",
            IngestError::Normalization(_) => "normalization_failed",
            IngestError::CircuitOpen(_) => "circuit_open",
        }
    }
}

/// Raw callback captured before the acknowledgement
#[derive(Debug, Clone)]
pub struct InboundWebhook {
    pub provider: Provider,
    pub body: Bytes,
    pub signature: Option<String>,
    pub request_id: String,
    pub received_at: DateTime<Utc>,
}

pub struct WebhookProcessor {
    providers: Arc<ProviderRegistry>,
    bus: Arc<IdempotentBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    recent: Arc<RecentRequests>,
    metrics: Metrics,
}

impl WebhookProcessor {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        bus: Arc<IdempotentBus>,
        breakers: Arc<CircuitBreakerRegistry>,
        recent: Arc<RecentRequests>,
        metrics: Metrics,
    ) -> Self {
        Self {
            providers,
            bus,
            breakers,
            recent,
            metrics,
        }
    }

    pub async fn process(&self, inbound: InboundWebhook) -> Result<PublishOutcome, IngestError> {
        let provider = inbound.provider;
        self.metrics
            .webhook_requests_total
            .with_label_values(&[provider.as_str()])
            .inc();

        let result = self.run(&inbound).await;

        let outcome = match &result {
            Ok(PublishOutcome::Delivered { .. }) => "published",
            Ok(PublishOutcome::Duplicate) => "duplicate",
            Err(e) => e.outcome(),
        };
        self.metrics
            .webhook_outcomes_total
            .with_label_values(&[provider.as_str(), outcome])
            .inc();

        match &result {
            Ok(_) => info!(
                provider = %provider,
                request_id = %inbound.request_id,
                outcome,
                "Webhook processed"
            ),
            Err(e) => warn!(
                provider = %provider,
                request_id = %inbound.request_id,
                outcome,
                error = %e,
                "Webhook rejected"
            ),
        }
        result
    }

    async fn run(&self, inbound: &InboundWebhook) -> Result<PublishOutcome, IngestError> {
        let provider = inbound.provider;
        let adapter = self
            .providers
            .get(provider)
            .ok_or(IngestError::UnknownProvider(provider))?;

        let raw: Value = serde_json::from_slice(&inbound.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&inbound.body).into_owned()));
        let redacted = redact(&raw);

        self.recent.record(WebhookEvent {
            id: Uuid::new_v4(),
            provider: provider.to_string(),
            event_type: adapter.describe(&raw),
            payload: redacted.clone(),
            received_at: inbound.received_at,
            signature: inbound.signature.clone(),
        });

        self.bus
            .publish(PaymentEvent::webhook_received(
                provider,
                inbound.received_at,
                inbound.request_id.as_str(),
            ))
            .await;

        let breaker = self.breakers.get(provider.as_str());
        if !breaker.can_execute() {
            return Err(IngestError::CircuitOpen(provider));
        }

        debug!(
            provider = %provider,
            request_id = %inbound.request_id,
            payload = %redacted,
            "Verifying webhook"
        );

        let verification = self
            .providers
            .verify(provider, &inbound.body, inbound.signature.as_deref());
        if !verification.valid {
            breaker.record_failure();
            let err = IngestError::Verification(
                verification
                    .reason
                    .unwrap_or_else(|| "invalid signature".to_string()),
            );
            self.report_error(inbound, redacted, &err).await;
            return Err(err);
        }
        if verification.accepted_unsigned {
            warn!(
                provider = %provider,
                request_id = %inbound.request_id,
                reason = verification.reason.as_deref().unwrap_or_default(),
                "Accepted unsigned webhook"
            );
        }

        let canonical = match adapter.normalize(&inbound.body) {
            Ok(c) => c,
            Err(e) => {
                breaker.record_failure();
                let err = IngestError::from(e);
                self.report_error(inbound, redacted, &err).await;
                return Err(err);
            }
        };
        breaker.record_success();

        let event = PaymentEvent::from_canonical(
            canonical,
            redacted,
            inbound.received_at,
            inbound.request_id.as_str(),
        );
        Ok(self.bus.publish(event).await)
    }

    async fn report_error(&self, inbound: &InboundWebhook, redacted: Value, err: &IngestError) {
        self.bus
            .publish(PaymentEvent::webhook_error(
                inbound.provider,
                redacted,
                inbound.received_at,
                inbound.request_id.as_str(),
                err.to_string(),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DedupConfig, EventSubscriber, SubscriberError};
    use crate::providers::test_support::paystack_signature;
    use crate::providers::{MpesaAdapter, PaystackAdapter};
    use crate::verification::MissingSecretPolicy;
    use async_trait::async_trait;
    use circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use payment_contracts::PaymentEventType;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Captured(Mutex<Vec<PaymentEventType>>);

    #[async_trait]
    impl EventSubscriber for Captured {
        fn name(&self) -> &str {
            "captured"
        }

        async fn handle(&self, event: Arc<PaymentEvent>) -> Result<(), SubscriberError> {
            self.0.lock().unwrap().push(event.event_type);
            Ok(())
        }
    }

    fn processor() -> (WebhookProcessor, Arc<Captured>, Arc<CircuitBreakerRegistry>, Metrics) {
        let providers = ProviderRegistry::new()
            .register(
                Arc::new(PaystackAdapter),
                Some("sk_test".to_string()),
                MissingSecretPolicy::Reject,
            )
            .register(Arc::new(MpesaAdapter), None, MissingSecretPolicy::Reject);
        let bus = Arc::new(IdempotentBus::new(DedupConfig::default()));
        let captured = Arc::new(Captured::default());
        for t in PaymentEventType::ALL {
            bus.subscribe(t, captured.clone());
        }
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }));
        let metrics = Metrics::new();
        let p = WebhookProcessor::new(
            Arc::new(providers),
            bus,
            breakers.clone(),
            Arc::new(RecentRequests::new(10)),
            metrics.clone(),
        );
        (p, captured, breakers, metrics)
    }

    fn inbound(provider: Provider, body: &[u8], signature: Option<String>) -> InboundWebhook {
        InboundWebhook {
            provider,
            body: Bytes::copy_from_slice(body),
            signature,
            request_id: "req-1".to_string(),
            received_at: Utc::now(),
        }
    }

    const CHARGE: &[u8] =
        br#"{"event":"charge.success","data":{"reference":"ref-1","amount":5000,"currency":"NGN"}}"#;

    #[tokio::test]
    async fn test_signed_charge_is_published() {
        let (p, captured, _, _) = processor();
        let sig = paystack_signature(CHARGE, "sk_test");
        let outcome = p.process(inbound(Provider::Paystack, CHARGE, Some(sig))).await.unwrap();

        assert!(matches!(outcome, PublishOutcome::Delivered { .. }));
        assert_eq!(
            *captured.0.lock().unwrap(),
            vec![PaymentEventType::WebhookReceived, PaymentEventType::PaymentSuccess]
        );
    }

    #[tokio::test]
    async fn test_bad_signature_emits_error_and_counts_failure() {
        let (p, captured, breakers, metrics) = processor();
        let err = p
            .process(inbound(Provider::Paystack, CHARGE, Some("00".repeat(64))))
            .await
            .unwrap_err();

        assert_eq!(err.outcome(), "verification_failed");
        assert!(captured.0.lock().unwrap().contains(&PaymentEventType::WebhookError));
        assert_eq!(breakers.get("paystack").snapshot().consecutive_failures, 1);
        assert_eq!(
            metrics
                .webhook_outcomes_total
                .with_label_values(&["paystack", "verification_failed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_open_breaker_skips_verification() {
        let (p, captured, breakers, _) = processor();
        for _ in 0..2 {
            let _ = p.process(inbound(Provider::Mpesa, b"{}", None)).await;
        }
        assert_eq!(breakers.get("mpesa").state(), CircuitState::Open);
        captured.0.lock().unwrap().clear();

        let err = p.process(inbound(Provider::Mpesa, b"{}", None)).await.unwrap_err();
        assert!(matches!(err, IngestError::CircuitOpen(Provider::Mpesa)));
        // Only the receipt; no webhook.error since nothing was verified
        assert_eq!(
            *captured.0.lock().unwrap(),
            vec![PaymentEventType::WebhookReceived]
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_duplicate() {
        let (p, _, _, _) = processor();
        let sig = paystack_signature(CHARGE, "sk_test");
        p.process(inbound(Provider::Paystack, CHARGE, Some(sig.clone()))).await.unwrap();
        let second = p.process(inbound(Provider::Paystack, CHARGE, Some(sig))).await.unwrap();
        assert_eq!(second, PublishOutcome::Duplicate);
    }
}
