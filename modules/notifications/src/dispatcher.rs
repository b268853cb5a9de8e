use circuit_breaker::CircuitBreakerRegistry;
use futures::future::join_all;
use payment_contracts::{EventPriority, PaymentEvent, PaymentEventType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{select_channels, Channel, Notification, NotificationProvider, NotifyError, Recipient};

struct ChannelRoute {
    primary: Arc<dyn NotificationProvider>,
    fallback: Option<Arc<dyn NotificationProvider>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAttempt {
    pub provider: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome for one channel; `provider` is the one that delivered, or the
/// last one tried.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResult {
    pub channel: Channel,
    pub success: bool,
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recipient_count: usize,
    pub attempts: Vec<ProviderAttempt>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub event_type: PaymentEventType,
    pub priority: EventPriority,
    pub transaction_id: Option<Uuid>,
    pub results: Vec<ChannelResult>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }
}

/// Channel routing plus per-provider circuit breakers (`notify:<provider>`)
pub struct NotificationDispatcher {
    routes: HashMap<Channel, ChannelRoute>,
    breakers: Arc<CircuitBreakerRegistry>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, timeout: Duration) -> Self {
        Self {
            routes: HashMap::new(),
            breakers,
            timeout,
        }
    }

    pub fn with_channel(
        mut self,
        channel: Channel,
        primary: Arc<dyn NotificationProvider>,
        fallback: Option<Arc<dyn NotificationProvider>>,
    ) -> Self {
        self.routes.insert(channel, ChannelRoute { primary, fallback });
        self
    }

    pub fn breaker_name(provider: &str) -> String {
        format!("notify:{provider}")
    }

    /// Send `event` on every selected channel. Never fails as a whole.
    pub async fn dispatch(&self, event: &PaymentEvent) -> DispatchReport {
        self.dispatch_except(event, &[]).await
    }

    /// Like [`dispatch`](Self::dispatch), skipping channels already delivered
    /// by an earlier attempt.
    pub async fn dispatch_except(&self, event: &PaymentEvent, delivered: &[Channel]) -> DispatchReport {
        let priority = event.event_type.priority();
        let mut report = DispatchReport {
            event_type: event.event_type,
            priority,
            transaction_id: event.transaction.as_ref().map(|t| t.id),
            results: Vec::new(),
        };

        let Some(recipient) = Recipient::from_event(event) else {
            debug!(event_type = %event.event_type, "No recipient for event, skipping notifications");
            return report;
        };

        let channels = select_channels(priority, &recipient);
        let sends = channels
            .into_iter()
            .filter(|c| !delivered.contains(c))
            .map(|channel| self.send_channel(event, channel, &recipient));
        report.results = join_all(sends).await;

        info!(
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            channels = report.results.len(),
            failed = report.results.iter().filter(|r| !r.success).count(),
            "Notification dispatch finished"
        );
        report
    }

    async fn send_channel(
        &self,
        event: &PaymentEvent,
        channel: Channel,
        recipient: &Recipient,
    ) -> ChannelResult {
        let notification = Notification::render(event, channel, recipient);
        let mut result = ChannelResult {
            channel,
            success: false,
            provider: None,
            error: None,
            recipient_count: notification.to.len(),
            attempts: Vec::new(),
        };

        let Some(route) = self.routes.get(&channel) else {
            result.error = Some(NotifyError::NoProvider(channel).to_string());
            return result;
        };

        let providers = std::iter::once(&route.primary).chain(route.fallback.iter());
        for provider in providers {
            let outcome = self.attempt(provider.as_ref(), &notification).await;
            result.provider = Some(provider.name().to_string());
            match outcome {
                Ok(()) => {
                    result.success = true;
                    result.error = None;
                    result.attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        success: true,
                        error: None,
                    });
                    break;
                }
                Err(e) => {
                    warn!(
                        channel = %channel,
                        provider = %provider.name(),
                        error = %e,
                        "Notification provider failed"
                    );
                    result.error = Some(e.to_string());
                    result.attempts.push(ProviderAttempt {
                        provider: provider.name().to_string(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        result
    }

    async fn attempt(
        &self,
        provider: &dyn NotificationProvider,
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        let breaker = self.breakers.get(&Self::breaker_name(provider.name()));
        if !breaker.can_execute() {
            return Err(NotifyError::CircuitOpen(breaker.name().to_string()));
        }

        let outcome = match tokio::time::timeout(self.timeout, provider.send(notification)).await {
            Ok(r) => r,
            Err(_) => Err(NotifyError::Timeout),
        };

        match &outcome {
            Ok(()) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use payment_contracts::{
        CanonicalEvent, Customer, Money, PhoneNumber, Provider, Transaction, TransactionKind,
        TransactionStatus,
    };
    use serde_json::json;
    use std::sync::Mutex;

    struct Fake {
        name: &'static str,
        fail: bool,
        delay: Option<Duration>,
        sent: Mutex<Vec<Notification>>,
    }

    impl Fake {
        fn ok(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, fail: false, delay: None, sent: Mutex::new(Vec::new()) })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self { name, fail: true, delay: None, sent: Mutex::new(Vec::new()) })
        }

        fn slow(name: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self { name, fail: false, delay: Some(delay), sent: Mutex::new(Vec::new()) })
        }

        fn sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationProvider for Fake {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if self.fail {
                return Err(NotifyError::Rejected(502));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn failed_event() -> PaymentEvent {
        let mut tx = Transaction::new(
            Provider::Mpesa,
            "ws_CO_42",
            TransactionKind::Payment,
            Money::from_minor(150_000, "KES").unwrap(),
            Utc::now(),
        )
        .with_customer(Customer {
            name: Some("Jane".to_string()),
            email: Some("jane@example.com".to_string()),
            phone: Some(PhoneNumber::parse("254712345678", None).unwrap()),
        })
        .with_metadata("pushTokens", json!(["device-1", "device-2"]));
        tx.fail("insufficient funds", Utc::now()).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Failed);
        PaymentEvent::from_canonical(CanonicalEvent::from_transaction(tx), json!({}), Utc::now(), "req-7")
    }

    fn registry() -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::default())
    }

    #[tokio::test]
    async fn test_sms_falls_back_to_secondary() {
        let regional = Fake::failing("regional-sms");
        let global = Fake::ok("global-sms");
        let push = Fake::ok("fcm");
        let email = Fake::ok("smtp");

        let dispatcher = NotificationDispatcher::new(registry(), Duration::from_secs(1))
            .with_channel(Channel::Sms, regional.clone(), Some(global.clone()))
            .with_channel(Channel::Push, push.clone(), None)
            .with_channel(Channel::Email, email.clone(), None);

        let report = dispatcher.dispatch(&failed_event()).await;

        assert_eq!(report.priority, EventPriority::High);
        assert_eq!(report.results.len(), 3);
        assert!(report.all_succeeded());

        let sms = report.results.iter().find(|r| r.channel == Channel::Sms).unwrap();
        assert_eq!(sms.provider.as_deref(), Some("global-sms"));
        assert_eq!(sms.attempts.len(), 2);
        assert!(!sms.attempts[0].success);
        assert_eq!(sms.recipient_count, 1);

        let push_result = report.results.iter().find(|r| r.channel == Channel::Push).unwrap();
        assert_eq!(push_result.recipient_count, 2);
        assert_eq!(global.sent(), 1);
        assert!(email.sent.lock().unwrap()[0].body.contains("insufficient funds"));
    }

    #[tokio::test]
    async fn test_channel_failure_is_isolated() {
        let dispatcher = NotificationDispatcher::new(registry(), Duration::from_secs(1))
            .with_channel(Channel::Email, Fake::failing("smtp"), None)
            .with_channel(Channel::Push, Fake::ok("fcm"), None);

        let report = dispatcher.dispatch(&failed_event()).await;

        let email = report.results.iter().find(|r| r.channel == Channel::Email).unwrap();
        assert!(!email.success);
        assert_eq!(email.provider.as_deref(), Some("smtp"));
        assert!(email.error.as_deref().unwrap().contains("502"));

        let push = report.results.iter().find(|r| r.channel == Channel::Push).unwrap();
        assert!(push.success);

        let sms = report.results.iter().find(|r| r.channel == Channel::Sms).unwrap();
        assert!(!sms.success);
        assert!(sms.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let dispatcher = NotificationDispatcher::new(registry(), Duration::from_millis(50))
            .with_channel(Channel::Email, Fake::slow("smtp", Duration::from_secs(5)), None);

        let report = dispatcher.dispatch(&failed_event()).await;
        let email = report.results.iter().find(|r| r.channel == Channel::Email).unwrap();
        assert_eq!(email.error, Some(NotifyError::Timeout.to_string()));
    }

    #[tokio::test]
    async fn test_open_breaker_skips_provider() {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }));
        let flaky = Fake::failing("smtp");
        let dispatcher = NotificationDispatcher::new(breakers.clone(), Duration::from_secs(1))
            .with_channel(Channel::Email, flaky.clone(), None);

        dispatcher.dispatch(&failed_event()).await;
        assert_eq!(breakers.get("notify:smtp").state(), CircuitState::Open);

        let report = dispatcher.dispatch(&failed_event()).await;
        let email = report.results.iter().find(|r| r.channel == Channel::Email).unwrap();
        assert_eq!(
            email.error,
            Some(NotifyError::CircuitOpen("notify:smtp".to_string()).to_string())
        );
    }

    #[tokio::test]
    async fn test_success_event_skips_sms() {
        let sms = Fake::ok("sms");
        let dispatcher = NotificationDispatcher::new(registry(), Duration::from_secs(1))
            .with_channel(Channel::Sms, sms.clone(), None);

        let mut event = failed_event();
        event.event_type = PaymentEventType::PaymentSuccess;
        let report = dispatcher.dispatch(&event).await;

        assert!(report.results.iter().all(|r| r.channel != Channel::Sms));
        assert_eq!(sms.sent(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_except_skips_delivered_channels() {
        let push = Fake::ok("fcm");
        let email = Fake::ok("smtp");
        let dispatcher = NotificationDispatcher::new(registry(), Duration::from_secs(1))
            .with_channel(Channel::Push, push.clone(), None)
            .with_channel(Channel::Email, email.clone(), None);

        let report = dispatcher
            .dispatch_except(&failed_event(), &[Channel::Push])
            .await;

        assert!(report.results.iter().all(|r| r.channel != Channel::Push));
        assert_eq!(push.sent(), 0);
        assert_eq!(email.sent(), 1);
    }
}
