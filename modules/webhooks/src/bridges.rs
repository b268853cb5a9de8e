//! Subscribers connecting the idempotent bus to the delivery paths (push
//! channel and durable stream), and the consumer groups reading the stream.

use async_trait::async_trait;
use dashmap::DashMap;
use event_stream::{
    BusResult, DeadLetter, DeadLetterSink, EventStream, HandlerError, StreamEnvelope, StreamHandler,
};
use notifications_rs::{Channel, DispatchReport, NotificationDispatcher};
use payment_contracts::PaymentEvent;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventSubscriber, SubscriberError};
use crate::metrics::Metrics;
use crate::realtime::PushHub;

/// Broadcasts bus events to push-channel rooms
pub struct PushBridge {
    hub: Arc<PushHub>,
}

impl PushBridge {
    pub fn new(hub: Arc<PushHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventSubscriber for PushBridge {
    fn name(&self) -> &str {
        "push"
    }

    async fn handle(&self, event: Arc<PaymentEvent>) -> Result<(), SubscriberError> {
        let delivered = self.hub.broadcast(&event);
        debug!(event_type = %event.event_type, delivered, "Event broadcast to push channel");
        Ok(())
    }
}

/// Forwards bus events into the durable stream without waiting on the transport
pub struct StreamBridge {
    stream: Arc<EventStream>,
}

impl StreamBridge {
    pub fn new(stream: Arc<EventStream>) -> Self {
        Self { stream }
    }

    pub fn envelope(event: &PaymentEvent) -> Result<StreamEnvelope, SubscriberError> {
        // Ordering scope is the provider's transaction id
        let partition_key = event
            .transaction
            .as_ref()
            .map(|t| t.provider_transaction_id.clone())
            .unwrap_or_else(|| event.correlation_id.clone());

        Ok(
            StreamEnvelope::new(event.event_type.as_str(), partition_key, serde_json::to_value(event)?)
                .with_tenant_id(event.tenant_id().map(str::to_string))
                .with_correlation_id(Some(event.correlation_id.clone())),
        )
    }
}

#[async_trait]
impl EventSubscriber for StreamBridge {
    fn name(&self) -> &str {
        "stream"
    }

    async fn handle(&self, event: Arc<PaymentEvent>) -> Result<(), SubscriberError> {
        self.stream.publish(Self::envelope(&event)?)?;
        Ok(())
    }
}

pub const NOTIFICATION_GROUP: &str = "payments-notifications";

#[derive(Default)]
struct Progress {
    delivered: Vec<Channel>,
    attempts: u32,
}

/// Consumer group sending notifications for payment events
///
/// A delivery with any failed channel is returned as an error, so the
/// stream retries it with backoff and dead-letters it once `max_attempts`
/// is reached. Channels that already went out are not re-sent on retry.
pub struct NotificationConsumer {
    dispatcher: Arc<NotificationDispatcher>,
    metrics: Metrics,
    max_attempts: u32,
    progress: DashMap<Uuid, Progress>,
}

impl NotificationConsumer {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, metrics: Metrics, max_attempts: u32) -> Self {
        Self {
            dispatcher,
            metrics,
            max_attempts: max_attempts.max(1),
            progress: DashMap::new(),
        }
    }

    fn count(&self, report: &DispatchReport) {
        for result in &report.results {
            for attempt in &result.attempts {
                let outcome = if attempt.success { "success" } else { "failure" };
                self.metrics
                    .notification_results_total
                    .with_label_values(&[result.channel.as_str(), attempt.provider.as_str(), outcome])
                    .inc();
            }
        }
    }

    /// Envelopes with a retry in flight
    pub fn pending(&self) -> usize {
        self.progress.len()
    }
}

#[async_trait]
impl StreamHandler for NotificationConsumer {
    async fn handle(&self, envelope: &StreamEnvelope) -> Result<(), HandlerError> {
        let event: PaymentEvent = serde_json::from_value(envelope.payload.clone())?;
        let delivered = self
            .progress
            .get(&envelope.event_id)
            .map(|p| p.delivered.clone())
            .unwrap_or_default();

        let report = self.dispatcher.dispatch_except(&event, &delivered).await;
        self.count(&report);

        let failed: Vec<&str> = report
            .results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.channel.as_str())
            .collect();
        if failed.is_empty() {
            self.progress.remove(&envelope.event_id);
            return Ok(());
        }

        let exhausted = {
            let mut progress = self.progress.entry(envelope.event_id).or_default();
            progress
                .delivered
                .extend(report.results.iter().filter(|r| r.success).map(|r| r.channel));
            progress.attempts += 1;
            progress.attempts >= self.max_attempts
        };
        if exhausted {
            self.progress.remove(&envelope.event_id);
        }

        Err(format!("notification failed on {}", failed.join(", ")).into())
    }
}

/// Counts dead letters per group before handing them to the real sink
pub struct MeteredDeadLetters {
    inner: Arc<dyn DeadLetterSink>,
    metrics: Metrics,
}

impl MeteredDeadLetters {
    pub fn new(inner: Arc<dyn DeadLetterSink>, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl DeadLetterSink for MeteredDeadLetters {
    async fn record(&self, letter: DeadLetter) -> BusResult<()> {
        self.metrics
            .stream_dead_letters_total
            .with_label_values(&[letter.group.as_str()])
            .inc();
        warn!(
            group = %letter.group,
            event_type = %letter.envelope.event_type,
            attempts = letter.attempts,
            error = %letter.error,
            "Envelope dead-lettered"
        );
        self.inner.record(letter).await
    }
}

/// Consumer group that writes every payment event to the structured log
pub struct AuditConsumer;

pub const AUDIT_GROUP: &str = "payments-audit";

#[async_trait]
impl StreamHandler for AuditConsumer {
    async fn handle(&self, envelope: &StreamEnvelope) -> Result<(), HandlerError> {
        let event: PaymentEvent = serde_json::from_value(envelope.payload.clone())?;
        info!(
            event_id = %envelope.event_id,
            event_type = %event.event_type,
            provider = %event.provider,
            partition_key = %envelope.partition_key,
            tenant_id = ?envelope.tenant_id,
            correlation_id = %event.correlation_id,
            transaction_id = ?event.transaction.as_ref().map(|t| t.id),
            status = ?event.transaction.as_ref().map(|t| t.status()),
            "Payment event audited"
        );
        Ok(())
    }
}
