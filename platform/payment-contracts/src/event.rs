use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{ContractError, Provider, Transaction, TransactionStatus};

/// Closed set of event types published on the payment event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PaymentEventType {
    #[serde(rename = "payment.pending")]
    PaymentPending,
    #[serde(rename = "payment.success")]
    PaymentSuccess,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.cancelled")]
    PaymentCancelled,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    #[serde(rename = "webhook.received")]
    WebhookReceived,
    #[serde(rename = "webhook.error")]
    WebhookError,
}

impl PaymentEventType {
    /// The "all payment events" set
    pub const PAYMENT_EVENTS: [PaymentEventType; 5] = [
        PaymentEventType::PaymentPending,
        PaymentEventType::PaymentSuccess,
        PaymentEventType::PaymentFailed,
        PaymentEventType::PaymentCancelled,
        PaymentEventType::PaymentRefunded,
    ];

    pub const ALL: [PaymentEventType; 7] = [
        PaymentEventType::PaymentPending,
        PaymentEventType::PaymentSuccess,
        PaymentEventType::PaymentFailed,
        PaymentEventType::PaymentCancelled,
        PaymentEventType::PaymentRefunded,
        PaymentEventType::WebhookReceived,
        PaymentEventType::WebhookError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentPending => "payment.pending",
            Self::PaymentSuccess => "payment.success",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentCancelled => "payment.cancelled",
            Self::PaymentRefunded => "payment.refunded",
            Self::WebhookReceived => "webhook.received",
            Self::WebhookError => "webhook.error",
        }
    }

    /// Event type implied by a transaction status
    pub fn for_status(status: TransactionStatus) -> Self {
        match status {
            TransactionStatus::Pending | TransactionStatus::Processing => Self::PaymentPending,
            TransactionStatus::Completed => Self::PaymentSuccess,
            TransactionStatus::Failed => Self::PaymentFailed,
            TransactionStatus::Cancelled => Self::PaymentCancelled,
            TransactionStatus::Refunded => Self::PaymentRefunded,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            Self::PaymentFailed | Self::PaymentCancelled | Self::WebhookError => EventPriority::High,
            Self::PaymentSuccess | Self::PaymentRefunded => EventPriority::Normal,
            Self::PaymentPending | Self::WebhookReceived => EventPriority::Low,
        }
    }
}

impl fmt::Display for PaymentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentEventType {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ContractError::UnknownEventType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Normal,
    High,
}

/// Output of a provider normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub event_type: PaymentEventType,
    pub transaction: Transaction,
}

impl CanonicalEvent {
    /// Event type follows the transaction status.
    pub fn from_transaction(transaction: Transaction) -> Self {
        Self {
            event_type: PaymentEventType::for_status(transaction.status()),
            transaction,
        }
    }
}

/// An occurrence published to subscribers; shared behind `Arc` once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    #[serde(rename = "type")]
    pub event_type: PaymentEventType,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
    pub raw_payload: Value,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub correlation_id: String,
    pub metadata: Map<String, Value>,
}

impl PaymentEvent {
    /// Event for a successfully normalized callback
    pub fn from_canonical(
        canonical: CanonicalEvent,
        raw_payload: Value,
        received_at: DateTime<Utc>,
        correlation_id: impl Into<String>,
    ) -> Self {
        let metadata = canonical.transaction.metadata.clone();
        Self {
            event_type: canonical.event_type,
            provider: canonical.transaction.provider,
            transaction: Some(canonical.transaction),
            raw_payload,
            received_at,
            processed_at: Some(Utc::now()),
            error: None,
            correlation_id: correlation_id.into(),
            metadata,
        }
    }

    /// `webhook.error` for a callback rejected by verification or normalization
    pub fn webhook_error(
        provider: Provider,
        raw_payload: Value,
        received_at: DateTime<Utc>,
        correlation_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_type: PaymentEventType::WebhookError,
            provider,
            transaction: None,
            raw_payload,
            received_at,
            processed_at: Some(Utc::now()),
            error: Some(error.into()),
            correlation_id: correlation_id.into(),
            metadata: Map::new(),
        }
    }

    /// `webhook.received` for every acknowledged callback
    pub fn webhook_received(
        provider: Provider,
        received_at: DateTime<Utc>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type: PaymentEventType::WebhookReceived,
            provider,
            transaction: None,
            raw_payload: Value::Null,
            received_at,
            processed_at: None,
            error: None,
            correlation_id: correlation_id.into(),
            metadata: Map::new(),
        }
    }

    /// `eventType:transactionId`; `None` means the event is never deduplicated.
    pub fn idempotency_key(&self) -> Option<String> {
        self.transaction
            .as_ref()
            .map(|t| format!("{}:{}", self.event_type, t.id))
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata_str(&["tenantId", "tenant_id"])
    }

    pub fn user_id(&self) -> Option<&str> {
        self.metadata_str(&["userId", "user_id"])
    }

    fn metadata_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.metadata.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    }
}

/// Raw ingestion record kept in the recent-request ring buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider: String,
    pub event_type: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Money, TransactionKind};
    use serde_json::json;

    fn completed_tx() -> Transaction {
        let mut tx = Transaction::new(
            Provider::Paystack,
            "ref-42",
            TransactionKind::Payment,
            Money::from_minor(5000, "NGN").unwrap(),
            Utc::now(),
        )
        .with_metadata("tenantId", "T1");
        tx.transition(TransactionStatus::Completed, Utc::now()).unwrap();
        tx
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_value(PaymentEventType::PaymentSuccess).unwrap(),
            json!("payment.success")
        );
        assert_eq!(
            "webhook.error".parse::<PaymentEventType>().unwrap(),
            PaymentEventType::WebhookError
        );
    }

    #[test]
    fn test_idempotency_key_uses_type_and_transaction_id() {
        let tx = completed_tx();
        let id = tx.id;
        let event = PaymentEvent::from_canonical(
            CanonicalEvent::from_transaction(tx),
            json!({}),
            Utc::now(),
            "req-1",
        );
        assert_eq!(event.event_type, PaymentEventType::PaymentSuccess);
        assert_eq!(event.idempotency_key(), Some(format!("payment.success:{id}")));
        assert_eq!(event.tenant_id(), Some("T1"));
    }

    #[test]
    fn test_error_events_have_no_idempotency_key() {
        let event = PaymentEvent::webhook_error(
            Provider::Paystack,
            json!({}),
            Utc::now(),
            "req-2",
            "invalid signature",
        );
        assert!(event.idempotency_key().is_none());
        assert_eq!(event.event_type.priority(), EventPriority::High);
    }
}
