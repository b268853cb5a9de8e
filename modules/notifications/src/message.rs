use payment_contracts::{PaymentEvent, PaymentEventType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Channel, Recipient};

/// Rendered notification handed to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub channel: Channel,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub event_type: PaymentEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    pub correlation_id: String,
}

impl Notification {
    pub fn render(event: &PaymentEvent, channel: Channel, recipient: &Recipient) -> Self {
        let subject = match event.event_type {
            PaymentEventType::PaymentSuccess => "Payment received",
            PaymentEventType::PaymentFailed => "Payment failed",
            PaymentEventType::PaymentCancelled => "Payment cancelled",
            PaymentEventType::PaymentRefunded => "Payment refunded",
            PaymentEventType::PaymentPending => "Payment pending",
            PaymentEventType::WebhookReceived | PaymentEventType::WebhookError => "Payment update",
        }
        .to_string();

        let body = match &event.transaction {
            Some(tx) => {
                let mut body = format!(
                    "{}: {} via {} (ref {}).",
                    subject, tx.amount, tx.provider, tx.provider_transaction_id
                );
                if let Some(reason) = &tx.failure_reason {
                    body.push_str(&format!(" Reason: {reason}."));
                }
                body
            }
            None => format!("{subject} via {}.", event.provider),
        };

        Self {
            id: Uuid::new_v4(),
            channel,
            to: recipient.addresses(channel),
            subject,
            body,
            event_type: event.event_type,
            transaction_id: event.transaction.as_ref().map(|t| t.id),
            correlation_id: event.correlation_id.clone(),
        }
    }
}
