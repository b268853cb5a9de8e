use payment_contracts::PaymentEvent;
use serde_json::Value;

use crate::{Channel, ChannelPreferences};

/// Where a notification about one event can be delivered
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recipient {
    pub user_id: Option<String>,
    pub email: Option<String>,
    /// E.164
    pub phone: Option<String>,
    pub push_tokens: Vec<String>,
    pub preferences: ChannelPreferences,
}

impl Recipient {
    /// Customer contact details plus `pushTokens` and `notificationPreferences`
    /// from event metadata. `None` when the event carries no transaction.
    pub fn from_event(event: &PaymentEvent) -> Option<Self> {
        let tx = event.transaction.as_ref()?;

        let push_tokens = event
            .metadata
            .get("pushTokens")
            .and_then(Value::as_array)
            .map(|tokens| {
                tokens
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let preferences = event
            .metadata
            .get("notificationPreferences")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Some(Self {
            user_id: event.user_id().map(str::to_string),
            email: tx.customer.email.clone().filter(|e| !e.is_empty()),
            phone: tx.customer.phone.as_ref().map(|p| p.e164()),
            push_tokens,
            preferences,
        })
    }

    /// Addresses available on `channel`
    pub fn address_count(&self, channel: Channel) -> usize {
        match channel {
            Channel::Push => self.push_tokens.len(),
            Channel::Email => usize::from(self.email.is_some()),
            Channel::Sms => usize::from(self.phone.is_some()),
        }
    }

    pub fn addresses(&self, channel: Channel) -> Vec<String> {
        match channel {
            Channel::Push => self.push_tokens.clone(),
            Channel::Email => self.email.iter().cloned().collect(),
            Channel::Sms => self.phone.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use payment_contracts::{
        CanonicalEvent, Customer, Money, PhoneNumber, Provider, Transaction, TransactionKind,
    };
    use serde_json::json;

    fn event(metadata: Value) -> PaymentEvent {
        let mut tx = Transaction::new(
            Provider::Mpesa,
            "ws_CO_1",
            TransactionKind::Payment,
            Money::from_minor(10_000, "KES").unwrap(),
            Utc::now(),
        )
        .with_customer(Customer {
            name: None,
            email: Some("jane@example.com".to_string()),
            phone: Some(PhoneNumber::parse("0712345678", Some("254")).unwrap()),
        });
        if let Value::Object(map) = metadata {
            for (k, v) in map {
                tx = tx.with_metadata(&k, v);
            }
        }
        PaymentEvent::from_canonical(CanonicalEvent::from_transaction(tx), json!({}), Utc::now(), "req-1")
    }

    #[test]
    fn test_from_event_reads_customer_and_metadata() {
        let r = Recipient::from_event(&event(json!({
            "userId": "u-9",
            "pushTokens": ["t1", "", "t2"],
            "notificationPreferences": {"sms": false}
        })))
        .unwrap();

        assert_eq!(r.user_id.as_deref(), Some("u-9"));
        assert_eq!(r.email.as_deref(), Some("jane@example.com"));
        assert_eq!(r.phone.as_deref(), Some("+254712345678"));
        assert_eq!(r.push_tokens, vec!["t1".to_string(), "t2".to_string()]);
        assert!(!r.preferences.sms);
        assert!(r.preferences.email);
        assert_eq!(r.address_count(Channel::Push), 2);
    }

    #[test]
    fn test_no_transaction_no_recipient() {
        let e = PaymentEvent::webhook_received(Provider::Mtn, Utc::now(), "req-2");
        assert!(Recipient::from_event(&e).is_none());
    }
}
