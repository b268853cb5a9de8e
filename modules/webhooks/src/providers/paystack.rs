use chrono::Utc;
use payment_contracts::{
    CanonicalEvent, Customer, Money, PhoneNumber, Provider, Transaction, TransactionKind,
};
use serde::Deserialize;
use serde_json::Value;

use super::{merge_metadata, settle, FlexNumber, NormalizationError, Outcome, ProviderAdapter};
use crate::verification::{hmac_sha512_hex, Verification};

const SUPPORTED_EVENTS: &[&str] = &[
    "charge.success",
    "charge.failed",
    "transfer.success",
    "transfer.failed",
    "transfer.reversed",
    "refund.processed",
    "refund.pending",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
enum PaystackWebhook {
    #[serde(rename = "charge.success")]
    ChargeSuccess(Charge),
    #[serde(rename = "charge.failed")]
    ChargeFailed(Charge),
    #[serde(rename = "transfer.success")]
    TransferSuccess(Transfer),
    #[serde(rename = "transfer.failed")]
    TransferFailed(Transfer),
    #[serde(rename = "transfer.reversed")]
    TransferReversed(Transfer),
    #[serde(rename = "refund.processed")]
    RefundProcessed(Refund),
    #[serde(rename = "refund.pending")]
    RefundPending(Refund),
}

#[derive(Debug, Deserialize)]
struct Charge {
    reference: String,
    amount: FlexNumber,
    currency: String,
    #[serde(default)]
    gateway_response: Option<String>,
    #[serde(default)]
    customer: Option<PaystackCustomer>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    reference: String,
    amount: FlexNumber,
    currency: String,
    #[serde(default)]
    transfer_code: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    recipient: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Refund {
    transaction_reference: String,
    amount: FlexNumber,
    currency: String,
    #[serde(default)]
    customer: Option<PaystackCustomer>,
}

#[derive(Debug, Default, Deserialize)]
struct PaystackCustomer {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

impl PaystackCustomer {
    fn into_customer(self) -> Customer {
        let name = match (self.first_name, self.last_name) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (f, l) => f.or(l),
        }
        .filter(|n| !n.trim().is_empty());

        let phone = self
            .phone
            .filter(|p| !p.trim().is_empty())
            .and_then(|p| PhoneNumber::parse(&p, None).ok());

        Customer {
            name,
            email: self.email.filter(|e| !e.is_empty()),
            phone,
        }
    }
}

/// Paystack reports amounts in the currency's subunit
fn minor_units(amount: &FlexNumber, currency: &str) -> Result<Money, NormalizationError> {
    Ok(Money::from_minor(amount.to_i64("amount")?, currency)?)
}

/// Paystack, signed with HMAC-SHA512 of the raw body
pub struct PaystackAdapter;

impl PaystackAdapter {
    fn charge(&self, charge: Charge, succeeded: bool) -> Result<CanonicalEvent, NormalizationError> {
        let now = Utc::now();
        let mut tx = Transaction::new(
            Provider::Paystack,
            charge.reference,
            TransactionKind::Payment,
            minor_units(&charge.amount, &charge.currency)?,
            now,
        )
        .with_customer(charge.customer.unwrap_or_default().into_customer())
        .with_description(charge.gateway_response.clone());
        merge_metadata(&mut tx, charge.metadata.as_ref());

        let outcome = if succeeded {
            Outcome::Completed
        } else {
            Outcome::Failed(
                charge
                    .gateway_response
                    .unwrap_or_else(|| "charge failed".to_string()),
            )
        };
        settle(&mut tx, outcome, now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }

    fn transfer(&self, transfer: Transfer, outcome: Outcome) -> Result<CanonicalEvent, NormalizationError> {
        let now = Utc::now();
        let mut tx = Transaction::new(
            Provider::Paystack,
            transfer.reference,
            TransactionKind::Transfer,
            minor_units(&transfer.amount, &transfer.currency)?,
            now,
        )
        .with_description(transfer.reason);

        if let Some(code) = transfer.transfer_code {
            tx = tx.with_metadata("transferCode", code);
        }
        if let Some(name) = transfer
            .recipient
            .as_ref()
            .and_then(|r| r.get("name"))
            .and_then(Value::as_str)
        {
            tx.customer.name = Some(name.to_string());
        }

        settle(&mut tx, outcome, now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }

    /// A processed refund moves the original payment to refunded; a pending
    /// refund is tracked as its own in-flight refund transaction.
    fn refund(&self, refund: Refund, processed: bool) -> Result<CanonicalEvent, NormalizationError> {
        let now = Utc::now();
        let kind = if processed {
            TransactionKind::Payment
        } else {
            TransactionKind::Refund
        };
        let mut tx = Transaction::new(
            Provider::Paystack,
            refund.transaction_reference,
            kind,
            minor_units(&refund.amount, &refund.currency)?,
            now,
        )
        .with_customer(refund.customer.unwrap_or_default().into_customer());

        let outcome = if processed {
            Outcome::Refunded
        } else {
            Outcome::Processing
        };
        settle(&mut tx, outcome, now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }
}

impl ProviderAdapter for PaystackAdapter {
    fn provider(&self) -> Provider {
        Provider::Paystack
    }

    fn signature_header(&self) -> &'static str {
        "x-paystack-signature"
    }

    fn verify(&self, payload: &[u8], signature: Option<&str>, secret: Option<&str>) -> Verification {
        match (signature, secret) {
            (Some(sig), Some(secret)) => hmac_sha512_hex(payload, sig, secret),
            (None, _) => Verification::invalid("missing x-paystack-signature header"),
            (_, None) => Verification::invalid("no secret configured for provider"),
        }
    }

    fn normalize(&self, payload: &[u8]) -> Result<CanonicalEvent, NormalizationError> {
        let value: Value = serde_json::from_slice(payload)?;
        let event = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or(NormalizationError::MissingField("event"))?;
        if !SUPPORTED_EVENTS.contains(&event) {
            return Err(NormalizationError::UnsupportedEvent(event.to_string()));
        }

        match serde_json::from_value::<PaystackWebhook>(value)? {
            PaystackWebhook::ChargeSuccess(c) => self.charge(c, true),
            PaystackWebhook::ChargeFailed(c) => self.charge(c, false),
            PaystackWebhook::TransferSuccess(t) => self.transfer(t, Outcome::Completed),
            PaystackWebhook::TransferFailed(t) => {
                let reason = t.reason.clone().unwrap_or_else(|| "transfer failed".to_string());
                self.transfer(t, Outcome::Failed(reason))
            }
            PaystackWebhook::TransferReversed(t) => {
                self.transfer(t, Outcome::Failed("transfer reversed".to_string()))
            }
            PaystackWebhook::RefundProcessed(r) => self.refund(r, true),
            PaystackWebhook::RefundPending(r) => self.refund(r, false),
        }
    }

    fn describe(&self, payload: &Value) -> String {
        payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payment_contracts::{PaymentEventType, TransactionStatus};
    use serde_json::json;

    fn body(event: &str, data: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"event": event, "data": data})).unwrap()
    }

    #[test]
    fn test_charge_success() {
        let payload = body(
            "charge.success",
            json!({
                "id": 302961,
                "reference": "qTPrJoy9Bx",
                "amount": 10000,
                "currency": "NGN",
                "status": "success",
                "gateway_response": "Approved by Financial Institution",
                "customer": {"email": "bojack@horsinaround.com", "first_name": "BoJack", "last_name": "Horseman"},
                "metadata": {"tenantId": "T1", "userId": "U9"}
            }),
        );
        let event = PaystackAdapter.normalize(&payload).unwrap();
        let tx = &event.transaction;

        assert_eq!(event.event_type, PaymentEventType::PaymentSuccess);
        assert_eq!(tx.amount.to_string(), "NGN 100.00");
        assert_eq!(tx.customer.name.as_deref(), Some("BoJack Horseman"));
        assert_eq!(tx.metadata["tenantId"], "T1");
    }

    #[test]
    fn test_charge_failed_carries_reason() {
        let payload = body(
            "charge.failed",
            json!({"reference": "r2", "amount": 500, "currency": "GHS", "gateway_response": "Declined", "metadata": ""}),
        );
        let event = PaystackAdapter.normalize(&payload).unwrap();
        assert_eq!(event.event_type, PaymentEventType::PaymentFailed);
        assert_eq!(event.transaction.failure_reason.as_deref(), Some("Declined"));
    }

    #[test]
    fn test_transfer_reversed_is_failed_transfer() {
        let payload = body(
            "transfer.reversed",
            json!({"reference": "tr1", "amount": "25000", "currency": "NGN", "transfer_code": "TRF_x"}),
        );
        let event = PaystackAdapter.normalize(&payload).unwrap();
        assert_eq!(event.transaction.kind, TransactionKind::Transfer);
        assert_eq!(event.event_type, PaymentEventType::PaymentFailed);
        assert_eq!(event.transaction.amount.to_string(), "NGN 250.00");
    }

    #[test]
    fn test_refund_processed_refunds_original_payment() {
        let charge = PaystackAdapter
            .normalize(&body(
                "charge.success",
                json!({"reference": "ref-9", "amount": 1000, "currency": "NGN"}),
            ))
            .unwrap();
        let refund = PaystackAdapter
            .normalize(&body(
                "refund.processed",
                json!({"transaction_reference": "ref-9", "amount": "1000", "currency": "NGN", "status": "processed"}),
            ))
            .unwrap();

        assert_eq!(refund.event_type, PaymentEventType::PaymentRefunded);
        assert_eq!(refund.transaction.status(), TransactionStatus::Refunded);
        assert!(refund.transaction.completed_at().is_some());
        assert_eq!(refund.transaction.id, charge.transaction.id);
    }

    #[test]
    fn test_refund_pending_is_processing_refund() {
        let event = PaystackAdapter
            .normalize(&body(
                "refund.pending",
                json!({"transaction_reference": "ref-9", "amount": 1000, "currency": "NGN"}),
            ))
            .unwrap();
        assert_eq!(event.transaction.kind, TransactionKind::Refund);
        assert_eq!(event.transaction.status(), TransactionStatus::Processing);
        assert_eq!(event.event_type, PaymentEventType::PaymentPending);
    }

    #[test]
    fn test_unsupported_and_malformed() {
        assert!(matches!(
            PaystackAdapter.normalize(&body("subscription.create", json!({}))),
            Err(NormalizationError::UnsupportedEvent(e)) if e == "subscription.create"
        ));
        assert!(matches!(
            PaystackAdapter.normalize(&body("charge.success", json!({"amount": 1}))),
            Err(NormalizationError::Malformed(_))
        ));
        assert!(matches!(
            PaystackAdapter.normalize(b"not json"),
            Err(NormalizationError::Malformed(_))
        ));
    }
}
