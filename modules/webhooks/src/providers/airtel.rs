use chrono::Utc;
use payment_contracts::{
    CanonicalEvent, Customer, Money, PhoneNumber, Provider, Transaction, TransactionKind,
};
use serde::Deserialize;
use serde_json::Value;

use super::{settle, FlexNumber, NormalizationError, Outcome, ProviderAdapter};
use crate::verification::{hmac_sha256_base64, Verification};

#[derive(Debug, Deserialize)]
struct AirtelCallback {
    transaction: AirtelTransaction,
}

#[derive(Debug, Deserialize)]
struct AirtelTransaction {
    id: String,
    status_code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    airtel_money_id: Option<String>,
    #[serde(default)]
    amount: Option<FlexNumber>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    msisdn: Option<String>,
}

/// Airtel Money, signed with HMAC-SHA256 (base64) of the raw body
pub struct AirtelAdapter {
    default_currency: String,
}

impl AirtelAdapter {
    /// `default_currency` applies when the callback omits one
    pub fn new(default_currency: &str) -> Self {
        Self {
            default_currency: default_currency.to_string(),
        }
    }
}

impl ProviderAdapter for AirtelAdapter {
    fn provider(&self) -> Provider {
        Provider::Airtel
    }

    fn signature_header(&self) -> &'static str {
        "x-signature"
    }

    fn verify(&self, payload: &[u8], signature: Option<&str>, secret: Option<&str>) -> Verification {
        match (signature, secret) {
            (Some(sig), Some(secret)) => hmac_sha256_base64(payload, sig, secret),
            (None, _) => Verification::invalid("missing x-signature header"),
            (_, None) => Verification::invalid("no secret configured for provider"),
        }
    }

    fn normalize(&self, payload: &[u8]) -> Result<CanonicalEvent, NormalizationError> {
        let cb: AirtelCallback = serde_json::from_slice(payload)?;
        let t = cb.transaction;
        let now = Utc::now();

        let outcome = match t.status_code.as_str() {
            "TS" => Outcome::Completed,
            "TF" => Outcome::Failed(
                t.message
                    .clone()
                    .unwrap_or_else(|| "transaction failed".to_string()),
            ),
            "TA" | "TIP" => Outcome::Pending,
            other => return Err(NormalizationError::UnsupportedEvent(format!("status_code {other}"))),
        };

        let currency = t.currency.as_deref().unwrap_or(&self.default_currency);
        let amount = match &t.amount {
            Some(a) => Money::new(a.to_decimal("amount")?, currency)?,
            None => Money::zero(currency)?,
        };
        let phone = t
            .msisdn
            .as_deref()
            .and_then(|m| PhoneNumber::parse(m, None).ok());

        let mut tx = Transaction::new(Provider::Airtel, t.id.clone(), TransactionKind::Payment, amount, now)
            .with_customer(Customer {
                phone,
                ..Customer::default()
            })
            .with_description(t.message.clone());

        if let Some(id) = &t.airtel_money_id {
            tx = tx.with_metadata("airtelMoneyId", id.as_str());
        }

        settle(&mut tx, outcome, now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }

    fn describe(&self, payload: &Value) -> String {
        match payload.pointer("/transaction/status_code").and_then(Value::as_str) {
            Some(code) => format!("transaction:{code}"),
            None => "unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::airtel_signature;
    use payment_contracts::PaymentEventType;
    use serde_json::json;

    fn callback(code: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({"transaction": {
            "id": "BBZMiscxy",
            "message": "Paid UGX 5,000 to TECHNOLOGIES LIMITED",
            "status_code": code,
            "airtel_money_id": "MP210603.1234.L06941"
        }}))
        .unwrap()
    }

    #[test]
    fn test_status_codes() {
        let adapter = AirtelAdapter::new("UGX");
        let ok = adapter.normalize(&callback("TS")).unwrap();
        assert_eq!(ok.event_type, PaymentEventType::PaymentSuccess);
        assert_eq!(ok.transaction.amount.currency, "UGX");
        assert_eq!(ok.transaction.metadata["airtelMoneyId"], "MP210603.1234.L06941");

        assert_eq!(
            adapter.normalize(&callback("TF")).unwrap().event_type,
            PaymentEventType::PaymentFailed
        );
        assert_eq!(
            adapter.normalize(&callback("TIP")).unwrap().event_type,
            PaymentEventType::PaymentPending
        );
        assert!(adapter.normalize(&callback("XX")).is_err());
    }

    #[test]
    fn test_explicit_amount_and_currency_win() {
        let body = json!({"transaction": {"id": "a1", "status_code": "TS", "amount": 250, "currency": "kes"}});
        let event = AirtelAdapter::new("UGX")
            .normalize(&serde_json::to_vec(&body).unwrap())
            .unwrap();
        assert_eq!(event.transaction.amount.to_string(), "KES 250.00");
    }

    #[test]
    fn test_signature() {
        let body = callback("TS");
        let sig = airtel_signature(&body, "airtel-secret");
        let adapter = AirtelAdapter::new("KES");
        assert!(adapter.verify(&body, Some(&sig), Some("airtel-secret")).valid);
        assert!(!adapter.verify(&body, Some(&sig), Some("other")).valid);
    }
}
