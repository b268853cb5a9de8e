use chrono::Utc;
use payment_contracts::{
    CanonicalEvent, Customer, Money, PhoneNumber, Provider, Transaction, TransactionKind,
};
use serde::Deserialize;
use serde_json::Value;

use super::{settle, FlexNumber, NormalizationError, Outcome, ProviderAdapter};
use crate::verification::{bearer_token, Verification};

/// MoMo collection / disbursement status callback
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MtnCallback {
    #[serde(default)]
    financial_transaction_id: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    amount: FlexNumber,
    currency: String,
    #[serde(default)]
    payer: Option<Party>,
    #[serde(default)]
    payee: Option<Party>,
    #[serde(default)]
    payer_message: Option<String>,
    #[serde(default)]
    payee_note: Option<String>,
    status: String,
    #[serde(default)]
    reason: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Party {
    #[serde(default)]
    party_id_type: Option<String>,
    party_id: String,
}

fn reason_text(reason: Option<&Value>) -> Option<String> {
    match reason? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o
            .get("message")
            .or_else(|| o.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// MTN Mobile Money; callbacks carry a shared bearer token
pub struct MtnAdapter;

impl ProviderAdapter for MtnAdapter {
    fn provider(&self) -> Provider {
        Provider::Mtn
    }

    fn signature_header(&self) -> &'static str {
        "authorization"
    }

    fn verify(&self, _payload: &[u8], signature: Option<&str>, secret: Option<&str>) -> Verification {
        match (signature, secret) {
            (Some(sig), Some(token)) => bearer_token(sig, token),
            (None, _) => Verification::invalid("missing authorization header"),
            (_, None) => Verification::invalid("no secret configured for provider"),
        }
    }

    fn normalize(&self, payload: &[u8]) -> Result<CanonicalEvent, NormalizationError> {
        let cb: MtnCallback = serde_json::from_slice(payload)?;
        let now = Utc::now();

        let outcome = match cb.status.to_ascii_uppercase().as_str() {
            "SUCCESSFUL" => Outcome::Completed,
            "PENDING" => Outcome::Pending,
            "FAILED" | "REJECTED" | "TIMEOUT" => Outcome::Failed(
                reason_text(cb.reason.as_ref()).unwrap_or_else(|| cb.status.to_lowercase()),
            ),
            other => return Err(NormalizationError::UnsupportedEvent(format!("status {other}"))),
        };

        let reference = cb
            .external_id
            .clone()
            .or_else(|| cb.financial_transaction_id.clone())
            .filter(|r| !r.is_empty())
            .ok_or(NormalizationError::MissingField("externalId"))?;

        // Disbursements name a payee, collections a payer
        let (kind, party) = match (&cb.payee, &cb.payer) {
            (Some(payee), None) => (TransactionKind::Transfer, Some(payee)),
            (_, payer) => (TransactionKind::Payment, payer.as_ref()),
        };
        let phone = party
            .filter(|p| {
                p.party_id_type
                    .as_deref()
                    .map_or(true, |t| t.eq_ignore_ascii_case("MSISDN"))
            })
            .and_then(|p| PhoneNumber::parse(&p.party_id, None).ok());

        let mut tx = Transaction::new(
            Provider::Mtn,
            reference,
            kind,
            Money::new(cb.amount.to_decimal("amount")?, &cb.currency)?,
            now,
        )
        .with_customer(Customer {
            phone,
            ..Customer::default()
        })
        .with_description(cb.payer_message.clone().or(cb.payee_note.clone()));

        if let Some(id) = &cb.financial_transaction_id {
            tx = tx.with_metadata("financialTransactionId", id.as_str());
        }

        settle(&mut tx, outcome, now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }

    fn describe(&self, payload: &Value) -> String {
        match payload.get("status").and_then(Value::as_str) {
            Some(s) => format!("status:{}", s.to_ascii_lowercase()),
            None => "unknown".to_string(),
        }
    }
}
