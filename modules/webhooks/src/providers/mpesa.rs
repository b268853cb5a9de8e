use chrono::Utc;
use payment_contracts::{
    CanonicalEvent, Customer, Money, PhoneNumber, Provider, Transaction, TransactionKind,
};
use serde::Deserialize;
use serde_json::Value;

use super::{settle, FlexNumber, NormalizationError, Outcome, ProviderAdapter};
use crate::verification::{bearer_token, Verification};

const CURRENCY: &str = "KES";
const COUNTRY_CODE: &str = "254";
const RESULT_OK: i64 = 0;
const RESULT_CANCELLED_BY_USER: i64 = 1032;

/// Daraja callbacks: STK push results and B2C transfer results
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MpesaCallback {
    Stk {
        #[serde(rename = "Body")]
        body: StkBody,
    },
    B2c {
        #[serde(rename = "Result")]
        result: B2cResult,
    },
}

#[derive(Debug, Deserialize)]
struct StkBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: FlexNumber,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
struct MetadataItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct B2cResult {
    #[serde(rename = "ResultCode")]
    result_code: FlexNumber,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "OriginatorConversationID", default)]
    originator_conversation_id: Option<String>,
    #[serde(rename = "ConversationID")]
    conversation_id: String,
    #[serde(rename = "TransactionID", default)]
    transaction_id: Option<String>,
    #[serde(rename = "ResultParameters", default)]
    result_parameters: Option<ResultParameters>,
}

#[derive(Debug, Deserialize)]
struct ResultParameters {
    #[serde(rename = "ResultParameter", default)]
    items: Vec<ResultParameter>,
}

#[derive(Debug, Deserialize)]
struct ResultParameter {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value", default)]
    value: Option<Value>,
}

fn lookup<'a>(pairs: impl Iterator<Item = (&'a str, Option<&'a Value>)>, name: &str) -> Option<&'a Value> {
    pairs
        .filter(|(k, _)| *k == name)
        .find_map(|(_, v)| v)
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn amount_from(v: Option<&Value>) -> Result<Money, NormalizationError> {
    match v {
        Some(v) => {
            let n: FlexNumber = serde_json::from_value(v.clone())?;
            Ok(Money::new(n.to_decimal("Amount")?, CURRENCY)?)
        }
        // Failed and cancelled STK callbacks carry no metadata
        None => Ok(Money::zero(CURRENCY)?),
    }
}

fn outcome(code: i64, desc: Option<&str>) -> Outcome {
    match code {
        RESULT_OK => Outcome::Completed,
        RESULT_CANCELLED_BY_USER => Outcome::Cancelled,
        _ => Outcome::Failed(
            desc.map(str::to_string)
                .unwrap_or_else(|| format!("result code {code}")),
        ),
    }
}

fn phone(raw: Option<String>) -> Option<PhoneNumber> {
    let raw = raw?;
    match PhoneNumber::parse(&raw, Some(COUNTRY_CODE)) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparseable M-Pesa phone number");
            None
        }
    }
}

/// Safaricom Daraja. No signing scheme; authenticity is structural plus an
/// optional shared callback token.
pub struct MpesaAdapter;

impl MpesaAdapter {
    fn normalize_stk(&self, cb: StkCallback) -> Result<CanonicalEvent, NormalizationError> {
        let now = Utc::now();
        let code = cb.result_code.to_i64("ResultCode")?;
        let items = cb
            .callback_metadata
            .as_ref()
            .map(|m| m.items.as_slice())
            .unwrap_or_default();
        let get = |name: &str| lookup(items.iter().map(|i| (i.name.as_str(), i.value.as_ref())), name);

        let mut tx = Transaction::new(
            Provider::Mpesa,
            cb.checkout_request_id.clone(),
            TransactionKind::Payment,
            amount_from(get("Amount"))?,
            now,
        )
        .with_customer(Customer {
            phone: phone(get("PhoneNumber").and_then(value_text)),
            ..Customer::default()
        })
        .with_description(cb.result_desc.clone());

        if let Some(id) = &cb.merchant_request_id {
            tx = tx.with_metadata("merchantRequestId", id.as_str());
        }
        if let Some(receipt) = get("MpesaReceiptNumber").and_then(value_text) {
            tx = tx.with_metadata("mpesaReceiptNumber", receipt);
        }
        if let Some(date) = get("TransactionDate").and_then(value_text) {
            tx = tx.with_metadata("transactionDate", date);
        }

        settle(&mut tx, outcome(code, cb.result_desc.as_deref()), now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }

    fn normalize_b2c(&self, result: B2cResult) -> Result<CanonicalEvent, NormalizationError> {
        let now = Utc::now();
        let code = result.result_code.to_i64("ResultCode")?;
        let items = result
            .result_parameters
            .as_ref()
            .map(|p| p.items.as_slice())
            .unwrap_or_default();
        let get = |name: &str| lookup(items.iter().map(|i| (i.key.as_str(), i.value.as_ref())), name);

        // "2547XXXXXXXX - Jane Doe"
        let receiver = get("ReceiverPartyPublicName").and_then(value_text);
        let (receiver_phone, receiver_name) = match receiver.as_deref().map(|r| r.split_once(" - ")) {
            Some(Some((p, n))) => (Some(p.trim().to_string()), Some(n.trim().to_string())),
            _ => (receiver, None),
        };

        let mut tx = Transaction::new(
            Provider::Mpesa,
            result.conversation_id.clone(),
            TransactionKind::Transfer,
            amount_from(get("TransactionAmount"))?,
            now,
        )
        .with_customer(Customer {
            name: receiver_name,
            email: None,
            phone: phone(receiver_phone),
        })
        .with_description(result.result_desc.clone());

        if let Some(id) = &result.originator_conversation_id {
            tx = tx.with_metadata("originatorConversationId", id.as_str());
        }
        if let Some(id) = &result.transaction_id {
            tx = tx.with_metadata("mpesaReceiptNumber", id.as_str());
        }

        settle(&mut tx, outcome(code, result.result_desc.as_deref()), now)?;
        Ok(CanonicalEvent::from_transaction(tx))
    }
}

impl ProviderAdapter for MpesaAdapter {
    fn provider(&self) -> Provider {
        Provider::Mpesa
    }

    fn signature_header(&self) -> &'static str {
        "x-callback-token"
    }

    fn requires_secret(&self) -> bool {
        false
    }

    fn verify(&self, payload: &[u8], signature: Option<&str>, secret: Option<&str>) -> Verification {
        if let Some(token) = secret {
            let check = bearer_token(signature.unwrap_or_default(), token);
            if !check.valid {
                return check;
            }
        }
        match serde_json::from_slice::<MpesaCallback>(payload) {
            Ok(_) => Verification::valid(),
            Err(_) => Verification::invalid("missing Body.stkCallback or Result fields"),
        }
    }

    fn normalize(&self, payload: &[u8]) -> Result<CanonicalEvent, NormalizationError> {
        match serde_json::from_slice::<MpesaCallback>(payload)? {
            MpesaCallback::Stk { body } => self.normalize_stk(body.stk_callback),
            MpesaCallback::B2c { result } => self.normalize_b2c(result),
        }
    }

    fn describe(&self, payload: &Value) -> String {
        if payload.pointer("/Body/stkCallback").is_some() {
            "stk_callback".to_string()
        } else if payload.get("Result").is_some() {
            "b2c_result".to_string()
        } else {
            "unknown".to_string()
        }
    }
}
