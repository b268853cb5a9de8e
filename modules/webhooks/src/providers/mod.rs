//! Provider adapters.
//!
//! Each provider contributes two functions to the pipeline: `verify` over the
//! raw body and `normalize` into a [`CanonicalEvent`]. Payload shapes are typed
//! per provider and never leak past this module.

mod airtel;
mod mpesa;
mod mtn;
mod paystack;

pub use airtel::AirtelAdapter;
pub use mpesa::MpesaAdapter;
pub use mtn::MtnAdapter;
pub use paystack::PaystackAdapter;

use chrono::{DateTime, Utc};
use payment_contracts::{CanonicalEvent, ContractError, Provider, Transaction};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::Config;
use crate::verification::{MissingSecretPolicy, Verification};

#[derive(Debug, thiserror::Error)]
pub enum NormalizationError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Header carrying the signature or token
    fn signature_header(&self) -> &'static str;

    /// Whether authenticity depends on a shared secret. Providers without a
    /// signing scheme fall back to structural checks.
    fn requires_secret(&self) -> bool {
        true
    }

    /// Check `payload` against `signature`. `secret` is `None` only for
    /// providers that do not require one.
    fn verify(&self, payload: &[u8], signature: Option<&str>, secret: Option<&str>) -> Verification;

    fn normalize(&self, payload: &[u8]) -> Result<CanonicalEvent, NormalizationError>;

    /// Short provider-side event label for the recent-request log
    fn describe(&self, _payload: &Value) -> String {
        "callback".to_string()
    }
}

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    secret: Option<String>,
    policy: MissingSecretPolicy,
}

/// Adapters keyed by provider, with their configured secrets
#[derive(Default)]
pub struct ProviderRegistry {
    entries: HashMap<Provider, ProviderEntry>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let adapters: [Arc<dyn ProviderAdapter>; 4] = [
            Arc::new(MpesaAdapter),
            Arc::new(PaystackAdapter),
            Arc::new(MtnAdapter),
            Arc::new(AirtelAdapter::new(&config.airtel_default_currency)),
        ];

        let mut registry = Self::new();
        for adapter in adapters {
            let provider = adapter.provider();
            let policy = if config.allow_unsigned.contains(&provider) {
                MissingSecretPolicy::WarnAndAccept
            } else {
                MissingSecretPolicy::Reject
            };
            registry = registry.register(adapter, config.secret_for(provider), policy);
        }
        registry
    }

    pub fn register(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        secret: Option<String>,
        policy: MissingSecretPolicy,
    ) -> Self {
        self.entries.insert(
            adapter.provider(),
            ProviderEntry {
                adapter,
                secret,
                policy,
            },
        );
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderAdapter>> {
        self.entries.get(&provider).map(|e| e.adapter.clone())
    }

    pub fn providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.entries.contains_key(p))
            .collect()
    }

    /// Verify with the configured secret, failing closed when a secret is
    /// set and the signature header is absent.
    pub fn verify(&self, provider: Provider, payload: &[u8], signature: Option<&str>) -> Verification {
        let Some(entry) = self.entries.get(&provider) else {
            return Verification::invalid("provider not registered");
        };
        let adapter = &entry.adapter;

        match entry.secret.as_deref() {
            Some(secret) => match signature.filter(|s| !s.trim().is_empty()) {
                Some(sig) => adapter.verify(payload, Some(sig), Some(secret)),
                None => Verification::invalid(format!(
                    "missing {} header",
                    adapter.signature_header()
                )),
            },
            None if !adapter.requires_secret() => adapter.verify(payload, signature, None),
            None => match entry.policy {
                MissingSecretPolicy::Reject => {
                    Verification::invalid("no secret configured for provider")
                }
                MissingSecretPolicy::WarnAndAccept => {
                    tracing::warn!(
                        provider = %provider,
                        "No secret configured, accepting unsigned callback"
                    );
                    Verification::accepted_unsigned("unsigned callback accepted by policy")
                }
            },
        }
    }
}

/// Provider-reported outcome to apply to a freshly built transaction
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Pending,
    Processing,
    Completed,
    Failed(String),
    Cancelled,
    Refunded,
}

/// Walk `tx` from pending to the reported outcome through legal transitions.
pub(crate) fn settle(
    tx: &mut Transaction,
    outcome: Outcome,
    at: DateTime<Utc>,
) -> Result<(), NormalizationError> {
    use payment_contracts::TransactionStatus as S;
    match outcome {
        Outcome::Pending => {}
        Outcome::Processing => tx.transition(S::Processing, at)?,
        Outcome::Completed => tx.transition(S::Completed, at)?,
        Outcome::Failed(reason) => tx.fail(reason, at)?,
        Outcome::Cancelled => tx.transition(S::Cancelled, at)?,
        Outcome::Refunded => {
            tx.transition(S::Completed, at)?;
            tx.transition(S::Refunded, at)?;
        }
    }
    Ok(())
}

/// Copy the entries of a provider metadata object onto the transaction.
pub(crate) fn merge_metadata(tx: &mut Transaction, metadata: Option<&Value>) {
    if let Some(Value::Object(map)) = metadata {
        for (k, v) in map {
            tx.metadata.insert(k.clone(), v.clone());
        }
    }
}

/// Amount fields arrive as integers, floats or strings depending on provider
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum FlexNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FlexNumber {
    pub(crate) fn to_decimal(&self, field: &'static str) -> Result<Decimal, NormalizationError> {
        let invalid = |reason: String| NormalizationError::InvalidField { field, reason };
        match self {
            FlexNumber::Int(i) => Ok(Decimal::from(*i)),
            FlexNumber::Float(f) => Decimal::try_from(*f).map_err(|e| invalid(e.to_string())),
            FlexNumber::Text(s) => Decimal::from_str(s.trim()).map_err(|e| invalid(e.to_string())),
        }
    }

    pub(crate) fn to_i64(&self, field: &'static str) -> Result<i64, NormalizationError> {
        let invalid = |reason: String| NormalizationError::InvalidField { field, reason };
        match self {
            FlexNumber::Int(i) => Ok(*i),
            FlexNumber::Float(f) if f.fract() == 0.0 => Ok(*f as i64),
            FlexNumber::Float(f) => Err(invalid(format!("{f} is not an integer"))),
            FlexNumber::Text(s) => s.trim().parse().map_err(|_| invalid(s.clone())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::paystack_signature;
    use super::*;

    fn registry(secret: Option<&str>, policy: MissingSecretPolicy) -> ProviderRegistry {
        ProviderRegistry::new()
            .register(Arc::new(PaystackAdapter), secret.map(str::to_string), policy)
            .register(Arc::new(MpesaAdapter), None, MissingSecretPolicy::Reject)
    }

    #[test]
    fn test_secret_set_but_header_missing_fails_closed() {
        let reg = registry(Some("sk_test"), MissingSecretPolicy::WarnAndAccept);
        let v = reg.verify(Provider::Paystack, b"{}", None);
        assert!(!v.valid);
        assert_eq!(v.reason.as_deref(), Some("missing x-paystack-signature header"));
    }

    #[test]
    fn test_missing_secret_rejects_by_default() {
        let reg = registry(None, MissingSecretPolicy::Reject);
        let body = br#"{"event":"charge.success","data":{}}"#;
        let sig = paystack_signature(body, "anything");
        assert!(!reg.verify(Provider::Paystack, body, Some(&sig)).valid);
    }

    #[test]
    fn test_missing_secret_warn_and_accept_is_explicit() {
        let reg = registry(None, MissingSecretPolicy::WarnAndAccept);
        let v = reg.verify(Provider::Paystack, b"{}", None);
        assert!(v.valid);
        assert!(v.accepted_unsigned);
        assert!(v.reason.is_some());

        let body = br#"{"event":"charge.success","data":{}}"#;
        let signed = registry(Some("sk_test"), MissingSecretPolicy::WarnAndAccept)
            .verify(Provider::Paystack, body, Some(&paystack_signature(body, "sk_test")));
        assert!(signed.valid);
        assert!(!signed.accepted_unsigned);
    }

    #[test]
    fn test_structural_provider_needs_no_secret() {
        let reg = registry(None, MissingSecretPolicy::Reject);
        let stk = br#"{"Body":{"stkCallback":{"MerchantRequestID":"m","CheckoutRequestID":"ws_1","ResultCode":0,"ResultDesc":"ok"}}}"#;
        assert!(reg.verify(Provider::Mpesa, stk, None).valid);
        assert!(!reg.verify(Provider::Mpesa, br#"{"hello":"world"}"#, None).valid);
    }

    #[test]
    fn test_unregistered_provider_is_invalid() {
        let reg = registry(None, MissingSecretPolicy::Reject);
        assert!(!reg.verify(Provider::Mtn, b"{}", Some("Bearer x")).valid);
    }

    #[test]
    fn test_flex_number_forms() {
        let n: FlexNumber = serde_json::from_str("\"10000\"").unwrap();
        assert_eq!(n.to_i64("amount").unwrap(), 10000);
        let n: FlexNumber = serde_json::from_str("12.5").unwrap();
        assert_eq!(n.to_decimal("amount").unwrap().to_string(), "12.5");
        let n: FlexNumber = serde_json::from_str("\"abc\"").unwrap();
        assert!(n.to_decimal("amount").is_err());
    }
}
