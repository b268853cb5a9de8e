use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::{ContractError, Money, PhoneNumber, Provider};

/// Namespace for deterministic transaction ids (UUID v5).
const TRANSACTION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b9e_4d3a_4f7e_9a51_0c2d_8e7b_3f10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Terminal success states carry a `completed_at` timestamp.
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Refunded
        )
    }

    /// Allowed edges of the status machine.
    ///
    /// Provider callbacks usually report the final outcome directly, so the
    /// terminal states are reachable from `Pending` as well as `Processing`.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, Refunded)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic kind of a transaction; part of its deterministic id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Payment,
    Transfer,
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Transfer => "transfer",
            Self::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<PhoneNumber>,
}

/// Canonical record of a payment, transfer or refund
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub provider_transaction_id: String,
    pub provider: Provider,
    pub kind: TransactionKind,
    status: TransactionStatus,
    pub amount: Money,
    pub customer: Customer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Transaction {
    /// Deterministic id so that re-deliveries of one logical callback agree.
    pub fn derive_id(provider: Provider, provider_transaction_id: &str, kind: TransactionKind) -> Uuid {
        let name = format!("{}:{}:{}", provider, provider_transaction_id, kind.as_str());
        Uuid::new_v5(&TRANSACTION_NAMESPACE, name.as_bytes())
    }

    /// New transaction in `Pending`.
    pub fn new(
        provider: Provider,
        provider_transaction_id: impl Into<String>,
        kind: TransactionKind,
        amount: Money,
        created_at: DateTime<Utc>,
    ) -> Self {
        let provider_transaction_id = provider_transaction_id.into();
        Self {
            id: Self::derive_id(provider, &provider_transaction_id, kind),
            provider_transaction_id,
            provider,
            kind,
            status: TransactionStatus::Pending,
            amount,
            customer: Customer::default(),
            description: None,
            metadata: Map::new(),
            created_at,
            updated_at: created_at,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn with_customer(mut self, customer: Customer) -> Self {
        self.customer = customer;
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Move to `next`, maintaining `completed_at` for terminal success states.
    pub fn transition(&mut self, next: TransactionStatus, at: DateTime<Utc>) -> Result<(), ContractError> {
        if !self.status.can_transition_to(next) {
            return Err(ContractError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = at;
        if next.is_terminal_success() {
            // refund keeps the original completion time
            if self.completed_at.is_none() {
                self.completed_at = Some(at);
            }
        } else {
            self.completed_at = None;
        }
        Ok(())
    }

    /// Transition to `Failed` recording the provider's reason.
    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> Result<(), ContractError> {
        self.transition(TransactionStatus::Failed, at)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx() -> Transaction {
        Transaction::new(
            Provider::Mpesa,
            "ws_CO_191220191020363925",
            TransactionKind::Payment,
            Money::new(dec!(1), "KES").unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn test_id_is_deterministic_per_kind() {
        let a = Transaction::derive_id(Provider::Paystack, "ref-1", TransactionKind::Payment);
        let b = Transaction::derive_id(Provider::Paystack, "ref-1", TransactionKind::Payment);
        let c = Transaction::derive_id(Provider::Paystack, "ref-1", TransactionKind::Refund);
        let d = Transaction::derive_id(Provider::Mpesa, "ref-1", TransactionKind::Payment);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_completed_at_tracks_terminal_success() {
        let mut t = tx();
        assert!(t.completed_at().is_none());

        t.transition(TransactionStatus::Processing, Utc::now()).unwrap();
        assert!(t.completed_at().is_none());

        t.transition(TransactionStatus::Completed, Utc::now()).unwrap();
        let done = t.completed_at().expect("completed_at set");

        t.transition(TransactionStatus::Refunded, Utc::now()).unwrap();
        assert_eq!(t.completed_at(), Some(done));
    }

    #[test]
    fn test_failure_has_no_completed_at() {
        let mut t = tx();
        t.fail("insufficient funds", Utc::now()).unwrap();
        assert_eq!(t.status(), TransactionStatus::Failed);
        assert!(t.completed_at().is_none());
        assert_eq!(t.failure_reason.as_deref(), Some("insufficient funds"));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut t = tx();
        assert!(t.transition(TransactionStatus::Refunded, Utc::now()).is_err());

        t.transition(TransactionStatus::Failed, Utc::now()).unwrap();
        assert!(t.transition(TransactionStatus::Completed, Utc::now()).is_err());
        assert_eq!(t.status(), TransactionStatus::Failed);
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut t = tx();
        t.transition(TransactionStatus::Completed, Utc::now()).unwrap();
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["providerTransactionId"], "ws_CO_191220191020363925");
        assert_eq!(json["status"], "completed");
        assert!(json.get("completedAt").is_some());
        assert!(json.get("failureReason").is_none());
    }
}
