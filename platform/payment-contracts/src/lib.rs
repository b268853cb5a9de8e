//! # Payment Contracts
//!
//! Canonical, provider-agnostic types produced by webhook normalization and
//! consumed by every downstream subscriber (push channel, event stream,
//! notification dispatcher).
//!
//! ## Types
//!
//! - [`Money`], [`PhoneNumber`], [`Customer`]: value objects
//! - [`Transaction`]: canonical record with a deterministic id and a small
//!   status machine ([`TransactionStatus`])
//! - [`PaymentEvent`]: immutable occurrence published once per normalized callback
//! - [`WebhookEvent`]: raw ingestion record, diagnostics only

mod event;
mod money;
mod phone;
mod provider;
mod transaction;

pub use event::{CanonicalEvent, EventPriority, PaymentEvent, PaymentEventType, WebhookEvent};
pub use money::Money;
pub use phone::PhoneNumber;
pub use provider::Provider;
pub use transaction::{Customer, Transaction, TransactionKind, TransactionStatus};

/// Errors raised when constructing or mutating contract types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractError {
    #[error("amount must be non-negative, got {0}")]
    NegativeAmount(String),

    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("invalid phone number: {0}")]
    InvalidPhone(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
}
