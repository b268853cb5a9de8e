//! # Event Stream
//!
//! Durable fan-out of canonical payment events to independent consumers.
//!
//! ## Layers
//!
//! - **Transport** ([`EventBus`]): raw subject-based publish/subscribe.
//!   [`NatsBus`] in production, [`InMemoryBus`] for development and tests.
//!   Queue subscriptions give load-balanced delivery inside a group. With
//!   JetStream enabled, queue subscriptions are durable consumers and each
//!   message carries an [`AckHandle`].
//! - **Stream** ([`EventStream`]): typed [`StreamEnvelope`]s, a buffered
//!   fire-and-forget publisher, consumer groups with per-partition ordering,
//!   retry with exponential backoff and dead-lettering ([`DeadLetterSink`]).
//!
//! Delivery is at-least-once: a message is acknowledged only after its
//! handler succeeded or it was accepted by the dead-letter sink, and the
//! in-memory transport applies backpressure rather than skipping messages.
//! Ordering holds only within one partition key.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_stream::{
//!     EventBus, EventStream, InMemoryBus, InMemoryDeadLetters, StreamConfig, StreamEnvelope,
//!     SubscribeOptions,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(handler: Arc<dyn event_stream::StreamHandler>) -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! let stream = EventStream::new(bus, StreamConfig::default(), Arc::new(InMemoryDeadLetters::new(1000)));
//!
//! stream
//!     .subscribe("ledger", &["payment.success"], handler, SubscribeOptions::default())
//!     .await?;
//!
//! let envelope = StreamEnvelope::new("payment.success", "ws_CO_123", serde_json::json!({"amount": "10"}))
//!     .with_schema_version(1);
//! stream.publish(envelope)?;
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod dlq;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod stream;

pub use consumer_retry::{retry_with_backoff, RetryConfig, RetryExhausted};
pub use dlq::{BusDeadLetters, DeadLetter, DeadLetterSink, InMemoryDeadLetters};
pub use envelope::{validate_envelope_fields, StreamEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::{JetStreamConfig, NatsBus};
pub use stream::{
    EventStream, HandlerError, StreamConfig, StreamError, StreamHandler, SubscribeOptions,
    RELAY_GROUP,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// Transport-side acknowledgement of one delivered message
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> BusResult<()>;
}

/// Shared handle to a message's acknowledgement
#[derive(Clone)]
pub struct AckHandle(Arc<dyn Acknowledge>);

impl AckHandle {
    pub fn new(ack: impl Acknowledge + 'static) -> Self {
        Self(Arc::new(ack))
    }

    pub async fn ack(&self) -> BusResult<()> {
        self.0.ack().await
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckHandle")
    }
}

/// A message received from the transport
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    pub headers: Option<std::collections::HashMap<String, String>>,
    /// Set by durable transports; the message is redelivered until acked
    pub ack: Option<AckHandle>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            ack: None,
        }
    }

    pub fn with_headers(mut self, headers: std::collections::HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_ack(mut self, ack: AckHandle) -> Self {
        self.ack = Some(ack);
        self
    }

    /// No-op for transports without acknowledgements.
    pub async fn ack(&self) -> BusResult<()> {
        match &self.ack {
            Some(handle) => handle.ack().await,
            None => Ok(()),
        }
    }
}

/// NATS-style subject matching: `*` one token, `>` one or more tokens
pub(crate) fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("failed to acknowledge message: {0}")]
    AckError(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Subject-based publish/subscribe transport
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish raw bytes to `subject`
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Every subscriber receives every matching message.
    ///
    /// Patterns follow NATS wildcards: `*` matches one token, `>` one or more.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;

    /// Subscribers sharing `group` split the matching messages between them;
    /// different groups each see the full set.
    async fn subscribe_queue(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
