//! Dead-letter destinations for envelopes that exhausted their retries

use crate::{BusError, BusResult, EventBus, StreamEnvelope};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub group: String,
    pub envelope: StreamEnvelope,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> BusResult<()>;
}

/// Bounded in-process sink; oldest letters are dropped past `capacity`.
pub struct InMemoryDeadLetters {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl InMemoryDeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetters {
    async fn record(&self, letter: DeadLetter) -> BusResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
        Ok(())
    }
}

/// Publishes dead letters to `<prefix>.dlq.<group>` for out-of-band triage
pub struct BusDeadLetters {
    bus: Arc<dyn EventBus>,
    prefix: String,
}

impl BusDeadLetters {
    pub fn new(bus: Arc<dyn EventBus>, prefix: impl Into<String>) -> Self {
        Self {
            bus,
            prefix: prefix.into(),
        }
    }

    pub fn subject(&self, group: &str) -> String {
        format!("{}.dlq.{}", self.prefix, group)
    }
}

#[async_trait]
impl DeadLetterSink for BusDeadLetters {
    async fn record(&self, letter: DeadLetter) -> BusResult<()> {
        let payload =
            serde_json::to_vec(&letter).map_err(|e| BusError::SerializationError(e.to_string()))?;
        self.bus.publish(&self.subject(&letter.group), payload).await
    }
}
