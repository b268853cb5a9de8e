//! In-memory implementation of the EventBus trait for development and tests

use crate::{subject_matches, BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<BusMessage>>>;
type GroupReceiver = Weak<tokio::sync::Mutex<mpsc::Receiver<BusMessage>>>;

struct Subscriber {
    pattern: String,
    sender: mpsc::Sender<BusMessage>,
}

/// EventBus backed by bounded Tokio channels
///
/// Every plain subscriber, and every queue group, owns one bounded queue.
/// `publish` waits for room in each matching queue, so a slow consumer
/// slows the publisher down instead of losing messages. Queue subscribers
/// with the same `(pattern, group)` pull from one shared receiver, so each
/// message reaches exactly one member of the group.
///
/// Messages published before a subscription exists are not replayed, and
/// nothing survives a restart.
#[derive(Clone)]
pub struct InMemoryBus {
    capacity: usize,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    queues: Arc<Mutex<HashMap<(String, String), GroupReceiver>>>,
}

impl InMemoryBus {
    /// Each subscriber queue holds up to 1000 messages.
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        Self {
            capacity: buffer_size.max(1),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn register(&self, pattern: &str) -> mpsc::Receiver<BusMessage> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber {
                pattern: pattern.to_string(),
                sender,
            });
        receiver
    }

    /// Senders for every live subscriber matching `subject`; closed ones are pruned.
    fn targets(&self, subject: &str) -> Vec<mpsc::Sender<BusMessage>> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|s| !s.sender.is_closed());
        subscribers
            .iter()
            .filter(|s| subject_matches(subject, &s.pattern))
            .map(|s| s.sender.clone())
            .collect()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let msg = BusMessage::new(subject.to_string(), payload);
        for sender in self.targets(subject) {
            // a receiver dropped mid-publish is pruned on the next call
            let _ = sender.send(msg.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.register(pattern);
        let stream = async_stream::stream! {
            while let Some(msg) = receiver.recv().await {
                yield msg;
            }
        };
        Ok(stream.boxed())
    }

    async fn subscribe_queue(
        &self,
        pattern: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let shared: SharedReceiver = {
            let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            let key = (pattern.to_string(), group.to_string());
            match queues.get(&key).and_then(Weak::upgrade) {
                Some(shared) => shared,
                None => {
                    let shared = Arc::new(tokio::sync::Mutex::new(self.register(pattern)));
                    queues.insert(key, Arc::downgrade(&shared));
                    shared
                }
            }
        };

        // the group's queue closes once its last member stream is dropped
        let stream = async_stream::stream! {
            loop {
                let next = {
                    let mut receiver = shared.lock().await;
                    receiver.recv().await
                };
                match next {
                    Some(msg) => yield msg,
                    None => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}
