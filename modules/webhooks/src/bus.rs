//! Idempotent in-process event bus.
//!
//! Subscribers register per [`PaymentEventType`]. A publish whose
//! idempotency key (`<type>:<transactionId>`) was seen within the TTL is
//! dropped before any subscriber runs. Subscribers run concurrently and a
//! failing one never affects the others or the publisher.

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use payment_contracts::{PaymentEvent, PaymentEventType};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error(transparent)]
    Stream(#[from] event_stream::StreamError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: Arc<PaymentEvent>) -> Result<(), SubscriberError>;
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Bounded key cache with per-key TTL and oldest-first eviction
pub struct DedupCache {
    entries: DashMap<String, Instant>,
    config: DedupConfig,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// Record `key`; false if it is already present and unexpired.
    ///
    /// The check and insert happen under the key's shard lock, so two
    /// concurrent claims of one key cannot both succeed. The size bound is
    /// enforced after the insert, once the shard lock is released, so
    /// concurrent claims of distinct keys cannot leave the cache over
    /// `max_entries`.
    pub fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) < self.config.ttl {
                    return false;
                }
                e.insert(now);
            }
            Entry::Vacant(e) => {
                e.insert(now);
            }
        }

        while self.entries.len() > self.config.max_entries {
            if self.evict_oldest(key) == 0 {
                break;
            }
        }
        true
    }

    /// Drop the oldest fifth of the cache, never `keep`.
    fn evict_oldest(&self, keep: &str) -> usize {
        let mut all: Vec<(String, Instant)> = self
            .entries
            .iter()
            .filter(|e| e.key() != keep)
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by_key(|(_, at)| *at);

        let count = (all.len() / 5).max(1);
        let evicted = all
            .into_iter()
            .take(count)
            .filter(|(key, at)| self.entries.remove_if(key, |_, v| v == at).is_some())
            .count();
        debug!(evicted, "Dedup cache full, evicted oldest entries");
        evicted
    }

    /// Remove expired keys; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.config.ttl;
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, at| now.duration_since(*at) < ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { subscribers: usize, failed: usize },
    Duplicate,
}

pub struct IdempotentBus {
    dedup: DedupCache,
    handlers: RwLock<HashMap<PaymentEventType, Vec<Arc<dyn EventSubscriber>>>>,
}

impl IdempotentBus {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            dedup: DedupCache::new(config),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, event_type: PaymentEventType, handler: Arc<dyn EventSubscriber>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.entry(event_type).or_default().push(handler);
    }

    /// Subscribe to every payment event type (not the webhook.* diagnostics).
    pub fn subscribe_all(&self, handler: Arc<dyn EventSubscriber>) {
        for event_type in PaymentEventType::PAYMENT_EVENTS {
            self.subscribe(event_type, handler.clone());
        }
    }

    pub fn subscriber_count(&self, event_type: PaymentEventType) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(&event_type).map_or(0, Vec::len)
    }

    pub async fn publish(&self, event: PaymentEvent) -> PublishOutcome {
        if let Some(key) = event.idempotency_key() {
            if !self.dedup.claim(&key) {
                debug!(
                    idempotency_key = %key,
                    correlation_id = %event.correlation_id,
                    "Duplicate event dropped"
                );
                return PublishOutcome::Duplicate;
            }
        }

        let subscribers = {
            let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
            handlers.get(&event.event_type).cloned().unwrap_or_default()
        };
        if subscribers.is_empty() {
            return PublishOutcome::Delivered {
                subscribers: 0,
                failed: 0,
            };
        }

        let event = Arc::new(event);
        let mut set = JoinSet::new();
        for subscriber in &subscribers {
            let subscriber = subscriber.clone();
            let event = event.clone();
            set.spawn(async move {
                let result = subscriber.handle(event).await;
                (subscriber.name().to_string(), result)
            });
        }

        let mut failed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    failed += 1;
                    error!(
                        subscriber = %name,
                        event_type = %event.event_type,
                        correlation_id = %event.correlation_id,
                        error = %e,
                        "Subscriber failed"
                    );
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        event_type = %event.event_type,
                        correlation_id = %event.correlation_id,
                        error = %e,
                        "Subscriber task panicked"
                    );
                }
            }
        }

        PublishOutcome::Delivered {
            subscribers: subscribers.len(),
            failed,
        }
    }

    pub fn sweep(&self) -> usize {
        self.dedup.sweep()
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    /// Periodic TTL sweep over the dedup cache.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = bus.sweep();
                if removed > 0 {
                    debug!(removed, remaining = bus.dedup_len(), "Dedup sweep");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use payment_contracts::{
        CanonicalEvent, Money, Provider, Transaction, TransactionKind, TransactionStatus,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Counter {
        name: String,
        seen: AtomicUsize,
        types: Mutex<Vec<PaymentEventType>>,
    }

    impl Counter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: AtomicUsize::new(0),
                types: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventSubscriber for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, event: Arc<PaymentEvent>) -> Result<(), SubscriberError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.types.lock().unwrap().push(event.event_type);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: Arc<PaymentEvent>) -> Result<(), SubscriberError> {
            Err(SubscriberError::Delivery("boom".to_string()))
        }
    }

    fn success(reference: &str) -> PaymentEvent {
        let mut tx = Transaction::new(
            Provider::Paystack,
            reference,
            TransactionKind::Payment,
            Money::from_minor(100, "NGN").unwrap(),
            Utc::now(),
        );
        tx.transition(TransactionStatus::Completed, Utc::now()).unwrap();
        PaymentEvent::from_canonical(CanonicalEvent::from_transaction(tx), json!({}), Utc::now(), "req")
    }

    #[tokio::test]
    async fn test_duplicate_publish_delivers_once() {
        let bus = IdempotentBus::new(DedupConfig::default());
        let counter = Counter::new("c");
        bus.subscribe(PaymentEventType::PaymentSuccess, counter.clone());

        assert_eq!(
            bus.publish(success("r1")).await,
            PublishOutcome::Delivered { subscribers: 1, failed: 0 }
        );
        assert_eq!(bus.publish(success("r1")).await, PublishOutcome::Duplicate);
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_have_one_winner() {
        let bus = Arc::new(IdempotentBus::new(DedupConfig::default()));
        let counter = Counter::new("c");
        bus.subscribe(PaymentEventType::PaymentSuccess, counter.clone());

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let bus = bus.clone();
            tasks.push(tokio::spawn(async move { bus.publish(success("same")).await }));
        }
        let mut delivered = 0;
        for t in tasks {
            if matches!(t.await.unwrap(), PublishOutcome::Delivered { .. }) {
                delivered += 1;
            }
        }

        assert_eq!(delivered, 1);
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_expires_after_ttl() {
        let bus = IdempotentBus::new(DedupConfig {
            max_entries: 100,
            ttl: Duration::from_secs(60),
        });
        let counter = Counter::new("c");
        bus.subscribe(PaymentEventType::PaymentSuccess, counter.clone());

        bus.publish(success("r1")).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bus.publish(success("r1")).await, PublishOutcome::Duplicate);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(bus.publish(success("r1")).await, PublishOutcome::Delivered { .. }));
        assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = DedupCache::new(DedupConfig {
            max_entries: 100,
            ttl: Duration::from_secs(10),
        });
        cache.claim("old");
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.claim("new");
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.claim("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_evicts_oldest_fifth() {
        let cache = DedupCache::new(DedupConfig {
            max_entries: 10,
            ttl: Duration::from_secs(3600),
        });
        for i in 0..10 {
            cache.claim(&format!("k{i}"));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 10);

        assert!(cache.claim("k10"));
        assert_eq!(cache.len(), 9);
        // k0 and k1 were the oldest and are claimable again
        assert!(cache.claim("k0"));
        assert!(!cache.claim("k5"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_respect_max_entries() {
        let cache = Arc::new(DedupCache::new(DedupConfig {
            max_entries: 50,
            ttl: Duration::from_secs(3600),
        }));

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..100 {
                    assert!(cache.claim(&format!("w{worker}-k{i}")));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(cache.len() <= 50, "cache grew to {}", cache.len());
        assert!(!cache.is_empty());
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let bus = IdempotentBus::new(DedupConfig::default());
        let counter = Counter::new("c");
        bus.subscribe(PaymentEventType::PaymentSuccess, Arc::new(Failing));
        bus.subscribe(PaymentEventType::PaymentSuccess, counter.clone());

        assert_eq!(
            bus.publish(success("r1")).await,
            PublishOutcome::Delivered { subscribers: 2, failed: 1 }
        );
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all_and_untracked_events() {
        let bus = IdempotentBus::new(DedupConfig::default());
        let counter = Counter::new("all");
        bus.subscribe_all(counter.clone());

        for t in PaymentEventType::PAYMENT_EVENTS {
            assert_eq!(bus.subscriber_count(t), 1);
        }
        assert_eq!(bus.subscriber_count(PaymentEventType::WebhookError), 0);

        // No transaction: never deduplicated
        let err = || {
            PaymentEvent::webhook_error(Provider::Mtn, json!({}), Utc::now(), "req", "bad token")
        };
        bus.subscribe(PaymentEventType::WebhookError, counter.clone());
        bus.publish(err()).await;
        bus.publish(err()).await;

        assert_eq!(counter.seen.load(Ordering::SeqCst), 2);
        assert_eq!(bus.dedup_len(), 0);
    }
}
