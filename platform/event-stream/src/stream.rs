//! Consumer groups over an [`EventBus`]
//!
//! Each group holds one queue subscription on `<prefix>.events.>`. A
//! dispatcher task decodes envelopes and routes each one to a group member
//! chosen by hashing its partition key, so one key is always handled by the
//! same member in arrival order. Members run their handler under
//! [`retry_with_backoff`] and hand exhausted envelopes to the dead-letter sink.
//! The transport message is acked only once the handler succeeded or the sink
//! accepted the envelope; otherwise a durable transport redelivers it.
//!
//! Publishing is fire-and-forget: envelopes go into a bounded buffer drained
//! by a relay task, so a slow transport never blocks the caller. The relay
//! retries failed transport publishes with the stream's backoff and
//! dead-letters them under [`RELAY_GROUP`] once retries are exhausted.

use crate::consumer_retry::{retry_with_backoff, RetryConfig};
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::envelope::{validate_envelope_fields, StreamEnvelope};
use crate::{AckHandle, BusError, BusMessage, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Dead-letter group for envelopes the relay could not hand to the transport
pub const RELAY_GROUP: &str = "stream-relay";

#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, envelope: &StreamEnvelope) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("publish buffer is full")]
    BufferFull,

    #[error("event stream is shut down")]
    Closed,

    #[error("consumer group {0} subscribed without event types")]
    NoEventTypes(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub subject_prefix: String,
    /// Envelopes buffered between `publish` and the transport
    pub publish_buffer: usize,
    /// Used when a subscription does not override it
    pub retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "payments".to_string(),
            publish_buffer: 1024,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Envelopes for other tenants are skipped
    pub tenant_filter: Option<String>,
    /// Capacity of this member's prefetch queue
    pub batch_size: usize,
    pub retry: Option<RetryConfig>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            tenant_filter: None,
            batch_size: 32,
            retry: None,
        }
    }
}

struct Delivery {
    envelope: StreamEnvelope,
    ack: Option<AckHandle>,
}

struct Member {
    event_types: HashSet<String>,
    tenant_filter: Option<String>,
    queue: mpsc::Sender<Delivery>,
}

impl Member {
    fn accepts(&self, envelope: &StreamEnvelope) -> bool {
        if !self.event_types.contains(&envelope.event_type) {
            return false;
        }
        match &self.tenant_filter {
            Some(tenant) => envelope.tenant_id.as_deref() == Some(tenant.as_str()),
            None => true,
        }
    }
}

#[derive(Default)]
struct Group {
    members: RwLock<Vec<Member>>,
    dead_letters: AtomicU64,
}

impl Group {
    fn route(&self, envelope: &StreamEnvelope) -> Option<mpsc::Sender<Delivery>> {
        let members = self.members.read().unwrap_or_else(|p| p.into_inner());
        let eligible: Vec<&Member> = members.iter().filter(|m| m.accepts(envelope)).collect();
        if eligible.is_empty() {
            return None;
        }
        let idx = partition_hash(&envelope.partition_key) % eligible.len() as u64;
        Some(eligible[idx as usize].queue.clone())
    }
}

fn partition_hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

pub struct EventStream {
    bus: Arc<dyn EventBus>,
    config: StreamConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
    outbound: mpsc::Sender<StreamEnvelope>,
    groups: Mutex<HashMap<String, Arc<Group>>>,
    relay_dead_letters: Arc<AtomicU64>,
    subscribe_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl EventStream {
    /// Must be called inside a Tokio runtime; spawns the publish relay.
    pub fn new(
        bus: Arc<dyn EventBus>,
        config: StreamConfig,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let (outbound, rx) = mpsc::channel(config.publish_buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let relay_dead_letters = Arc::new(AtomicU64::new(0));

        let relay = tokio::spawn(relay_loop(
            Relay {
                bus: bus.clone(),
                prefix: config.subject_prefix.clone(),
                retry: config.retry.clone(),
                sink: dead_letters.clone(),
                dead_letters: relay_dead_letters.clone(),
            },
            rx,
            shutdown_rx,
        ));

        Self {
            bus,
            config,
            dead_letters,
            outbound,
            groups: Mutex::new(HashMap::new()),
            relay_dead_letters,
            subscribe_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(vec![relay]),
            shutdown,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Buffer `envelope` for delivery without waiting on the transport.
    pub fn publish(&self, envelope: StreamEnvelope) -> Result<(), StreamError> {
        if *self.shutdown.borrow() {
            return Err(StreamError::Closed);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => StreamError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => StreamError::Closed,
        })
    }

    /// Register `handler` as a member of consumer group `group`.
    ///
    /// The first member of a group opens the group's queue subscription.
    pub async fn subscribe(
        &self,
        group: &str,
        event_types: &[&str],
        handler: Arc<dyn StreamHandler>,
        options: SubscribeOptions,
    ) -> Result<(), StreamError> {
        if event_types.is_empty() {
            return Err(StreamError::NoEventTypes(group.to_string()));
        }
        if *self.shutdown.borrow() {
            return Err(StreamError::Closed);
        }

        let _guard = self.subscribe_lock.lock().await;

        let existing = self
            .groups
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(group)
            .cloned();

        let group_state = match existing {
            Some(g) => g,
            None => {
                let pattern = format!("{}.events.>", self.config.subject_prefix);
                let messages = self.bus.subscribe_queue(&pattern, group).await?;
                let state = Arc::new(Group::default());

                let dispatcher = tokio::spawn(dispatch_loop(
                    group.to_string(),
                    state.clone(),
                    messages,
                    self.shutdown.subscribe(),
                ));
                self.track(dispatcher);

                self.groups
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(group.to_string(), state.clone());
                info!(group = %group, pattern = %pattern, "Consumer group subscribed");
                state
            }
        };

        let (queue, rx) = mpsc::channel(options.batch_size.max(1));
        group_state
            .members
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Member {
                event_types: event_types.iter().map(|t| t.to_string()).collect(),
                tenant_filter: options.tenant_filter.clone(),
                queue,
            });

        let worker = tokio::spawn(member_loop(MemberContext {
            group: group.to_string(),
            handler,
            retry: options.retry.unwrap_or_else(|| self.config.retry.clone()),
            sink: self.dead_letters.clone(),
            state: group_state,
            queue: rx,
            shutdown: self.shutdown.subscribe(),
        }));
        self.track(worker);

        debug!(group = %group, event_types = ?event_types, "Consumer group member added");
        Ok(())
    }

    /// Envelopes dead-lettered by `group` since start
    pub fn dead_letter_count(&self, group: &str) -> u64 {
        if group == RELAY_GROUP {
            return self.relay_dead_letters.load(Ordering::Relaxed);
        }
        self.groups
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(group)
            .map(|g| g.dead_letters.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Dead-letter totals for every subscribed group plus [`RELAY_GROUP`]
    pub fn dead_letter_counts(&self) -> BTreeMap<String, u64> {
        let mut counts: BTreeMap<String, u64> = self
            .groups
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(name, g)| (name.clone(), g.dead_letters.load(Ordering::Relaxed)))
            .collect();
        counts.insert(
            RELAY_GROUP.to_string(),
            self.relay_dead_letters.load(Ordering::Relaxed),
        );
        counts
    }

    /// Stop accepting work, let tasks drain for up to `grace`, then abort them.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        let deadline = tokio::time::Instant::now() + grace;

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("Abandoning event stream task after grace period");
                handle.abort();
            }
        }
        info!("Event stream stopped");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }
}

struct Relay {
    bus: Arc<dyn EventBus>,
    prefix: String,
    retry: RetryConfig,
    sink: Arc<dyn DeadLetterSink>,
    dead_letters: Arc<AtomicU64>,
}

impl Relay {
    async fn forward(&self, envelope: StreamEnvelope) {
        let subject = envelope.subject(&self.prefix);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(p) => p,
            Err(e) => {
                self.dead_letter(envelope, e.to_string(), 1).await;
                return;
            }
        };

        let bus = self.bus.as_ref();
        let outcome = retry_with_backoff(
            || bus.publish(&subject, payload.clone()),
            &self.retry,
            &subject,
        )
        .await;

        if let Err(exhausted) = outcome {
            self.dead_letter(envelope, exhausted.last_error.to_string(), exhausted.attempts)
                .await;
        }
    }

    async fn dead_letter(&self, envelope: StreamEnvelope, error: String, attempts: u32) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
        error!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            attempts,
            error = %error,
            "Stream publish failed, dead-lettering envelope"
        );
        let letter = DeadLetter {
            group: RELAY_GROUP.to_string(),
            envelope,
            error,
            attempts,
            failed_at: chrono::Utc::now(),
        };
        if let Err(e) = self.sink.record(letter).await {
            error!(group = RELAY_GROUP, error = %e, "Dead-letter sink rejected envelope");
        }
    }
}

async fn relay_loop(
    relay: Relay,
    mut rx: mpsc::Receiver<StreamEnvelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(envelope) => relay.forward(envelope).await,
                None => break,
            },
            _ = shutdown.changed() => {
                rx.close();
                while let Some(envelope) = rx.recv().await {
                    relay.forward(envelope).await;
                }
                break;
            }
        }
    }
}

async fn ack(group: &str, ack: Option<&AckHandle>) {
    if let Some(handle) = ack {
        if let Err(e) = handle.ack().await {
            warn!(group = %group, error = %e, "Ack failed, message will be redelivered");
        }
    }
}

fn decode(msg: &BusMessage) -> Result<StreamEnvelope, String> {
    let value: serde_json::Value =
        serde_json::from_slice(&msg.payload).map_err(|e| e.to_string())?;
    validate_envelope_fields(&value)?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

async fn dispatch_loop(
    group: String,
    state: Arc<Group>,
    mut messages: BoxStream<'static, BusMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            next = messages.next() => match next {
                Some(m) => m,
                None => break,
            },
        };

        let envelope = match decode(&msg) {
            Ok(e) => e,
            Err(reason) => {
                warn!(group = %group, subject = %msg.subject, reason = %reason, "Skipping malformed envelope");
                ack(&group, msg.ack.as_ref()).await;
                continue;
            }
        };

        // no member wants it: filtered, not failed
        let Some(queue) = state.route(&envelope) else {
            ack(&group, msg.ack.as_ref()).await;
            continue;
        };
        let delivery = Delivery {
            envelope,
            ack: msg.ack,
        };
        if queue.send(delivery).await.is_err() {
            debug!(group = %group, "Member queue closed");
        }
    }
}

struct MemberContext {
    group: String,
    handler: Arc<dyn StreamHandler>,
    retry: RetryConfig,
    sink: Arc<dyn DeadLetterSink>,
    state: Arc<Group>,
    queue: mpsc::Receiver<Delivery>,
    shutdown: watch::Receiver<bool>,
}

async fn member_loop(mut ctx: MemberContext) {
    let mut draining = false;

    loop {
        let next = if draining {
            ctx.queue.recv().await
        } else {
            tokio::select! {
                biased;
                _ = ctx.shutdown.changed() => {
                    draining = true;
                    ctx.queue.close();
                    continue;
                }
                next = ctx.queue.recv() => next,
            }
        };
        let Some(Delivery { envelope, ack: ack_handle }) = next else { break };

        let context = format!("{}:{}", ctx.group, envelope.event_type);
        let handler = ctx.handler.clone();
        let outcome = retry_with_backoff(|| handler.handle(&envelope), &ctx.retry, &context).await;

        match outcome {
            Ok(()) => ack(&ctx.group, ack_handle.as_ref()).await,
            Err(exhausted) => {
                ctx.state.dead_letters.fetch_add(1, Ordering::Relaxed);
                error!(
                    group = %ctx.group,
                    event_id = %envelope.event_id,
                    partition_key = %envelope.partition_key,
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "Dead-lettering envelope"
                );
                let letter = DeadLetter {
                    group: ctx.group.clone(),
                    error: exhausted.last_error.to_string(),
                    attempts: exhausted.attempts,
                    failed_at: chrono::Utc::now(),
                    envelope,
                };
                match ctx.sink.record(letter).await {
                    Ok(()) => ack(&ctx.group, ack_handle.as_ref()).await,
                    Err(e) => {
                        error!(group = %ctx.group, error = %e, "Dead-letter sink rejected envelope, leaving unacked");
                    }
                }
            }
        }
    }
}
