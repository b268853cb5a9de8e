//! NATS-based implementation of the EventBus trait

use crate::{AckHandle, Acknowledge, BusError, BusMessage, BusResult, EventBus};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::{info, warn};

/// JetStream layout for one subject prefix
///
/// Two streams are kept: `<PREFIX>_EVENTS` on `<prefix>.events.>` and
/// `<PREFIX>_DLQ` on `<prefix>.dlq.>`.
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    pub prefix: String,
    pub events_max_age: Duration,
    pub dlq_max_age: Duration,
    /// Unacked messages are redelivered after this long
    pub ack_wait: Duration,
}

impl JetStreamConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            events_max_age: Duration::from_secs(60 * 60 * 24 * 14),
            dlq_max_age: Duration::from_secs(60 * 60 * 24 * 30),
            ack_wait: Duration::from_secs(300),
        }
    }

    fn stream_name(&self, kind: &str) -> String {
        let base: String = self
            .prefix
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{base}_{kind}")
    }

    /// `(stream name, subject root, max age)` for each stream
    fn streams(&self) -> [(String, String, Duration); 2] {
        [
            (
                self.stream_name("EVENTS"),
                format!("{}.events.", self.prefix),
                self.events_max_age,
            ),
            (
                self.stream_name("DLQ"),
                format!("{}.dlq.", self.prefix),
                self.dlq_max_age,
            ),
        ]
    }

    /// Stream holding `subject`, if any
    fn stream_for(&self, subject: &str) -> Option<String> {
        self.streams()
            .into_iter()
            .find(|(_, root, _)| subject.starts_with(root.as_str()))
            .map(|(name, _, _)| name)
    }
}

#[derive(Clone)]
struct Durable {
    context: jetstream::Context,
    config: JetStreamConfig,
}

/// EventBus backed by a NATS connection
///
/// Without JetStream, queue subscriptions map onto core NATS queue groups
/// and delivery is at-most-once. With [`NatsBus::with_jetstream`], subjects
/// under the configured prefix are persisted: publishes wait for the
/// server's ack, and each queue group becomes a durable pull consumer whose
/// messages stay pending until acked.
///
/// # Example
/// ```rust,no_run
/// use event_stream::{EventBus, JetStreamConfig, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::with_jetstream(nats_client, JetStreamConfig::new("payments")).await?;
///
/// bus.publish("payments.events.payment.success", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    durable: Option<Durable>,
}

impl NatsBus {
    /// Core NATS only
    pub fn new(client: Client) -> Self {
        Self {
            client,
            durable: None,
        }
    }

    /// Create the events and dead-letter streams if missing.
    pub async fn with_jetstream(client: Client, config: JetStreamConfig) -> BusResult<Self> {
        let context = jetstream::new(client.clone());

        for (name, root, max_age) in config.streams() {
            if context.get_stream(&name).await.is_err() {
                let stream_cfg = jetstream::stream::Config {
                    name: name.clone(),
                    subjects: vec![format!("{root}>")],
                    max_age,
                    ..Default::default()
                };
                context
                    .create_stream(stream_cfg)
                    .await
                    .map_err(|e| BusError::ConnectionError(e.to_string()))?;
                info!(stream = %name, "JetStream stream created");
            }
        }

        Ok(Self {
            client,
            durable: Some(Durable { context, config }),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }
}

/// Consumer names may not contain `.`, `*`, `>` or whitespace
fn consumer_name(group: &str) -> String {
    group
        .chars()
        .map(|c| if matches!(c, '.' | '*' | '>') || c.is_whitespace() { '_' } else { c })
        .collect()
}

fn to_bus_message(nats_msg: async_nats::Message) -> BusMessage {
    let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

    if let Some(nats_headers) = nats_msg.headers {
        let mut headers = std::collections::HashMap::new();
        for (key, values) in nats_headers.iter() {
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg
}

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(&self) -> BusResult<()> {
        self.0
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

fn from_jetstream(msg: jetstream::Message) -> BusMessage {
    to_bus_message(msg.message.clone()).with_ack(AckHandle::new(JetStreamAck(msg)))
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        if let Some(durable) = &self.durable {
            if durable.config.stream_for(subject).is_some() {
                durable
                    .context
                    .publish(subject.to_string(), payload.into())
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
                return Ok(());
            }
        }

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        Ok(subscriber.map(to_bus_message).boxed())
    }

    async fn subscribe_queue(
        &self,
        subject: &str,
        group: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        let durable_stream = self
            .durable
            .as_ref()
            .and_then(|d| d.config.stream_for(subject).map(|name| (d, name)));

        let Some((durable, stream_name)) = durable_stream else {
            let subscriber = self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(|e| BusError::SubscribeError(e.to_string()))?;
            return Ok(subscriber.map(to_bus_message).boxed());
        };

        let stream = durable
            .context
            .get_stream(&stream_name)
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let name = consumer_name(group);
        let consumer = stream
            .get_or_create_consumer(
                &name,
                pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: durable.config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;
        info!(stream = %stream_name, consumer = %name, subject = %subject, "Durable consumer attached");

        let group = group.to_string();
        Ok(messages
            .filter_map(move |next| {
                let group = group.clone();
                async move {
                    match next {
                        Ok(msg) => Some(from_jetstream(msg)),
                        Err(e) => {
                            warn!(group = %group, error = %e, "JetStream pull failed");
                            None
                        }
                    }
                }
            })
            .boxed())
    }
}
