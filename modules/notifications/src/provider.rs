use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::{Channel, Notification, NotifyError};

/// A gateway able to deliver notifications on one channel
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Stable name; also names the provider's circuit breaker
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts the notification as JSON to a gateway endpoint
pub struct HttpProvider {
    name: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl NotificationProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(notification);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::Timeout
            } else {
                NotifyError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Development provider that only logs
pub struct LogProvider {
    name: String,
}

impl LogProvider {
    pub fn new(channel: Channel) -> Self {
        Self {
            name: format!("log-{channel}"),
        }
    }
}

#[async_trait]
impl NotificationProvider for LogProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            provider = %self.name,
            channel = %notification.channel,
            recipients = notification.to.len(),
            event_type = %notification.event_type,
            correlation_id = %notification.correlation_id,
            subject = %notification.subject,
            "Notification logged"
        );
        Ok(())
    }
}
