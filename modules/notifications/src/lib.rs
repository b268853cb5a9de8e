//! Notification dispatch for canonical payment events.
//!
//! [`NotificationDispatcher::dispatch`] resolves a [`Recipient`] from the
//! event, selects channels from the recipient's preferences and the event
//! priority (SMS only for high priority), then tries each channel's primary
//! provider and falls back to the secondary. Channels run concurrently and
//! are reported independently in a [`DispatchReport`]; one failing channel
//! never fails the dispatch.

mod channel;
mod dispatcher;
mod message;
mod provider;
mod recipient;

pub use channel::{select_channels, Channel, ChannelPreferences};
pub use dispatcher::{ChannelResult, DispatchReport, NotificationDispatcher, ProviderAttempt};
pub use message::Notification;
pub use provider::{HttpProvider, LogProvider, NotificationProvider};
pub use recipient::Recipient;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider rejected notification with status {0}")]
    Rejected(u16),

    #[error("provider call timed out")]
    Timeout,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("no provider configured for {0} channel")]
    NoProvider(Channel),
}
