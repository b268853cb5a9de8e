use payment_contracts::EventPriority;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Recipient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Push, Channel::Email, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opt-outs carried in event metadata under `notificationPreferences`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPreferences {
    pub push: bool,
    pub email: bool,
    pub sms: bool,
}

impl Default for ChannelPreferences {
    fn default() -> Self {
        Self {
            push: true,
            email: true,
            sms: true,
        }
    }
}

impl ChannelPreferences {
    fn allows(&self, channel: Channel) -> bool {
        match channel {
            Channel::Push => self.push,
            Channel::Email => self.email,
            Channel::Sms => self.sms,
        }
    }
}

/// Channels the recipient can be reached on, allowed by preference, with SMS
/// reserved for high-priority events.
pub fn select_channels(priority: EventPriority, recipient: &Recipient) -> Vec<Channel> {
    Channel::ALL
        .into_iter()
        .filter(|c| recipient.preferences.allows(*c))
        .filter(|c| recipient.address_count(*c) > 0)
        .filter(|c| *c != Channel::Sms || priority == EventPriority::High)
        .collect()
}
