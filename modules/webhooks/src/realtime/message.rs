use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::rooms::SubscriptionFilter;

/// Messages sent by push clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "eventTypes")]
        event_types: Vec<String>,
        #[serde(default)]
        filters: Option<SubscriptionFilter>,
    },
    Unsubscribe {
        #[serde(rename = "eventTypes")]
        event_types: Vec<String>,
    },
    JoinTenant {
        #[serde(rename = "tenantId")]
        tenant_id: String,
    },
    LeaveTenant {
        #[serde(rename = "tenantId")]
        tenant_id: String,
    },
    Ping,
}

pub mod frame_type {
    pub const CONNECTION_ESTABLISHED: &str = "connection.established";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const TENANT_JOINED: &str = "tenant.joined";
    pub const TENANT_LEFT: &str = "tenant.left";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const SERVER_SHUTDOWN: &str = "server.shutdown";
}

/// Every server → client frame; payment events use the event type as `type`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ServerFrame {
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
            timestamp: Utc::now(),
            tenant_id: None,
            user_id: None,
        }
    }

    pub fn with_scope(mut self, tenant_id: Option<String>, user_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self.user_id = user_id;
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(frame_type::ERROR, serde_json::json!({ "message": message.into() }))
    }
}
