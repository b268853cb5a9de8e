//! # Stream Envelope
//!
//! Wire format for every event carried by the stream.
//!
//! - `event_id`: unique per publish; consumers use it for their own idempotency
//! - `event_type`: canonical type, e.g. `payment.success`
//! - `schema_version`: version of `payload`'s shape
//! - `partition_key`: ordering scope (the provider transaction id)
//! - `tenant_id`: optional tenant scope, used by `tenant_filter`
//! - `correlation_id`: the ingestion request id
//! - `payload`: the serialized PaymentEvent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub schema_version: u32,
    pub partition_key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl StreamEnvelope {
    /// New envelope with a fresh event id, schema version 1
    pub fn new(
        event_type: impl Into<String>,
        partition_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            schema_version: 1,
            partition_key: partition_key.into(),
            tenant_id: None,
            correlation_id: None,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Bus subject under `prefix`
    pub fn subject(&self, prefix: &str) -> String {
        format!("{prefix}.events.{}", self.event_type)
    }
}

/// Validate a decoded envelope before typed deserialization
///
/// # Validation Rules
///
/// - `event_id`, `occurred_at`: present strings
/// - `event_type`, `partition_key`: non-empty strings
/// - `schema_version`: positive integer
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;
    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    let partition_key = envelope
        .get("partition_key")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid partition_key")?;
    if partition_key.is_empty() {
        return Err("partition_key cannot be empty".to_string());
    }

    let version = envelope
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .ok_or("Missing or invalid schema_version")?;
    if version == 0 {
        return Err("schema_version must be positive".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_builder_and_subject() {
        let envelope = StreamEnvelope::new("payment.failed", "ws_CO_1", json!({"a": 1}))
            .with_schema_version(2)
            .with_tenant_id(Some("t1".to_string()))
            .with_correlation_id(Some("req-1".to_string()));

        assert_eq!(envelope.schema_version, 2);
        assert_eq!(envelope.tenant_id.as_deref(), Some("t1"));
        assert_eq!(envelope.subject("payments"), "payments.events.payment.failed");
    }

    #[test]
    fn test_serialized_envelope_validates() {
        let envelope = StreamEnvelope::new("payment.success", "ref-9", json!({}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(validate_envelope_fields(&value).is_ok());
        assert!(value.get("tenant_id").is_none());
    }

    #[test]
    fn test_validate_rejects_empty_partition_key() {
        let value = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "occurred_at": "2024-01-01T00:00:00Z",
            "event_type": "payment.success",
            "schema_version": 1,
            "partition_key": "",
            "payload": {}
        });
        assert_eq!(
            validate_envelope_fields(&value),
            Err("partition_key cannot be empty".to_string())
        );
    }

    #[test]
    fn test_validate_rejects_missing_version() {
        let value = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "occurred_at": "2024-01-01T00:00:00Z",
            "event_type": "payment.success",
            "partition_key": "k"
        });
        assert!(validate_envelope_fields(&value).is_err());
    }
}
