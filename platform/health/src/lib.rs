//! Shared health model for service `/health` endpoints.
//!
//! A report is the worst of its components: any `unhealthy` component makes
//! the service unhealthy (HTTP 503); `degraded` still answers 200 so load
//! balancers keep routing while operators are alerted.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn status_code(self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            details: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::new(name, HealthStatus::Healthy)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        components: Vec<ComponentHealth>,
    ) -> Self {
        Self {
            status: worst(&components),
            service: service.into(),
            version: version.into(),
            components,
            timestamp: Utc::now(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status.status_code()
    }
}

/// Healthy when empty
pub fn worst(components: &[ComponentHealth]) -> HealthStatus {
    components
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_of() {
        assert_eq!(worst(&[]), HealthStatus::Healthy);
        let components = vec![
            ComponentHealth::healthy("bus"),
            ComponentHealth::new("breaker:mtn", HealthStatus::Degraded),
        ];
        assert_eq!(worst(&components), HealthStatus::Degraded);

        let mut with_down = components.clone();
        with_down.push(ComponentHealth::new("stream", HealthStatus::Unhealthy));
        assert_eq!(worst(&with_down), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(HealthStatus::Healthy.status_code(), StatusCode::OK);
        assert_eq!(HealthStatus::Degraded.status_code(), StatusCode::OK);
        assert_eq!(
            HealthStatus::Unhealthy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_report_serializes_lowercase() {
        let report = HealthReport::new("svc", "1.0.0", vec![ComponentHealth::healthy("bus")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["components"][0]["name"], "bus");
        assert!(json["components"][0].get("details").is_none());
    }
}
