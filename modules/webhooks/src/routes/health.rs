use axum::extract::State;
use circuit_breaker::{CircuitBreakerState, CircuitState};
use health::{ComponentHealth, HealthReport, HealthStatus};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

fn breaker_health(component: String, snapshot: &CircuitBreakerState) -> ComponentHealth {
    // Open and half-open both mean callbacks are being turned away
    let status = match snapshot.state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::Open | CircuitState::HalfOpen => HealthStatus::Degraded,
    };
    ComponentHealth::new(component, status).with_details(json!({
        "circuitBreaker": snapshot.state.to_string(),
        "consecutiveFailures": snapshot.consecutive_failures,
        "lastTransitionAt": snapshot.last_transition_at,
    }))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> HealthReport {
    let mut components: Vec<ComponentHealth> = state
        .providers
        .providers()
        .into_iter()
        .map(|p| {
            let snapshot = state.breakers.get(p.as_str()).snapshot();
            breaker_health(format!("provider:{p}"), &snapshot)
        })
        .collect();

    components.extend(
        state
            .breakers
            .snapshots()
            .iter()
            .filter(|s| s.name.starts_with("notify:"))
            .map(|s| breaker_health(s.name.clone(), s)),
    );

    components.push(ComponentHealth::healthy("event_stream").with_details(json!({
        "transport": state.config.bus_type,
        "deadLetters": state.stream.dead_letter_counts(),
    })));

    components.push(ComponentHealth::healthy("push_channel").with_details(json!({
        "enabled": state.hub.auth().is_some(),
        "activeConnections": state.hub.active_connections(),
    })));

    let draining = state.hub.is_shutting_down() || state.inflight.is_draining();
    components.push(
        ComponentHealth::new(
            "lifecycle",
            if draining { HealthStatus::Unhealthy } else { HealthStatus::Healthy },
        )
        .with_details(json!({ "inFlight": state.inflight.count(), "draining": draining })),
    );

    HealthReport::new("webhooks", env!("CARGO_PKG_VERSION"), components)
}
