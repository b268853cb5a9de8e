use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

use crate::AppState;

/// GET /metrics
///
/// Gauges are sampled at scrape time; counters are updated where the events
/// happen.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    for provider in state.providers.providers() {
        state.breakers.get(provider.as_str());
    }
    for snapshot in state.breakers.snapshots() {
        state
            .metrics
            .circuit_breaker_state
            .with_label_values(&[snapshot.name.as_str()])
            .set(i64::from(snapshot.state.as_u8()));
    }
    state
        .metrics
        .push_active_connections
        .set(state.hub.active_connections() as i64);

    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        ),
    }
}
