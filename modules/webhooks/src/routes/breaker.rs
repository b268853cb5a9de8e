use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use payment_contracts::Provider;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    /// Provider name, or the full name of another registered breaker
    pub provider: String,
}

/// POST /circuit-breaker/reset
pub async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> Response {
    let name = match req.provider.parse::<Provider>() {
        Ok(p) if state.providers.get(p).is_some() => p.as_str().to_string(),
        _ => match state.breakers.find(&req.provider) {
            Some(b) => b.name().to_string(),
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": format!("unknown breaker: {}", req.provider) })),
                )
                    .into_response()
            }
        },
    };

    let snapshot = state.breakers.reset(&name);
    tracing::info!(breaker = %name, "Circuit breaker manually reset");
    (
        StatusCode::OK,
        Json(json!({ "reset": true, "breaker": snapshot })),
    )
        .into_response()
}
