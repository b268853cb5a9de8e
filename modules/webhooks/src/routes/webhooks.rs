use axum::{
    body::Bytes,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use payment_contracts::Provider;
use serde_json::json;
use std::sync::Arc;

use crate::middleware::tracing::TraceId;
use crate::pipeline::InboundWebhook;
use crate::AppState;

/// POST /webhooks/{provider}
///
/// Acknowledges as soon as the raw body is captured; verification and
/// everything after it run in a tracked background task.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Extension(TraceId(request_id)): Extension<TraceId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let adapter = provider
        .parse::<Provider>()
        .ok()
        .and_then(|p| state.providers.get(p));
    let Some(adapter) = adapter else {
        tracing::debug!(provider = %provider, "Webhook for unknown provider");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown provider: {provider}") })),
        )
            .into_response();
    };

    let signature = headers
        .get(adapter.signature_header())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let inbound = InboundWebhook {
        provider: adapter.provider(),
        body,
        signature,
        request_id: request_id.clone(),
        received_at: Utc::now(),
    };

    let processor = state.processor.clone();
    state.inflight.spawn(async move {
        // Outcome is logged and counted by the processor
        let _ = processor.process(inbound).await;
    });

    (
        StatusCode::OK,
        Json(json!({ "received": true, "requestId": request_id })),
    )
        .into_response()
}

/// GET /webhooks/recent
pub async fn recent_webhooks(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let requests = state.recent.snapshot();
    Json(json!({
        "count": requests.len(),
        "requests": requests,
    }))
}
