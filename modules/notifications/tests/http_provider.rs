use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use circuit_breaker::CircuitBreakerRegistry;
use notifications_rs::{Channel, HttpProvider, NotificationDispatcher, NotifyError};
use payment_contracts::{
    CanonicalEvent, Customer, Money, PaymentEvent, Provider, Transaction, TransactionKind,
    TransactionStatus,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn accept(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    captured.requests.lock().unwrap().push((auth, body));
    StatusCode::ACCEPTED
}

async fn reject() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn spawn_gateway(captured: Captured) -> String {
    let app = Router::new()
        .route("/ok", post(accept))
        .route("/down", post(reject))
        .with_state(captured);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn success_event() -> PaymentEvent {
    let mut tx = Transaction::new(
        Provider::Paystack,
        "ref_123",
        TransactionKind::Payment,
        Money::from_minor(500_000, "NGN").unwrap(),
        Utc::now(),
    )
    .with_customer(Customer {
        name: None,
        email: Some("buyer@example.com".to_string()),
        phone: None,
    });
    tx.transition(TransactionStatus::Completed, Utc::now()).unwrap();
    PaymentEvent::from_canonical(
        CanonicalEvent::from_transaction(tx),
        json!({}),
        Utc::now(),
        "req-http",
    )
}

#[tokio::test]
async fn email_is_posted_as_json_with_bearer_key() {
    let captured = Captured::default();
    let base = spawn_gateway(captured.clone()).await;

    let provider = HttpProvider::new(
        "mailer",
        format!("{base}/ok"),
        Some("secret-key".to_string()),
        Duration::from_secs(2),
    )
    .unwrap();
    let dispatcher = NotificationDispatcher::new(
        Arc::new(CircuitBreakerRegistry::default()),
        Duration::from_secs(2),
    )
    .with_channel(Channel::Email, Arc::new(provider), None);

    let report = dispatcher.dispatch(&success_event()).await;

    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].success);

    let requests = captured.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let (auth, body) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer secret-key"));
    assert_eq!(body["channel"], "email");
    assert_eq!(body["to"][0], "buyer@example.com");
    assert_eq!(body["eventType"], "payment.success");
    assert_eq!(body["correlationId"], "req-http");
}

#[tokio::test]
async fn non_success_status_falls_back() {
    let captured = Captured::default();
    let base = spawn_gateway(captured.clone()).await;

    let primary =
        HttpProvider::new("mailer-a", format!("{base}/down"), None, Duration::from_secs(2)).unwrap();
    let fallback =
        HttpProvider::new("mailer-b", format!("{base}/ok"), None, Duration::from_secs(2)).unwrap();
    let dispatcher = NotificationDispatcher::new(
        Arc::new(CircuitBreakerRegistry::default()),
        Duration::from_secs(2),
    )
    .with_channel(Channel::Email, Arc::new(primary), Some(Arc::new(fallback)));

    let report = dispatcher.dispatch(&success_event()).await;
    let email = &report.results[0];

    assert!(email.success);
    assert_eq!(email.provider.as_deref(), Some("mailer-b"));
    assert_eq!(
        email.attempts[0].error,
        Some(NotifyError::Rejected(503).to_string())
    );
    assert_eq!(captured.requests.lock().unwrap()[0].0, None);
}
