#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use event_stream::InMemoryBus;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use payment_contracts::{PaymentEvent, PaymentEventType};
use sha2::Sha512;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use webhooks_rs::bus::{EventSubscriber, SubscriberError};
use webhooks_rs::config::Config;
use webhooks_rs::{build_router, AppState};

pub const PAYSTACK_SECRET: &str = "sk_test_integration";
pub const PUSH_SECRET: &str = "push-integration-secret";

/// Records every event published on the bus
#[derive(Default)]
pub struct Capture(Mutex<Vec<Arc<PaymentEvent>>>);

#[async_trait]
impl EventSubscriber for Capture {
    fn name(&self) -> &str {
        "capture"
    }

    async fn handle(&self, event: Arc<PaymentEvent>) -> Result<(), SubscriberError> {
        self.0.lock().unwrap().push(event);
        Ok(())
    }
}

impl Capture {
    pub fn of_type(&self, event_type: PaymentEventType) -> Vec<Arc<PaymentEvent>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub router: Router,
    pub capture: Arc<Capture>,
}

pub fn config() -> Config {
    Config {
        paystack_secret_key: Some(PAYSTACK_SECRET.to_string()),
        push_jwt_secret: Some(PUSH_SECRET.to_string()),
        push_max_connections_per_user: 1,
        ..Config::default()
    }
}

pub fn app_with(config: Config) -> TestApp {
    let state = AppState::build(config, Arc::new(InMemoryBus::new()));
    let capture = Arc::new(Capture::default());
    for t in PaymentEventType::ALL {
        state.bus.subscribe(t, capture.clone());
    }
    TestApp {
        router: build_router(state.clone()),
        state,
        capture,
    }
}

pub fn app() -> TestApp {
    app_with(config())
}

pub fn paystack_signature(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(PAYSTACK_SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn charge(event: &str, reference: &str, tenant: Option<&str>) -> Vec<u8> {
    let mut data = serde_json::json!({
        "reference": reference,
        "amount": 250000,
        "currency": "NGN",
        "gateway_response": if event == "charge.failed" { "Declined" } else { "Approved" },
        "customer": {"email": "ada@example.com", "first_name": "Ada", "last_name": "Obi"}
    });
    if let Some(t) = tenant {
        data["metadata"] = serde_json::json!({ "tenantId": t });
    }
    serde_json::to_vec(&serde_json::json!({ "event": event, "data": data })).unwrap()
}

pub fn mpesa_stk_success() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "Body": {"stkCallback": {
            "MerchantRequestID": "29115-34620561-1",
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResultCode": 0,
            "ResultDesc": "The service request is processed successfully.",
            "CallbackMetadata": {"Item": [
                {"Name": "Amount", "Value": 1.00},
                {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                {"Name": "TransactionDate", "Value": 20191219102115u64},
                {"Name": "PhoneNumber", "Value": 254708374149u64}
            ]}
        }}
    }))
    .unwrap()
}

pub fn post_webhook(provider: &str, body: Vec<u8>, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{provider}"))
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body)).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn send(app: &TestApp, req: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(req).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Wait for acknowledged webhooks to finish processing
pub async fn settle(app: &TestApp) {
    for _ in 0..200 {
        if app.state.inflight.count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("webhook processing did not finish");
}
