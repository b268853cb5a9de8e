use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub webhook_requests_total: IntCounterVec,
    pub webhook_outcomes_total: IntCounterVec,
    pub stream_dead_letters_total: IntCounterVec,
    pub notification_results_total: IntCounterVec,

    // Histograms
    pub http_request_duration_seconds: HistogramVec,

    // Gauges
    pub circuit_breaker_state: IntGaugeVec,
    pub push_active_connections: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let webhook_requests_total = IntCounterVec::new(
            Opts::new("webhook_requests_total", "Inbound provider callbacks"),
            &["provider"],
        )
        .expect("metric");

        let webhook_outcomes_total = IntCounterVec::new(
            Opts::new("webhook_outcomes_total", "Processing outcome per callback"),
            &["provider", "outcome"], // published|duplicate|verification_failed|normalization_failed|circuit_open
        )
        .expect("metric");

        let stream_dead_letters_total = IntCounterVec::new(
            Opts::new("stream_dead_letters_total", "Stream envelopes routed to dead letters"),
            &["group"],
        )
        .expect("metric");

        let notification_results_total = IntCounterVec::new(
            Opts::new("notification_results_total", "Notification sends per channel and provider"),
            &["channel", "provider", "result"], // success|failure
        )
        .expect("metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration seconds"),
            &["path", "method", "status"],
        )
        .expect("metric");

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new("circuit_breaker_state", "Breaker state (0 closed, 1 half-open, 2 open)"),
            &["provider"],
        )
        .expect("metric");

        let push_active_connections = IntGauge::new(
            "push_active_connections",
            "Open push-channel connections",
        )
        .expect("metric");

        registry
            .register(Box::new(webhook_requests_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(webhook_outcomes_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(stream_dead_letters_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(notification_results_total.clone()))
            .expect("metric");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("metric");
        registry
            .register(Box::new(circuit_breaker_state.clone()))
            .expect("metric");
        registry
            .register(Box::new(push_active_connections.clone()))
            .expect("metric");

        Self {
            registry,
            webhook_requests_total,
            webhook_outcomes_total,
            stream_dead_letters_total,
            notification_results_total,
            http_request_duration_seconds,
            circuit_breaker_state,
            push_active_connections,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&mf, &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
