use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// The gateway's own Prometheus registry and the counters/histograms/gauges
/// named in spec §6.4. Kept separate from `gateway_http_errors::error_metrics_registry`
/// (status-code bookkeeping) so the `/metrics` handler gathers both.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    blocked_total: IntCounterVec,
    pii_detections_total: IntCounterVec,
    prompt_injections_total: IntCounterVec,
    rate_limit_violations_total: IntCounterVec,
    requests_by_status_total: IntCounterVec,
    latency_seconds: HistogramVec,
    audit_queue_size: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("firewall_requests_total", "Total inbound requests"),
            &["path", "method", "status"],
        )?;
        let blocked_total = IntCounterVec::new(
            Opts::new("firewall_blocked_total", "Requests blocked by the admission pipeline"),
            &["reason", "path"],
        )?;
        let pii_detections_total = IntCounterVec::new(
            Opts::new("firewall_pii_detections_total", "PII issues detected by the analyzer"),
            &["type"],
        )?;
        let prompt_injections_total = IntCounterVec::new(
            Opts::new(
                "firewall_prompt_injections_total",
                "Prompt-injection style issues detected by the analyzer",
            ),
            &["category"],
        )?;
        let rate_limit_violations_total = IntCounterVec::new(
            Opts::new(
                "firewall_rate_limit_violations_total",
                "Rate limit denials, by tier",
            ),
            &["type"],
        )?;
        let requests_by_status_total = IntCounterVec::new(
            Opts::new(
                "firewall_requests_by_status_total",
                "Requests grouped by final HTTP status",
            ),
            &["status", "path"],
        )?;
        let latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "firewall_latency_seconds",
                "End-to-end request latency in seconds",
            ),
            &["path", "method"],
        )?;
        let audit_queue_size = IntGauge::with_opts(Opts::new(
            "firewall_audit_queue_size",
            "Current depth of the in-memory audit queue",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(blocked_total.clone()))?;
        registry.register(Box::new(pii_detections_total.clone()))?;
        registry.register(Box::new(prompt_injections_total.clone()))?;
        registry.register(Box::new(rate_limit_violations_total.clone()))?;
        registry.register(Box::new(requests_by_status_total.clone()))?;
        registry.register(Box::new(latency_seconds.clone()))?;
        registry.register(Box::new(audit_queue_size.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            blocked_total,
            pii_detections_total,
            prompt_injections_total,
            rate_limit_violations_total,
            requests_by_status_total,
            latency_seconds,
            audit_queue_size,
        })
    }

    pub fn record_request(&self, path: &str, method: &str, status: u16) {
        let status = status.to_string();
        self.requests_total.with_label_values(&[path, method, &status]).inc();
        self.requests_by_status_total.with_label_values(&[&status, path]).inc();
    }

    pub fn record_blocked(&self, reason: &str, path: &str) {
        self.blocked_total.with_label_values(&[reason, path]).inc();
    }

    pub fn record_pii_detection(&self, issue_type: &str) {
        self.pii_detections_total.with_label_values(&[issue_type]).inc();
    }

    pub fn record_prompt_injection(&self, category: &str) {
        self.prompt_injections_total.with_label_values(&[category]).inc();
    }

    pub fn record_rate_limit_violation(&self, tier: &str) {
        self.rate_limit_violations_total.with_label_values(&[tier]).inc();
    }

    pub fn observe_latency(&self, path: &str, method: &str, secs: f64) {
        self.latency_seconds.with_label_values(&[path, method]).observe(secs);
    }

    pub fn set_audit_queue_size(&self, depth: usize) {
        self.audit_queue_size.set(depth as i64);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let mut families = self.registry.gather();
        families.extend(gateway_http_errors::error_metrics_registry().gather());
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"))
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
