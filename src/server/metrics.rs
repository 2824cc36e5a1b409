//! Prometheus metrics.
//!
//! All metrics live in a crate-local registry and are registered once at
//! startup. The metrics listener serves them on its own port so the
//! telemetry surface never shares a socket with the protocol surface.

use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

const PREFIX: &str = "varlock";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    pub static ref GRANTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_grants_total"), "Token grants by type and outcome"),
        &["grant_type", "status"]
    ).expect("Failed to create grants_total metric");

    pub static ref KEY_ROTATIONS_TOTAL: IntCounter = IntCounter::new(
        format!("{PREFIX}_key_rotations_total"),
        "Completed signing key rotations"
    ).expect("Failed to create key_rotations_total metric");

    pub static ref GC_DELETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_gc_deleted_total"), "Rows removed by garbage collection"),
        &["entity"]
    ).expect("Failed to create gc_deleted_total metric");

    pub static ref CONNECTOR_LOGINS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(format!("{PREFIX}_connector_logins_total"), "Federated logins by connector and outcome"),
        &["connector", "status"]
    ).expect("Failed to create connector_logins_total metric");

    pub static ref UP_SINCE: Gauge = Gauge::new(
        format!("{PREFIX}_up_since_seconds"),
        "Unix time the process started"
    ).expect("Failed to create up_since metric");
}

/// Registers every metric. Idempotent so embedding servers (tests spawn
/// several per process) can call it freely.
pub fn init_metrics() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(do_init);
}

fn do_init() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("Failed to register http_requests_total");
    REGISTRY
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("Failed to register http_request_duration_seconds");
    REGISTRY
        .register(Box::new(GRANTS_TOTAL.clone()))
        .expect("Failed to register grants_total");
    REGISTRY
        .register(Box::new(KEY_ROTATIONS_TOTAL.clone()))
        .expect("Failed to register key_rotations_total");
    REGISTRY
        .register(Box::new(GC_DELETED_TOTAL.clone()))
        .expect("Failed to register gc_deleted_total");
    REGISTRY
        .register(Box::new(CONNECTOR_LOGINS_TOTAL.clone()))
        .expect("Failed to register connector_logins_total");
    REGISTRY
        .register(Box::new(UP_SINCE.clone()))
        .expect("Failed to register up_since");
    UP_SINCE.set(chrono::Utc::now().timestamp() as f64);
}

pub fn record_grant(grant_type: &str, status: &str) {
    GRANTS_TOTAL.with_label_values(&[grant_type, status]).inc();
}

/// Handler for `GET /metrics` on the telemetry listener.
pub async fn serve_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {err}"),
        )
            .into_response();
    }
    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}
