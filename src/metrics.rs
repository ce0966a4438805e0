use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_requests_total",
        "Total chat-completion requests by classified tier",
        &["tier"]
    )
    .unwrap();
    pub static ref FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "gateway_model_failures_total",
        "Total attempt failures by tier and reason",
        &["tier", "reason"]
    )
    .unwrap();
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gateway_request_duration_seconds",
        "End-to-end request duration by tier and outcome",
        &["tier", "outcome"]
    )
    .unwrap();
    pub static ref ACTIVE_ATTEMPTS: GaugeVec = register_gauge_vec!(
        "gateway_active_attempts",
        "In-flight upstream attempts by tier",
        &["tier"]
    )
    .unwrap();
}

pub async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    (
        [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_labeled_and_incrementable() {
        REQUESTS_TOTAL.with_label_values(&["t1"]).inc();
        assert!(REQUESTS_TOTAL.with_label_values(&["t1"]).get() >= 1.0);
    }
}
