// multimodal-server/src/metrics.rs

use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static INFERENCE_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

pub fn init_metrics() -> anyhow::Result<()> {
    let req_counter = IntCounterVec::new(
        prometheus::opts!("requests_total", "Total requests per route"),
        &["route", "status"],
    )?;
    let inference_seconds = HistogramVec::new(
        HistogramOpts::new("inference_seconds", "Wall time spent inside model inference")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["capability"],
    )?;

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(inference_seconds.clone())).ok();

    let _ = REQ_COUNTER.set(req_counter);
    let _ = INFERENCE_SECONDS.set(inference_seconds);
    Ok(())
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn observe_inference(capability: &str, seconds: f64) {
    if let Some(histogram) = INFERENCE_SECONDS.get() {
        histogram.with_label_values(&[capability]).observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("failed to encode metrics: {}", e).into_bytes(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}
