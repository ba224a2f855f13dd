use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric name prefix for all pipeline metrics
const PREFIX: &str = "audiowave";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Pipeline Metrics
    pub static ref JOBS_SUBMITTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_submitted_total"),
        "Total number of analysis jobs submitted"
    ).expect("Failed to create jobs_submitted_total metric");

    pub static ref JOB_TRANSITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_transitions_total"), "Job status transitions by target status"),
        &["status"]
    ).expect("Failed to create job_transitions_total metric");

    pub static ref STAGE_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_stage_executions_total"), "Stage executions by stage and outcome"),
        &["stage", "outcome"]
    ).expect("Failed to create stage_executions_total metric");

    pub static ref STAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_stage_duration_seconds"),
            "Stage processor wall-clock duration in seconds"
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 180.0, 600.0, 1800.0]),
        &["stage"]
    ).expect("Failed to create stage_duration_seconds metric");

    pub static ref STAGES_IN_FLIGHT: Gauge = Gauge::new(
        format!("{PREFIX}_stages_in_flight"),
        "Work units currently dispatched to the worker pool"
    ).expect("Failed to create stages_in_flight metric");

    // Fingerprint Metrics
    pub static ref INDEX_TRACKS: Gauge = Gauge::new(
        format!("{PREFIX}_index_tracks"),
        "Reference tracks published in the fingerprint index"
    ).expect("Failed to create index_tracks metric");

    pub static ref INDEX_POSTINGS: Gauge = Gauge::new(
        format!("{PREFIX}_index_postings"),
        "Postings stored in the fingerprint index"
    ).expect("Failed to create index_postings metric");

    pub static ref MATCH_QUERIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_match_queries_total"), "Fingerprint match queries by result"),
        &["result"]
    ).expect("Failed to create match_queries_total metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOBS_SUBMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_TRANSITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STAGE_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STAGE_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(STAGES_IN_FLIGHT.clone()));
    let _ = REGISTRY.register(Box::new(INDEX_TRACKS.clone()));
    let _ = REGISTRY.register(Box::new(INDEX_POSTINGS.clone()));
    let _ = REGISTRY.register(Box::new(MATCH_QUERIES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
}

pub fn record_job_transition(status: &str) {
    JOB_TRANSITIONS_TOTAL.with_label_values(&[status]).inc();
}

/// Record one stage execution. `outcome` is "success" or the error kind.
pub fn record_stage_execution(stage: &str, outcome: &str, duration: Duration) {
    STAGE_EXECUTIONS_TOTAL
        .with_label_values(&[stage, outcome])
        .inc();
    STAGE_DURATION_SECONDS
        .with_label_values(&[stage])
        .observe(duration.as_secs_f64());
}

pub fn set_stages_in_flight(count: usize) {
    STAGES_IN_FLIGHT.set(count as f64);
}

pub fn set_index_size(tracks: usize, postings: usize) {
    INDEX_TRACKS.set(tracks as f64);
    INDEX_POSTINGS.set(postings as f64);
}

pub fn record_match_query(candidates: usize) {
    let result = if candidates > 0 { "hit" } else { "miss" };
    MATCH_QUERIES_TOTAL.with_label_values(&[result]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serve `/metrics` on `port` until `shutdown` is cancelled.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics server listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(name: &str) -> bool {
        REGISTRY.gather().iter().any(|m| m.get_name() == name)
    }

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        assert!(!REGISTRY.gather().is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_stage_execution() {
        init_metrics();
        record_stage_execution("SEPARATION", "success", Duration::from_millis(1500));
        record_stage_execution("TAGGING", "timeout", Duration::from_secs(300));

        assert!(find("audiowave_stage_executions_total"));
        assert!(find("audiowave_stage_duration_seconds"));
    }

    #[test]
    fn test_index_and_match_metrics() {
        init_metrics();
        set_index_size(3, 1200);
        record_match_query(0);
        record_match_query(2);

        assert!(find("audiowave_index_postings"));
        assert!(find("audiowave_match_queries_total"));
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() {
        init_metrics();
        record_job_submitted();
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
