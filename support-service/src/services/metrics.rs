//! Prometheus metrics for support-service.
//!
//! Chat pipeline, escalation, provider and storage metrics.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Chat metrics
pub static CHAT_QUERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CHAT_QUERY_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static CHAT_CONFIDENCE: OnceLock<HistogramVec> = OnceLock::new();

// Escalation metrics
pub static ESCALATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HITL_RESOLUTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Provider metrics
pub static PROVIDER_LATENCY_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static PROVIDER_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Storage metrics
pub static DB_OPERATION_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static DB_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CACHE_LOOKUPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

// Retrieval metrics
pub static RETRIEVAL_CONTEXTS: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics. Repeated calls keep the first registry.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let chat_queries = IntCounterVec::new(
        Opts::new("chat_queries_total", "Total chat queries by outcome"),
        &["tenant", "outcome"], // outcome: answered, cached, escalated, contact_captured, throttled
    )?;

    let chat_duration = HistogramVec::new(
        HistogramOpts::new(
            "chat_query_duration_seconds",
            "End-to-end chat query duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["tenant"],
    )?;

    let confidence = HistogramVec::new(
        HistogramOpts::new("chat_answer_confidence", "Confidence of synthesized answers")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
        &["tenant"],
    )?;

    let escalations = IntCounterVec::new(
        Opts::new("escalations_total", "Escalations created"),
        &["tenant", "reason"],
    )?;

    let resolutions = IntCounterVec::new(
        Opts::new("hitl_resolutions_total", "Operator replies processed"),
        &["outcome"], // outcome: resolved, skipped, rejected, kb_failed
    )?;

    let provider_latency = HistogramVec::new(
        HistogramOpts::new(
            "provider_latency_seconds",
            "Embedding and completion provider latency in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["provider", "operation"],
    )?;

    let provider_errors = IntCounterVec::new(
        Opts::new("provider_errors_total", "Total provider errors"),
        &["provider", "error_type"],
    )?;

    let db_duration = HistogramVec::new(
        HistogramOpts::new(
            "db_operation_duration_seconds",
            "Database operation duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation"],
    )?;

    let db_errors = IntCounterVec::new(
        Opts::new("db_errors_total", "Total database errors"),
        &["operation"],
    )?;

    let cache_lookups = IntCounterVec::new(
        Opts::new("cache_lookups_total", "Cache lookups by kind and result"),
        &["kind", "result"], // result: hit, miss, error
    )?;

    let retrieval_contexts = HistogramVec::new(
        HistogramOpts::new(
            "retrieval_contexts",
            "Knowledge contexts per search before and after policy filtering",
        )
        .buckets(vec![0.0, 1.0, 2.0, 3.0, 5.0, 10.0, 15.0]),
        &["stage"], // stage: candidates, returned
    )?;

    registry.register(Box::new(chat_queries.clone()))?;
    registry.register(Box::new(chat_duration.clone()))?;
    registry.register(Box::new(confidence.clone()))?;
    registry.register(Box::new(escalations.clone()))?;
    registry.register(Box::new(resolutions.clone()))?;
    registry.register(Box::new(provider_latency.clone()))?;
    registry.register(Box::new(provider_errors.clone()))?;
    registry.register(Box::new(db_duration.clone()))?;
    registry.register(Box::new(db_errors.clone()))?;
    registry.register(Box::new(cache_lookups.clone()))?;
    registry.register(Box::new(retrieval_contexts.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = CHAT_QUERIES_TOTAL.set(chat_queries);
    let _ = CHAT_QUERY_DURATION_SECONDS.set(chat_duration);
    let _ = CHAT_CONFIDENCE.set(confidence);
    let _ = ESCALATIONS_TOTAL.set(escalations);
    let _ = HITL_RESOLUTIONS_TOTAL.set(resolutions);
    let _ = PROVIDER_LATENCY_SECONDS.set(provider_latency);
    let _ = PROVIDER_ERRORS_TOTAL.set(provider_errors);
    let _ = DB_OPERATION_DURATION_SECONDS.set(db_duration);
    let _ = DB_ERRORS_TOTAL.set(db_errors);
    let _ = CACHE_LOOKUPS_TOTAL.set(cache_lookups);
    let _ = RETRIEVAL_CONTEXTS.set(retrieval_contexts);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to convert metrics to UTF-8");
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

pub fn record_chat_query(tenant: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = CHAT_QUERIES_TOTAL.get() {
        counter.with_label_values(&[tenant, outcome]).inc();
    }
    if let Some(histogram) = CHAT_QUERY_DURATION_SECONDS.get() {
        histogram.with_label_values(&[tenant]).observe(duration_secs);
    }
}

pub fn record_confidence(tenant: &str, confidence: f64) {
    if let Some(histogram) = CHAT_CONFIDENCE.get() {
        histogram.with_label_values(&[tenant]).observe(confidence);
    }
}

pub fn record_escalation(tenant: &str, reason: &str) {
    if let Some(counter) = ESCALATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant, reason]).inc();
    }
}

pub fn record_hitl_outcome(outcome: &str) {
    if let Some(counter) = HITL_RESOLUTIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record provider latency.
pub fn record_provider_latency(provider: &str, operation: &str, duration_secs: f64) {
    if let Some(histogram) = PROVIDER_LATENCY_SECONDS.get() {
        histogram
            .with_label_values(&[provider, operation])
            .observe(duration_secs);
    }
}

/// Record a provider error.
pub fn record_provider_error(provider: &str, error_type: &str) {
    if let Some(counter) = PROVIDER_ERRORS_TOTAL.get() {
        counter.with_label_values(&[provider, error_type]).inc();
    }
}

/// Record database operation duration.
pub fn record_db_operation(operation: &str, duration_secs: f64) {
    if let Some(histogram) = DB_OPERATION_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

/// Record a database error.
pub fn record_db_error(operation: &str) {
    if let Some(counter) = DB_ERRORS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_cache_lookup(kind: &str, result: &str) {
    if let Some(counter) = CACHE_LOOKUPS_TOTAL.get() {
        counter.with_label_values(&[kind, result]).inc();
    }
}

pub fn record_retrieval(candidates: usize, returned: usize) {
    if let Some(histogram) = RETRIEVAL_CONTEXTS.get() {
        histogram
            .with_label_values(&["candidates"])
            .observe(candidates as f64);
        histogram
            .with_label_values(&["returned"])
            .observe(returned as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_after_init() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        record_chat_query("acme", "answered", 0.2);
        record_escalation("acme", "low_confidence");

        let text = get_metrics();
        assert!(text.contains("chat_queries_total"));
        assert!(text.contains("escalations_total"));
    }
}
