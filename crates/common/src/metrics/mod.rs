//! Metrics and observability utilities
//!
//! Counters and histograms go through the `metrics` facade with a common
//! `medparse_` prefix; the binary decides whether an exporter is installed.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all medparse metrics
pub const METRICS_PREFIX: &str = "medparse";

/// Buckets for backend call latency (in seconds)
pub const BACKEND_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Index metrics
    describe_counter!(
        format!("{}_index_builds_total", METRICS_PREFIX),
        Unit::Count,
        "Document index builds by outcome"
    );

    describe_counter!(
        format!("{}_chunks_indexed_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks embedded and published"
    );

    describe_histogram!(
        format!("{}_index_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Document index build latency in seconds"
    );

    // Retrieval metrics
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Retrieval latency in seconds"
    );

    describe_histogram!(
        format!("{}_retrieval_results", METRICS_PREFIX),
        Unit::Count,
        "Chunks returned per retrieval"
    );

    // Backend metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_generator_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Generative backend calls by status"
    );

    describe_histogram!(
        format!("{}_generator_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Generative backend latency in seconds"
    );

    // Extraction metrics
    describe_counter!(
        format!("{}_extractions_total", METRICS_PREFIX),
        Unit::Count,
        "Structured extractions by status"
    );

    describe_counter!(
        format!("{}_terminology_lookups_total", METRICS_PREFIX),
        Unit::Count,
        "Terminology lookups by coding system and outcome"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Wall-clock timer for one operation
pub struct OperationTimer {
    start: Instant,
}

impl OperationTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Helper to record a document index build
pub fn record_index_build(duration_secs: f64, corpus: &str, chunks: usize, outcome: &str) {
    counter!(
        format!("{}_index_builds_total", METRICS_PREFIX),
        "corpus" => corpus.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    counter!(
        format!("{}_chunks_indexed_total", METRICS_PREFIX),
        "corpus" => corpus.to_string()
    )
    .increment(chunks as u64);

    histogram!(format!("{}_index_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Helper to record retrieval metrics
pub fn record_retrieval(duration_secs: f64, corpus: &str, result_count: usize) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "corpus" => corpus.to_string()
    )
    .record(duration_secs);

    histogram!(
        format!("{}_retrieval_results", METRICS_PREFIX),
        "corpus" => corpus.to_string()
    )
    .record(result_count as f64);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
        tracing::trace!(model, batch_size, duration_secs, "Embedding batch completed");
    }
}

/// Helper to record generative backend calls
pub fn record_generation(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_generator_calls_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_generator_duration_seconds", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .record(duration_secs);
}

/// Helper to record an extraction outcome (complete / incomplete)
pub fn record_extraction(status: &str, attempts: u32) {
    counter!(
        format!("{}_extractions_total", METRICS_PREFIX),
        "status" => status.to_string(),
        "attempts" => attempts.to_string()
    )
    .increment(1);
}

/// Helper to record terminology lookups
pub fn record_terminology(system: &str, outcome: &str) {
    counter!(
        format!("{}_terminology_lookups_total", METRICS_PREFIX),
        "system" => system.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}
