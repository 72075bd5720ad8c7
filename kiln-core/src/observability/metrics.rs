//! Build metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all build metrics with descriptions.
pub fn register_build_metrics() {
    describe_histogram!("kiln_build_duration_seconds", "Image build duration (by build mode)");
    describe_counter!("kiln_builds_total", "Total number of successful image builds");
    describe_counter!("kiln_build_failures_total", "Total number of build failures (by reason)");
    describe_counter!("kiln_push_total", "Total number of image pushes (by outcome)");
    describe_counter!(
        "kiln_legacy_digest_total",
        "Builds whose digest was recovered from legacy build output"
    );
}

pub fn record_build(duration_secs: f64, mode: &str) {
    histogram!("kiln_build_duration_seconds", "mode" => mode.to_string()).record(duration_secs);
    counter!("kiln_builds_total").increment(1);
}

pub fn record_build_failure(reason: &str) {
    counter!("kiln_build_failures_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_push(outcome: &str) {
    counter!("kiln_push_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_legacy_digest() {
    counter!("kiln_legacy_digest_total").increment(1);
}
