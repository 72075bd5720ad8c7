//! Integration tests for the observability setup.
//!
//! Each integration test binary is its own process, so the global
//! subscriber installed here does not leak into other suites.

use kiln_core::observability::{init, metrics};

#[test]
fn test_init_installs_subscriber_once() {
    assert!(init().is_ok(), "first init should install the subscriber");
    assert!(init().is_err(), "a second global subscriber must be rejected");

    // Without an exporter the metrics facade is a no-op.
    metrics::record_build(1.5, "scratch");
    metrics::record_build_failure("daemon_build");
    metrics::record_push("success");
    metrics::record_legacy_digest();

    tracing::info!("Observability initialized for tests");
}
