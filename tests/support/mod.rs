//! Shared scaffolding for the integration tests.

/// Installs the tracing subscriber once per test binary.
///
/// Honors `RUST_LOG` so a failing run can be replayed with full traces
/// (`RUST_LOG=drivebridge=debug cargo test ...`); defaults to warnings
/// only so passing runs stay quiet.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
