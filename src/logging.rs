//! Structured, hierarchical, event-emitting logging (§1's "logger
//! implementation" external collaborator), concretely backed by
//! `tracing` + `tracing-subscriber`.

/// Initializes the global `tracing` subscriber. Respects `RUST_LOG` if
/// set; otherwise defaults to `info` for this crate.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("integration_sync_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
