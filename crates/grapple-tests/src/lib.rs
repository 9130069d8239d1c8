//! Integration test helpers: in-process control plane and agent pairs for
//! end-to-end flows over real TLS sockets on loopback.

pub mod harness;

use std::sync::Once;

/// Opt-in tracing for debugging a failing flow (`RUST_LOG=debug`).
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
