//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

/// Install a formatted tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_directive`. Calling this more
/// than once is harmless; only the first subscriber is installed.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}
