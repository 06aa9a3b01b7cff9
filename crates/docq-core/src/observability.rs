//! Tracing setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling it again, or after another subscriber was installed, is a no-op.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Like [`init_tracing`] with an explicit fallback filter.
pub fn init_tracing_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // ignore error: a global subscriber may already be set (tests, embedding app)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_tracing_with_default("debug");
        init_tracing();
        tracing::info!("still logging");
    }
}
