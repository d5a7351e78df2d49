//! Structured logging setup, shared by the CLI and any embedder of
//! `mailbox-core`.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for the current process.
///
/// Reads the log level from `RUST_LOG`, defaulting to `info` when unset
/// or unparseable. Safe to call once per process; a second call is a
/// no-op failure that is silently ignored (tests frequently call this
/// more than once across the suite).
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;

    #[test]
    fn init_tracing_does_not_panic() {
        init_tracing();
        info!("logging initialized");
    }
}
