//! Logging setup
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init_tracing`] to print them.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | sharded_counters=info,warn | Filter directives |
//! | COUNTERS_LOG_JSON | false | Emit JSON lines (always on with the `json-logs` feature) |

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "sharded_counters=info,warn";

/// Whether log lines should be JSON
pub fn json_logs_enabled() -> bool {
    cfg!(feature = "json-logs")
        || std::env::var("COUNTERS_LOG_JSON")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
}

/// Install the global fmt subscriber.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns whether this call installed the subscriber.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if json_logs_enabled() {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        assert!(!init_tracing(), "Second call must not install again");
        tracing::info!("still logging");
    }
}
