//! Diagnostic tracing setup.
//!
//! Diagnostics go to stderr through `tracing`; stdout is reserved for task
//! progress and reports. The filter comes from `PLUGKIT_LOG`, then
//! `RUST_LOG`, then the verbosity flag.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "PLUGKIT_LOG";

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init(verbose: bool, json: bool) {
    let filter = filter_from(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        verbose,
    );

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact().with_target(false))
            .try_init()
    };
    // Already initialized (tests, embedding)
    let _ = result;
}

fn filter_from(plugkit_log: Option<String>, rust_log: Option<String>, verbose: bool) -> EnvFilter {
    plugkit_log
        .or(rust_log)
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new(if verbose { "plugkit=debug" } else { "warn" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_prefers_plugkit_log() {
        let filter = filter_from(Some("plugkit=trace".into()), Some("error".into()), false);
        assert_eq!(filter.to_string(), "plugkit=trace");
    }

    #[test]
    fn test_filter_falls_back_to_verbosity() {
        assert_eq!(filter_from(None, None, true).to_string(), "plugkit=debug");
        assert_eq!(filter_from(None, None, false).to_string(), "warn");
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(false, false);
        init(true, true);
    }
}
