//! Tracing setup for binaries and test harnesses embedding the client
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. [`init_tracing`] is a convenience for the
//! common case.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "info";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG`
///
/// Returns `false` if a global subscriber was already installed, which is
/// not an error: the first one wins.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        let _ = init_tracing(LogFormat::Compact);
        assert!(!init_tracing(LogFormat::Json));
    }
}
