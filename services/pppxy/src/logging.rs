//! Logging initialization.
//!
//! Logs are structured JSON on stdout. `RUST_LOG` takes precedence over
//! the `--log-level` flag.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Parse a log level name, falling back to `info` for anything unknown.
///
/// Only the five level names are accepted. Numeric levels and `off` are not.
pub fn parse_level(level: &str) -> LevelFilter {
    const LEVELS: [(&str, LevelFilter); 5] = [
        ("trace", LevelFilter::TRACE),
        ("debug", LevelFilter::DEBUG),
        ("info", LevelFilter::INFO),
        ("warn", LevelFilter::WARN),
        ("error", LevelFilter::ERROR),
    ];

    let level = level.trim();
    LEVELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(level))
        .map_or(LevelFilter::INFO, |(_, filter)| *filter)
}

/// Install the global tracing subscriber.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(parse_level(log_level).into()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::DEBUG);
        assert_eq!(parse_level("ERROR"), LevelFilter::ERROR);
        assert_eq!(parse_level(" warn "), LevelFilter::WARN);
        assert_eq!(parse_level("verbose"), LevelFilter::INFO);
        assert_eq!(parse_level(""), LevelFilter::INFO);
        assert_eq!(parse_level("0"), LevelFilter::INFO);
        assert_eq!(parse_level("5"), LevelFilter::INFO);
        assert_eq!(parse_level("off"), LevelFilter::INFO);
        assert_eq!(parse_level("Trace"), LevelFilter::TRACE);
    }
}
