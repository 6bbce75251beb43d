//! Shared tracing bootstrap for chronomesh binaries and tests.

use crate::{Error, Result};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize the global tracing subscriber for a component.
///
/// Binaries embedding the metadata core call this once at startup; tests may
/// call it repeatedly (subsequent calls are no-ops).
pub fn init_tracing(log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;
    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .try_init();
    Ok(())
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}
