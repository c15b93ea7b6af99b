//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StrataError};

/// Installs a formatting subscriber filtered by `level`.
///
/// `level` uses `EnvFilter` syntax, e.g. `"strata=debug"`. Fails if the
/// directive does not parse or a global subscriber is already set.
pub fn init_logging(level: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(level)
                .map_err(|e| StrataError::Config(format!("invalid log level: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StrataError::Config("logging already initialized".into()))
}

/// Like [`init_logging`], but reads the filter from `RUST_LOG` first.
pub fn init_logging_from_env(default_level: &str) -> Result<()> {
    match std::env::var("RUST_LOG") {
        Ok(level) if !level.trim().is_empty() => init_logging(&level),
        _ => init_logging(default_level),
    }
}
