//! Logging infrastructure for the PVC daemons.
//!
//! Installs a `tracing` subscriber logging to journald when available and
//! to stderr otherwise, and bridges the `log` facade used by library code.

use std::env;

use tracing_log::{AsLog, LogTracer};
use tracing_subscriber::prelude::*;

pub use tracing::{debug, error, info, trace, warn};
pub use tracing_subscriber::filter::LevelFilter;

/// Initialize the global logger.
///
/// The level comes from `env_var_name` when set and parsable, otherwise
/// `default_log_level`.
pub fn init_logger(
    env_var_name: &str,
    default_log_level: LevelFilter,
) -> Result<(), anyhow::Error> {
    let mut log_level = default_log_level;
    if let Ok(v) = env::var(env_var_name) {
        if let Ok(l) = v.parse::<LevelFilter>() {
            log_level = l;
        }
    }

    let registry = tracing_subscriber::registry();
    match tracing_journald::layer() {
        Ok(journald) => {
            registry.with(journald.with_filter(log_level)).init();
        }
        Err(_) => {
            // not running under systemd (dev shells, tests)
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(log_level),
                )
                .init();
        }
    }
    LogTracer::init_with_filter(log_level.as_log())?;
    Ok(())
}
