//! Logging system setup
//!
//! Installs the global tracing subscriber used by the server and by
//! `horizon_net`, whose lifecycle and per-connection events all go through
//! `tracing` macros.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the logging system
///
/// Sets up structured logging with either human-readable or JSON output.
/// The filter comes from `RUST_LOG` when it is set, otherwise from `level`.
///
/// # Arguments
/// * `level` - Fallback filter when `RUST_LOG` is unset (e.g. "info", or "debug" with `--debug`)
/// * `json_format` - Emit one JSON object per line instead of text
///
/// # Returns
/// * `Result<()>` - Error if a global subscriber was already installed
///
/// # Environment Variables
/// * `RUST_LOG` - Override the filter (e.g., "debug", "horizon_net=trace")
///
/// # Examples
/// ```ignore
/// logging::setup_logging("info", false)?;
/// ```
pub fn setup_logging(level: &str, json_format: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // target names are dropped for shorter lines in both formats
    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()?;
    }

    Ok(())
}
