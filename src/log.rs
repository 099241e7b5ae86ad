//! Logging setup built on [`tracing`].
//!
//! Every module logs through the `tracing` macros; this module only decides
//! where the events end up and at which level.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::Result;

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Filter used when verbose output is redirected to a debug file.
const DEBUG_FILTER: &str = "debug";

/// Installs the global subscriber.
///
/// Without a `debug_file`, events are written to `stderr` filtered by
/// `RUST_LOG` (default `info`). With one, events at `debug` and above are
/// appended to that file instead.
///
/// # Errors
///
/// Returns an error if the debug file cannot be opened or a global subscriber
/// was already installed.
pub fn init(debug_file: Option<&Path>) -> Result<()> {
    let result = match debug_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            tracing_subscriber::fmt()
                .with_env_filter(env_filter(DEBUG_FILTER))
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter(DEFAULT_FILTER))
            .with_writer(io::stderr)
            .try_init(),
    };

    result.map_err(|err| io::Error::other(format!("failed to install logger: {err}")).into())
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
