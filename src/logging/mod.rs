//! Console logging and the permission-failure flat file.
//!
//! [`init`] installs the global `tracing` subscriber. The level comes from
//! `RUST_LOG` when set, otherwise from the configured console verbosity.
//!
//! The [`csv`] submodule writes the human-readable flat file of recorded
//! permission failures.

pub mod csv;

use tracing_subscriber::EnvFilter;

use crate::config::Verbosity;

/// Build the filter used by [`init`].
pub fn env_filter(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.as_str()))
}

/// Install the global fmt subscriber. Calling it twice is harmless.
pub fn init(verbosity: Verbosity) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbosity))
        .with_target(false)
        .try_init();
}
