//! Tracing subscriber setup for binaries embedding the engine

use crate::{EscrowResult, error::EscrowError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Build the filter: `RUST_LOG` wins, otherwise `default_directive`
pub fn env_filter(default_directive: &str) -> EscrowResult<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive),
        _ => EnvFilter::try_new(default_directive),
    }
    .map_err(|e| EscrowError::config(format!("Invalid log filter: {}", e)))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(default_directive: &str, verbose: u8) -> EscrowResult<()> {
    let filter = match verbose {
        0 => env_filter(default_directive)?,
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| EscrowError::config(format!("Failed to install tracing subscriber: {}", e)))
}
