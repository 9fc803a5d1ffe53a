//! Logging configuration.
//!
//! This module wires up a `tracing` subscriber with either a human-readable
//! or JSON output format. Log levels are controlled through the standard
//! `RUST_LOG` environment variable (default: `info`).
//!
//! # Example
//!
//! ```rust,no_run
//! use streambus::telemetry::{init_logging, LogFormat};
//!
//! // Human-readable output (default).
//! init_logging(LogFormat::Pretty).expect("init logging");
//! ```
//!
//! For log aggregators, set `LOG_FORMAT=json` and use
//! [`LogFormat::from_env`].

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default).
    #[default]
    Pretty,
    /// JSON format for log aggregators.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        })
    }
}

impl LogFormat {
    /// Read from the `LOG_FORMAT` environment variable.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Initialize the global `tracing` subscriber.
///
/// Fails if a subscriber is already installed, so embedding applications
/// that bring their own subscriber can simply skip this call.
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?;
        }
    }
    Ok(())
}
