//! Logging setup errors.

use std::path::PathBuf;

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::{reload, util::TryInitError};

/// Failures raised while installing or adjusting the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A level or per-target directive did not parse.
    #[error("invalid log filter '{directive}': {source}")]
    InvalidFilter {
        /// The offending level or directive.
        directive: String,
        /// Parser error.
        #[source]
        source: ParseError,
    },

    /// Log format name not recognised.
    #[error("unknown log format '{0}' (expected pretty, compact, json or full)")]
    UnknownFormat(String),

    /// The directory for rolling log files could not be created.
    #[error("cannot create log directory {path}: {source}")]
    LogDirectory {
        /// Requested directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber is already installed.
    #[error("logging already initialised: {0}")]
    AlreadyInitialized(#[from] TryInitError),

    /// The subscriber behind a [`LogHandle`](crate::LogHandle) is gone.
    #[error("cannot reload log filter: {0}")]
    Reload(#[from] reload::Error),
}

/// Result type for logging setup.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
