//! Configuration errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read {path}: {source}")]
    Unreadable {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file exceeds the size limit.
    #[error("{path} is {size} bytes; config files are limited to {limit} bytes")]
    TooLarge {
        /// Config file path.
        path: PathBuf,
        /// Actual size.
        size: usize,
        /// Size limit.
        limit: u64,
    },

    /// TOML that does not parse, or does not fit the config schema.
    /// `origin` is the file path, `<defaults>` or `<merged>`.
    #[error("malformed configuration in {origin}: {source}")]
    Malformed {
        /// Where the TOML came from.
        origin: String,
        /// TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A field holds a value plinth cannot use.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Dotted field path, e.g. `workers.poll_interval_ms`.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// A `PLINTH_*` environment variable has the wrong type.
    #[error("environment variable {var}: {message}")]
    BadEnvVar {
        /// Variable name.
        var: &'static str,
        /// What is wrong with it.
        message: String,
    },
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
