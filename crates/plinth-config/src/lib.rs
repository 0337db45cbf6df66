#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Host configuration for the plinth plugin framework.
//!
//! # Usage
//!
//! ```rust,no_run
//! use plinth_config::Config;
//!
//! let config = Config::load(Some(std::path::Path::new("plinth.toml"))).unwrap();
//! println!("plugins from: {}", config.plugins.directory);
//! ```
//!
//! # Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Config file** (path given by the caller)
//! 2. **Environment variables** (`PLINTH_*`), fallback only
//! 3. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate knows nothing about the runtime. Conversion into runtime types
//! happens in the binary's config bridge.

/// Environment variable fallback resolution.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file loading.
pub mod loader;
/// Layered configuration merging.
pub mod merge;
/// Reloadable field handling.
pub mod reload;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use reload::ReloadSummary;
pub use types::*;

impl Config {
    /// Load configuration: defaults, then `path` if given, then env fallbacks.
    ///
    /// See [`loader::load`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file is malformed or the final
    /// configuration fails validation.
    pub fn load(path: Option<&std::path::Path>) -> ConfigResult<Self> {
        loader::load(path)
    }
}
