//! Config loading.
//!
//! 1. Parse `defaults.toml` → base
//! 2. Merge the config file, if any
//! 3. Apply `PLINTH_*` env var fallbacks for fields the file did not set
//! 4. Deserialize merged tree → [`Config`]
//! 5. Validate

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{deep_merge, leaf_paths};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Load configuration from defaults, an optional file, and the process
/// environment.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file is unreadable or malformed, an env
/// var cannot be applied, or the result fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<Config> {
    load_with_env(path, &collect_env_vars())
}

/// [`load`] with an explicit environment, for callers that must not read
/// the process environment.
///
/// # Errors
///
/// Same as [`load`].
pub fn load_with_env<S: ::std::hash::BuildHasher>(
    path: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<Config> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|source| ConfigError::Malformed {
            origin: "<defaults>".to_owned(),
            source,
        })?;

    let mut file_fields = BTreeSet::new();
    if let Some(path) = path {
        let overlay = read_file(path)?;
        file_fields = leaf_paths(&overlay);
        deep_merge(&mut merged, &overlay);
        info!(path = %path.display(), "loaded config file");
    }

    let env_count = apply_env_fallbacks(&mut merged, &file_fields, env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|source: toml::de::Error| ConfigError::Malformed {
                origin: "<merged>".to_owned(),
                source,
            })?;

    validate::validate(&config)?;
    Ok(config)
}

fn read_file(path: &Path) -> ConfigResult<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    // Checked after reading so there is no gap between stat and read.
    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            size: content.len(),
            limit: MAX_CONFIG_FILE_SIZE,
        });
    }

    toml::from_str(&content).map_err(|source| ConfigError::Malformed {
        origin: path.display().to_string(),
        source,
    })
}
