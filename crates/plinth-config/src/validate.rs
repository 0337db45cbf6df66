//! Post-merge configuration validation.

use plinth_abi::MAX_CONFIG_SIZE;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound on `workers.max_background_plugins`.
pub const MAX_BACKGROUND_PLUGINS_UPPER_BOUND: u32 = 1024;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_custom_config(&config.plugins.custom_config)?;
    validate_workers(config)?;
    validate_logging(config)?;
    Ok(())
}

/// Check a custom configuration blob on its own, as done on reload.
///
/// # Errors
///
/// Returns a validation error when the text is neither empty nor JSON, or
/// does not fit the record field.
pub fn validate_custom_config(custom_config: &str) -> ConfigResult<()> {
    if custom_config.len() >= MAX_CONFIG_SIZE {
        return Err(ConfigError::Invalid {
            field: "plugins.custom_config",
            message: format!(
                "custom_config is {} bytes; it must be shorter than {MAX_CONFIG_SIZE}",
                custom_config.len()
            ),
        });
    }

    if custom_config.trim().is_empty() {
        return Ok(());
    }

    serde_json::from_str::<serde_json::Value>(custom_config).map_err(|e| {
        ConfigError::Invalid {
            field: "plugins.custom_config",
            message: format!("custom_config is not valid JSON: {e}"),
        }
    })?;
    Ok(())
}

fn validate_workers(config: &Config) -> ConfigResult<()> {
    let w = &config.workers;

    if w.max_background_plugins == 0 || w.max_background_plugins > MAX_BACKGROUND_PLUGINS_UPPER_BOUND
    {
        return Err(ConfigError::Invalid {
            field: "workers.max_background_plugins",
            message: format!(
                "max_background_plugins must be between 1 and {MAX_BACKGROUND_PLUGINS_UPPER_BOUND}"
            ),
        });
    }

    for (field, value) in [
        ("workers.start_timeout_secs", w.start_timeout_secs),
        ("workers.poll_interval_ms", w.poll_interval_ms),
        ("workers.shutdown_timeout_secs", w.shutdown_timeout_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::Invalid {
                field,
                message: "must be greater than zero".to_owned(),
            });
        }
    }

    if w
        .worker_program
        .as_deref()
        .is_some_and(|program| program.trim().is_empty())
    {
        return Err(ConfigError::Invalid {
            field: "workers.worker_program",
            message: "worker_program must not be empty when set".to_owned(),
        });
    }

    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    validate_log_level(&config.logging.level)?;

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::Invalid {
            field: "logging.format",
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        });
    }

    Ok(())
}

pub(crate) fn validate_log_level(level: &str) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&level) {
        return Err(ConfigError::Invalid {
            field: "logging.level",
            message: format!(
                "unsupported log level '{level}'; expected one of: {}",
                valid_levels.join(", ")
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Config;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_custom_config_json() {
        assert!(validate_custom_config("").is_ok());
        assert!(validate_custom_config(r#"{"work_limit": 3}"#).is_ok());
        assert!(validate_custom_config("[1, 2]").is_ok());
        assert!(validate_custom_config("work_limit=3").is_err());
    }

    #[test]
    fn test_custom_config_too_long() {
        let long = format!("\"{}\"", "a".repeat(MAX_CONFIG_SIZE));
        let err = validate_custom_config(&long).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_background_plugins() {
        let mut config = Config::default();
        config.workers.max_background_plugins = 0;
        assert!(validate(&config).is_err());
        config.workers.max_background_plugins = MAX_BACKGROUND_PLUGINS_UPPER_BOUND + 1;
        assert!(validate(&config).is_err());
        config.workers.max_background_plugins = MAX_BACKGROUND_PLUGINS_UPPER_BOUND;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_timeouts() {
        let mut config = Config::default();
        config.workers.start_timeout_secs = 0;
        let err = validate(&config).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { field: "workers.start_timeout_secs", .. })
        );
    }

    #[test]
    fn test_empty_worker_program() {
        let mut config = Config::default();
        config.workers.worker_program = Some(String::new());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_logging() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_owned();
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert!(validate(&config).is_err());
    }
}
