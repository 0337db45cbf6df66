//! Applying a freshly loaded configuration to a running host.
//!
//! Only `plugins.custom_config` and `logging.level` take effect without a
//! restart. Any other difference is reported and left for the next start.

use tracing::{info, warn};

use crate::error::ConfigResult;
use crate::types::Config;
use crate::validate;

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Fields whose new value is now in effect.
    pub applied: Vec<&'static str>,
    /// Fields that changed on disk but need a restart.
    pub deferred: Vec<&'static str>,
}

impl ReloadSummary {
    /// Whether the custom configuration changed.
    #[must_use]
    pub fn custom_config_changed(&self) -> bool {
        self.applied.contains(&"plugins.custom_config")
    }

    /// Whether the log level changed.
    #[must_use]
    pub fn log_level_changed(&self) -> bool {
        self.applied.contains(&"logging.level")
    }
}

impl Config {
    /// Take the reloadable fields from `fresh`.
    ///
    /// # Errors
    ///
    /// Returns a validation error, leaving `self` untouched, if a reloadable
    /// field in `fresh` is invalid.
    pub fn apply_reload(&mut self, fresh: &Config) -> ConfigResult<ReloadSummary> {
        validate::validate_custom_config(&fresh.plugins.custom_config)?;
        validate::validate_log_level(&fresh.logging.level)?;

        let mut summary = ReloadSummary::default();

        if self.plugins.custom_config != fresh.plugins.custom_config {
            self.plugins.custom_config.clone_from(&fresh.plugins.custom_config);
            summary.applied.push("plugins.custom_config");
        }
        if self.logging.level != fresh.logging.level {
            self.logging.level.clone_from(&fresh.logging.level);
            summary.applied.push("logging.level");
        }

        if self.plugins.directory != fresh.plugins.directory {
            summary.deferred.push("plugins.directory");
        }
        if self.workers != fresh.workers {
            summary.deferred.push("workers");
        }
        if self.logging.format != fresh.logging.format
            || self.logging.directives != fresh.logging.directives
        {
            summary.deferred.push("logging.format/directives");
        }

        for field in &summary.deferred {
            warn!(field, "config change requires a restart; ignoring until then");
        }
        if !summary.applied.is_empty() {
            info!(fields = ?summary.applied, "reloaded configuration");
        }

        Ok(summary)
    }
}
