//! Configuration struct definitions.
//!
//! Every section uses `#[serde(default)]` so a config file only needs the
//! fields it overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin discovery and the shared custom configuration.
    pub plugins: PluginsSection,
    /// Background worker limits and lifecycle policy.
    pub workers: WorkersSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Where plugins come from and what they are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directory scanned for plugin libraries. Empty disables loading.
    /// Read at startup only.
    pub directory: String,
    /// JSON text copied into every plugin's record. Reloadable.
    pub custom_config: String,
}

impl PluginsSection {
    /// The plugin directory, or `None` when loading is disabled.
    #[must_use]
    pub fn directory_path(&self) -> Option<PathBuf> {
        if self.directory.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.directory))
        }
    }
}

// ---------------------------------------------------------------------------
// WorkersSection
// ---------------------------------------------------------------------------

/// Background worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Maximum number of concurrently active BACKGROUND plugins. Also the
    /// number of shared configuration slots.
    pub max_background_plugins: u32,
    /// How long runtime registration waits for a worker to report started.
    pub start_timeout_secs: u64,
    /// Poll interval used while waiting on workers.
    pub poll_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL at shutdown.
    pub shutdown_timeout_secs: u64,
    /// What to do when a worker exits.
    pub restart: RestartPolicyConfig,
    /// Delay before a worker is restarted.
    pub restart_delay_secs: u64,
    /// Program launched as the worker. Defaults to the running executable.
    pub worker_program: Option<String>,
}

impl WorkersSection {
    /// Startup wait bound as a [`Duration`].
    #[must_use]
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Restart delay as a [`Duration`].
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            max_background_plugins: 8,
            start_timeout_secs: 10,
            poll_interval_ms: 50,
            shutdown_timeout_secs: 5,
            restart: RestartPolicyConfig::default(),
            restart_delay_secs: 1,
            worker_program: None,
        }
    }
}

/// Policy for restarting a worker when it exits (config-layer mirror).
///
/// The runtime converts this into its own restart policy type so this crate
/// stays free of runtime dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicyConfig {
    /// Never restart (default).
    #[default]
    Never,
    /// Restart after a failed exit, up to `max_retries` times.
    OnFailure {
        /// Maximum number of restart attempts.
        #[serde(default = "default_max_retries")]
        max_retries: u32,
    },
    /// Restart after every exit, including a plugin-requested stop.
    Always,
}

fn default_max_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`). Reloadable.
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["plinth_runtime=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_forms() {
        #[derive(Deserialize)]
        struct Wrapper {
            restart: RestartPolicyConfig,
        }

        let never: Wrapper = toml::from_str(r#"restart = "never""#).unwrap();
        assert_eq!(never.restart, RestartPolicyConfig::Never);

        let always: Wrapper = toml::from_str(r#"restart = "always""#).unwrap();
        assert_eq!(always.restart, RestartPolicyConfig::Always);

        let retry: Wrapper =
            toml::from_str("restart = { on_failure = { max_retries = 5 } }").unwrap();
        assert_eq!(
            retry.restart,
            RestartPolicyConfig::OnFailure { max_retries: 5 }
        );

        let retry_default: Wrapper = toml::from_str("restart = { on_failure = {} }").unwrap();
        assert_eq!(
            retry_default.restart,
            RestartPolicyConfig::OnFailure { max_retries: 3 }
        );
    }

    #[test]
    fn test_directory_path() {
        let mut plugins = PluginsSection::default();
        assert!(plugins.directory_path().is_none());
        plugins.directory = "  ".to_owned();
        assert!(plugins.directory_path().is_none());
        plugins.directory = "/opt/plugins".to_owned();
        assert_eq!(plugins.directory_path(), Some(PathBuf::from("/opt/plugins")));
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config: Config = toml::from_str("[workers]\nmax_background_plugins = 2\n").unwrap();
        assert_eq!(config.workers.max_background_plugins, 2);
        assert_eq!(config.workers.start_timeout_secs, 10);
        assert_eq!(config.logging.level, "info");
    }
}
