//! Bridge between `plinth_config::Config` and the runtime and telemetry
//! types.
//!
//! `plinth-config` has no runtime dependency, so the conversions live here
//! in the binary.

use plinth_config::{Config, RestartPolicyConfig};
use plinth_runtime::{HostOptions, RestartPolicy, StoreBacking, SupervisorConfig};
use plinth_telemetry::{LogConfig, LogFormat};

/// Convert config to [`LogConfig`]. Unknown formats fall back to compact.
#[must_use]
pub fn to_log_config(cfg: &Config) -> LogConfig {
    let format = cfg.logging.format.parse().unwrap_or(LogFormat::Compact);
    LogConfig::new(&cfg.logging.level)
        .with_format(format)
        .with_directives(cfg.logging.directives.iter())
}

/// Convert the `[workers]` section to a [`SupervisorConfig`].
#[must_use]
pub fn to_supervisor_config(cfg: &Config) -> SupervisorConfig {
    let workers = &cfg.workers;
    let restart = match workers.restart {
        RestartPolicyConfig::Never => RestartPolicy::Never,
        RestartPolicyConfig::OnFailure { max_retries } => RestartPolicy::OnFailure { max_retries },
        RestartPolicyConfig::Always => RestartPolicy::Always,
    };

    SupervisorConfig {
        max_workers: usize::try_from(workers.max_background_plugins).unwrap_or(usize::MAX),
        start_timeout: workers.start_timeout(),
        poll_interval: workers.poll_interval(),
        restart,
        restart_delay: workers.restart_delay(),
    }
}

/// Host options for a host whose store lives in `store`.
#[must_use]
pub fn to_host_options(cfg: &Config, store: StoreBacking) -> HostOptions {
    HostOptions {
        directory: cfg.plugins.directory_path(),
        custom_config: cfg.plugins.custom_config.clone(),
        supervisor: to_supervisor_config(cfg),
        store,
    }
}
