//! Host command (`plinth run`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use plinth_config::Config;
use plinth_runtime::{
    DynamicLibraryOpener, LoadReport, LoadedAs, PluginHost, ProcessLauncher, Registration,
    StoreBacking, WorkerEvent, WorkerLauncher, unique_store_name,
};
use plinth_telemetry::LogHandle;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config_bridge;

/// Inputs to [`run_host`].
pub(crate) struct RunOptions {
    /// Loaded configuration.
    pub(crate) config: Config,
    /// File the configuration came from; re-read on SIGHUP.
    pub(crate) config_path: Option<PathBuf>,
    /// Return once no workers remain.
    pub(crate) exit_when_idle: bool,
    /// Handle for changing the log level on reload.
    pub(crate) log_handle: Option<LogHandle>,
}

/// Boot the framework and supervise workers until SIGINT or SIGTERM.
pub(crate) fn run_host(options: RunOptions) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(options))
}

async fn serve(options: RunOptions) -> Result<()> {
    let RunOptions {
        mut config,
        config_path,
        exit_when_idle,
        log_handle,
    } = options;

    let store_name = unique_store_name();
    let program = match &config.workers.worker_program {
        Some(program) => PathBuf::from(program),
        None => std::env::current_exe()?,
    };
    let launcher = ProcessLauncher::new(program, store_name.clone())
        .with_logging(config.logging.level.clone(), config.logging.format.clone());
    let mut host = PluginHost::new(
        config_bridge::to_host_options(&config, StoreBacking::Named(store_name)),
        Arc::new(DynamicLibraryOpener),
        move |_| Arc::new(launcher) as Arc<dyn WorkerLauncher>,
    )?;

    // Handlers go in before any worker exists.
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    println!("{}", "Plinth host starting".cyan().bold());
    let report = host.boot()?;
    print_report(&report);
    let started = host.finish_boot();
    if started > 0 {
        println!("{} background worker(s) started", started.to_string().bold());
    }

    let mut tick = tokio::time::interval(config.workers.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("interrupt received");
                break;
            },
            _ = terminate.recv() => {
                info!("termination requested");
                break;
            },
            _ = hangup.recv() => {
                reload(&mut config, config_path.as_deref(), &mut host, log_handle.as_ref());
            },
            _ = tick.tick() => {
                for event in host.reap() {
                    print_event(&event);
                }
                if exit_when_idle && host.is_idle() {
                    info!("no workers remain");
                    break;
                }
            },
        }
    }

    println!("{}", "Shutting down...".yellow());
    let killed = host.shutdown(config.workers.shutdown_timeout());
    if killed > 0 {
        println!("  {killed} worker(s) killed after the grace period");
    }
    Ok(())
}

/// Re-read the config file, apply what can change at runtime, and rescan.
fn reload(
    config: &mut Config,
    config_path: Option<&Path>,
    host: &mut PluginHost,
    log_handle: Option<&LogHandle>,
) {
    info!("reloading configuration");
    let fresh = match Config::load(config_path) {
        Ok(fresh) => fresh,
        Err(e) => {
            warn!(error = %e, "reload failed; keeping current configuration");
            return;
        },
    };
    let summary = match config.apply_reload(&fresh) {
        Ok(summary) => summary,
        Err(e) => {
            warn!(error = %e, "reloaded configuration rejected");
            return;
        },
    };

    if summary.log_level_changed() {
        if let Some(handle) = log_handle {
            if let Err(e) = handle.set_level(&config.logging.level) {
                warn!(error = %e, "could not apply new log level");
            }
        }
    }
    if summary.custom_config_changed() {
        host.reload(config.plugins.custom_config.clone());
    }

    match host.rescan() {
        Ok(report) => print_report(&report),
        Err(e) => warn!(error = %e, "rescan failed"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

fn print_report(report: &LoadReport) {
    for outcome in &report.outcomes {
        let name = file_name(&outcome.path);
        match &outcome.result {
            Ok(LoadedAs::Inline { outcome }) => {
                let detail = format!("(inline, {})", outcome.state);
                println!("  {} {name} {}", "OK".green(), detail.dimmed());
            },
            Ok(LoadedAs::Background { slot, registration }) => {
                let detail = match registration {
                    Registration::Deferred => format!("(background, slot {slot}, starts after boot)"),
                    Registration::Started { pid: Some(pid) } => {
                        format!("(background, slot {slot}, pid {pid})")
                    },
                    Registration::Started { pid: None } => format!("(background, slot {slot})"),
                };
                println!("  {} {name} {}", "OK".green(), detail.dimmed());
            },
            Err(e) => println!("  {} {name} - {}", "SKIP".yellow(), e.to_string().dimmed()),
        }
    }
    println!(
        "{} loaded, {} skipped",
        report.loaded().to_string().bold(),
        report.skipped()
    );
}

fn print_event(event: &WorkerEvent) {
    match event {
        WorkerEvent::Exited { identity, exit } if exit.is_success() => {
            println!("  {} {identity} finished", "DONE".green());
        },
        WorkerEvent::Exited { identity, exit } => {
            println!("  {} {identity} {}", "FAIL".red(), exit.to_string().dimmed());
        },
        WorkerEvent::RestartScheduled {
            identity, attempt, ..
        } => {
            println!("  {} {identity} restart #{attempt} scheduled", "WAIT".yellow());
        },
        WorkerEvent::Restarted { identity, attempt } => {
            println!("  {} {identity} restarted (#{attempt})", "OK".green());
        },
        WorkerEvent::RestartFailed { identity, error } => {
            println!("  {} {identity} restart failed - {}", "FAIL".red(), error.dimmed());
        },
    }
}
