//! The framework as a host embeds it.
//!
//! [`PluginHost`] sizes and creates the configuration store, scans the
//! plugin directory during boot, starts deferred workers once boot is done,
//! and afterwards supervises workers and rescans on reload.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::PluginIdentity;
use crate::library::LibraryOpener;
use crate::loader::{LoadContext, LoadReport, load_plugins_from_directory};
use crate::store::{SharedConfigStore, StoreLayout};
use crate::supervisor::{BootPhase, Supervisor, SupervisorConfig, WorkerEvent, WorkerLauncher};

/// Where the configuration store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBacking {
    /// A named POSIX shared memory object that worker processes attach to.
    Named(String),
    /// An anonymous mapping, for in-process workers.
    Anonymous,
}

/// Host settings.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Plugin directory. `None` means no plugins are loaded.
    pub directory: Option<PathBuf>,
    /// Custom configuration handed to every plugin.
    pub custom_config: String,
    /// Worker supervision settings; `max_workers` also sizes the store.
    pub supervisor: SupervisorConfig,
    /// Store backing.
    pub store: StoreBacking,
}

/// A running plugin framework.
pub struct PluginHost {
    directory: Option<PathBuf>,
    custom_config: String,
    phase: BootPhase,
    opener: Arc<dyn LibraryOpener>,
    supervisor: Supervisor,
    inline_done: HashSet<PathBuf>,
}

impl PluginHost {
    /// Size and create the store, then build the supervisor around it.
    /// `make_launcher` receives the store so in-process launchers can share
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] if the store cannot be created.
    pub fn new<F>(
        options: HostOptions,
        opener: Arc<dyn LibraryOpener>,
        make_launcher: F,
    ) -> RuntimeResult<Self>
    where
        F: FnOnce(&Arc<SharedConfigStore>) -> Arc<dyn WorkerLauncher>,
    {
        let layout = StoreLayout::for_capacity(options.supervisor.max_workers)?;
        let name = match &options.store {
            StoreBacking::Named(name) => Some(name.as_str()),
            StoreBacking::Anonymous => None,
        };
        let store = Arc::new(SharedConfigStore::create(layout, name)?);
        let launcher = make_launcher(&store);

        Ok(Self {
            directory: options.directory,
            custom_config: options.custom_config,
            phase: BootPhase::Preload,
            opener,
            supervisor: Supervisor::new(store, launcher, options.supervisor),
            inline_done: HashSet::new(),
        })
    }

    /// Current boot phase.
    #[must_use]
    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    /// The configuration store.
    #[must_use]
    pub fn store(&self) -> &Arc<SharedConfigStore> {
        self.supervisor.store()
    }

    /// Custom configuration handed to newly loaded plugins.
    #[must_use]
    pub fn custom_config(&self) -> &str {
        &self.custom_config
    }

    /// The supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Preload scan. BACKGROUND plugins are registered statically and start
    /// in [`finish_boot`](Self::finish_boot).
    ///
    /// # Errors
    ///
    /// [`RuntimeError::DirectoryNotFound`] if the configured directory cannot
    /// be read. A host without a directory loads nothing.
    pub fn boot(&mut self) -> RuntimeResult<LoadReport> {
        self.scan(BootPhase::Preload)
    }

    /// Leave preload: start deferred workers and switch to dynamic
    /// registration. Returns how many workers started.
    pub fn finish_boot(&mut self) -> usize {
        let started = self.supervisor.start_pending();
        self.phase = BootPhase::Runtime;
        info!(started, "boot complete");
        started
    }

    /// Runtime scan. INLINE plugins that already ran and BACKGROUND plugins
    /// whose worker is still registered are not loaded again.
    ///
    /// # Errors
    ///
    /// As for [`boot`](Self::boot).
    pub fn rescan(&mut self) -> RuntimeResult<LoadReport> {
        self.scan(BootPhase::Runtime)
    }

    fn scan(&mut self, phase: BootPhase) -> RuntimeResult<LoadReport> {
        let Some(directory) = self.directory.clone() else {
            info!("no plugin directory configured; no plugins loaded");
            return Ok(LoadReport::empty(PathBuf::new()));
        };
        let report = load_plugins_from_directory(
            &directory,
            &mut LoadContext {
                supervisor: &mut self.supervisor,
                opener: self.opener.as_ref(),
                phase,
                custom_config: &self.custom_config,
                skip: Some(&self.inline_done),
            },
        );
        let report = match report {
            Err(RuntimeError::DirectoryUnspecified) => {
                info!("plugin directory is empty; no plugins loaded");
                return Ok(LoadReport::empty(PathBuf::new()));
            },
            other => other?,
        };
        self.inline_done
            .extend(report.inline_paths().map(Path::to_path_buf));
        Ok(report)
    }

    /// Replace the custom configuration for plugins loaded from now on.
    /// Published slots are never rewritten.
    pub fn reload(&mut self, custom_config: impl Into<String>) {
        let custom_config = custom_config.into();
        if custom_config != self.custom_config {
            info!("custom configuration updated for subsequently loaded plugins");
            self.custom_config = custom_config;
        }
    }

    /// Collect worker exits and run due restarts.
    pub fn reap(&mut self) -> Vec<WorkerEvent> {
        self.supervisor.reap()
    }

    /// Ask one BACKGROUND plugin to stop between iterations.
    pub fn request_stop(&mut self, plugin_path: &Path) -> bool {
        let path = std::path::absolute(plugin_path).unwrap_or_else(|_| plugin_path.to_path_buf());
        self.supervisor.request_stop(&PluginIdentity::from_path(&path))
    }

    /// Stop all workers; see [`Supervisor::shutdown`].
    pub fn shutdown(&mut self, grace: Duration) -> usize {
        self.supervisor.shutdown(grace)
    }

    /// Nothing left to supervise.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.supervisor.is_idle()
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("directory", &self.directory)
            .field("phase", &self.phase)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_int;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Instant;

    use plinth_abi::ConfigRecord;

    use super::*;
    use crate::library::SymbolTable;
    use crate::supervisor::Registration;
    use crate::testing::{EventLog, FakeOpener, ThreadLauncher};

    unsafe extern "C" fn init_ok() -> c_int {
        0
    }
    unsafe extern "C" fn background_type() -> c_int {
        1
    }
    unsafe extern "C" fn inline_type() -> c_int {
        0
    }
    unsafe extern "C" fn noop_cleanup() {}

    fn options(directory: Option<PathBuf>, max_workers: usize) -> HostOptions {
        HostOptions {
            directory,
            custom_config: String::new(),
            supervisor: SupervisorConfig {
                max_workers,
                start_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(5),
                ..SupervisorConfig::default()
            },
            store: StoreBacking::Anonymous,
        }
    }

    fn host(options: HostOptions, opener: FakeOpener) -> PluginHost {
        let opener: Arc<dyn LibraryOpener> = Arc::new(opener);
        let worker_opener = Arc::clone(&opener);
        PluginHost::new(options, opener, move |store| -> Arc<dyn WorkerLauncher> {
            Arc::new(ThreadLauncher::new(Arc::clone(store), worker_opener))
        })
        .unwrap()
    }

    fn drive_until_idle(host: &mut PluginHost) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !host.is_idle() {
            assert!(Instant::now() < deadline, "workers did not finish");
            host.reap();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_no_directory_loads_nothing() {
        static EVENTS: EventLog = EventLog::new();
        let mut host = host(options(None, 1), FakeOpener::new(&EVENTS));
        let report = host.boot().unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(host.finish_boot(), 0);
        assert_eq!(host.phase(), BootPhase::Runtime);
    }

    #[test]
    fn test_missing_directory_is_reported() {
        static EVENTS: EventLog = EventLog::new();
        let mut host = host(
            options(Some(PathBuf::from("/nonexistent/plinth")), 1),
            FakeOpener::new(&EVENTS),
        );
        assert!(matches!(
            host.boot(),
            Err(RuntimeError::DirectoryNotFound { .. })
        ));
    }

    // Each plugin records exactly what it read from its own record.
    static SEEN: Mutex<Vec<(String, String, String)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record_and_stop(record: *const ConfigRecord) -> c_int {
        let record = unsafe { &*record };
        // Hold the loop open briefly so both workers overlap.
        std::thread::sleep(Duration::from_millis(20));
        SEEN.lock().unwrap().push((
            record.plugin_name().into_owned(),
            record.plugin_path().into_owned(),
            record.custom_config().into_owned(),
        ));
        1
    }

    #[test]
    fn test_concurrent_background_plugins_see_only_their_own_slot() {
        static EVENTS: EventLog = EventLog::new();
        let table = SymbolTable {
            init: Some(init_ok),
            get_type: Some(background_type),
            work: Some(record_and_stop),
            cleanup: Some(noop_cleanup),
        };
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.so"), b"").unwrap();
        fs::write(dir.path().join("beta.so"), b"").unwrap();

        let opener = FakeOpener::new(&EVENTS)
            .with_library("alpha.so", table)
            .with_library("beta.so", table);
        let mut opts = options(Some(dir.path().to_path_buf()), 2);
        opts.custom_config = r#"{"gen":1}"#.to_string();
        let mut host = host(opts, opener);

        let report = host.boot().unwrap();
        assert_eq!(report.loaded(), 2);
        // Change the custom config after publication: running plugins keep
        // their snapshot.
        host.reload(r#"{"gen":2}"#);
        assert_eq!(host.finish_boot(), 2);
        drive_until_idle(&mut host);

        let mut seen = SEEN.lock().unwrap().clone();
        seen.sort();
        let dir_str = std::path::absolute(dir.path()).unwrap();
        assert_eq!(
            seen,
            vec![
                (
                    "alpha.so".to_string(),
                    dir_str.join("alpha.so").to_string_lossy().into_owned(),
                    r#"{"gen":1}"#.to_string()
                ),
                (
                    "beta.so".to_string(),
                    dir_str.join("beta.so").to_string_lossy().into_owned(),
                    r#"{"gen":1}"#.to_string()
                ),
            ]
        );
        assert_eq!(host.store().active_slots(), 0);
    }

    #[test]
    fn test_rescan_skips_inline_that_already_ran() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            EVENTS.push("work".to_string());
            1
        }
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("once.so"), b"").unwrap();
        let opener = FakeOpener::new(&EVENTS).with_library(
            "once.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(inline_type),
                work: Some(work),
                cleanup: Some(noop_cleanup),
            },
        );
        let mut host = host(options(Some(dir.path().to_path_buf()), 1), opener);

        host.boot().unwrap();
        host.finish_boot();
        let report = host.rescan().unwrap();
        assert!(report.outcomes.is_empty());
        let works = EVENTS.snapshot().iter().filter(|e| *e == "work").count();
        assert_eq!(works, 1);
    }

    #[test]
    fn test_runtime_rescan_starts_new_plugin_immediately() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            1
        }
        let dir = tempfile::tempdir().unwrap();
        let opener = FakeOpener::new(&EVENTS).with_library(
            "late.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(background_type),
                work: Some(work),
                cleanup: Some(noop_cleanup),
            },
        );
        let mut host = host(options(Some(dir.path().to_path_buf()), 1), opener);
        host.boot().unwrap();
        host.finish_boot();

        fs::write(dir.path().join("late.so"), b"").unwrap();
        let report = host.rescan().unwrap();
        assert!(matches!(
            report.outcomes[0].result,
            Ok(crate::loader::LoadedAs::Background {
                registration: Registration::Started { .. },
                ..
            })
        ));
        drive_until_idle(&mut host);
    }

    #[test]
    fn test_request_stop_accepts_relative_path() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn spin(_: *const ConfigRecord) -> c_int {
            std::thread::sleep(Duration::from_millis(2));
            0
        }
        let dir = tempfile::Builder::new()
            .prefix(".plinth-stop")
            .tempdir_in(".")
            .unwrap();
        let plugin = dir.path().join("spin.so");
        assert!(plugin.is_relative());
        fs::write(&plugin, b"").unwrap();
        let opener = FakeOpener::new(&EVENTS).with_library(
            "spin.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(background_type),
                work: Some(spin),
                cleanup: Some(noop_cleanup),
            },
        );
        let mut host = host(options(Some(dir.path().to_path_buf()), 1), opener);
        host.boot().unwrap();
        assert_eq!(host.finish_boot(), 1);

        assert!(!host.request_stop(Path::new("elsewhere/spin.so")));
        assert!(host.request_stop(&plugin));
        drive_until_idle(&mut host);
        assert_eq!(host.store().active_slots(), 0);
    }
}
