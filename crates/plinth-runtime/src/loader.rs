//! Directory scan and plugin admission.
//!
//! The scan is sequential: each candidate is admitted or rejected, and an
//! INLINE plugin is run to completion, before the next entry is looked at.
//! Per-plugin failures are logged and recorded in the [`LoadReport`]; only
//! a missing or unreadable directory fails the call.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use plinth_abi::{ConfigRecord, PluginKind};
use tracing::{debug, info, warn};

use crate::descriptor::PluginDescriptor;
use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::PluginIdentity;
use crate::library::LibraryOpener;
use crate::store::SlotId;
use crate::supervisor::{BootPhase, Registration, Supervisor, WorkerSpec};
use crate::work_loop::{LoopOutcome, WorkLoop};

/// File extension a candidate library must carry.
pub const LIBRARY_EXTENSION: &str = std::env::consts::DLL_EXTENSION;

/// What a scan needs from its caller.
pub struct LoadContext<'a> {
    /// Receives BACKGROUND plugins; its store provides their slots.
    pub supervisor: &'a mut Supervisor,
    /// Opens candidate libraries.
    pub opener: &'a dyn LibraryOpener,
    /// Selects the worker registration protocol.
    pub phase: BootPhase,
    /// Custom configuration handed to every plugin.
    pub custom_config: &'a str,
    /// Libraries to pass over without opening.
    pub skip: Option<&'a HashSet<PathBuf>>,
}

/// How an admitted plugin was run.
#[derive(Debug)]
pub enum LoadedAs {
    /// Ran once in the scanning thread.
    Inline {
        /// Result of the single call.
        outcome: LoopOutcome,
    },
    /// Handed to the supervisor.
    Background {
        /// Slot holding the plugin's record.
        slot: SlotId,
        /// Registration result.
        registration: Registration,
    },
}

/// Result for one candidate library.
#[derive(Debug)]
pub struct PluginOutcome {
    /// Library path.
    pub path: PathBuf,
    /// What happened to it.
    pub result: Result<LoadedAs, RuntimeError>,
}

/// Everything a scan did.
#[derive(Debug)]
pub struct LoadReport {
    /// Directory that was scanned.
    pub directory: PathBuf,
    /// One entry per candidate, in scan order.
    pub outcomes: Vec<PluginOutcome>,
}

impl LoadReport {
    /// An empty report, for a host with no plugin directory.
    #[must_use]
    pub fn empty(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            outcomes: Vec::new(),
        }
    }

    /// Plugins that were admitted and run or registered.
    #[must_use]
    pub fn loaded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    /// Candidates that were skipped.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes.len().saturating_sub(self.loaded())
    }

    /// Admitted INLINE plugin paths.
    pub fn inline_paths(&self) -> impl Iterator<Item = &Path> {
        self.outcomes.iter().filter_map(|o| match o.result {
            Ok(LoadedAs::Inline { .. }) => Some(o.path.as_path()),
            _ => None,
        })
    }
}

/// Whether `path` carries the shared-library extension.
#[must_use]
pub fn is_candidate(path: &Path) -> bool {
    path.extension() == Some(OsStr::new(LIBRARY_EXTENSION))
}

/// Candidate libraries in `directory`, sorted by file name.
///
/// # Errors
///
/// [`RuntimeError::DirectoryUnspecified`] for an empty path,
/// [`RuntimeError::DirectoryNotFound`] if it cannot be read.
pub fn candidates(directory: &Path) -> RuntimeResult<Vec<PathBuf>> {
    if directory.as_os_str().is_empty() {
        return Err(RuntimeError::DirectoryUnspecified);
    }

    let entries = fs::read_dir(directory).map_err(|source| RuntimeError::DirectoryNotFound {
        path: directory.to_path_buf(),
        source,
    })?;

    Ok(collect_candidates(directory, entries))
}

fn collect_candidates(
    directory: &Path,
    entries: impl IntoIterator<Item = io::Result<fs::DirEntry>>,
) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "skipping unreadable directory entry");
                continue;
            },
        };
        let path = entry.path();
        if !is_candidate(&path) {
            debug!(path = %path.display(), "skipping non-library entry");
            continue;
        }
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            debug!(path = %path.display(), "skipping directory");
            continue;
        }
        found.push(path);
    }
    found.sort();
    found
}

/// Scan `directory` and admit every conformant plugin.
///
/// # Errors
///
/// [`RuntimeError::DirectoryUnspecified`] for an empty path,
/// [`RuntimeError::DirectoryNotFound`] if it cannot be read. Failures of
/// individual plugins are reported in the [`LoadReport`] instead.
pub fn load_plugins_from_directory(
    directory: &Path,
    ctx: &mut LoadContext<'_>,
) -> RuntimeResult<LoadReport> {
    if directory.as_os_str().is_empty() {
        return Err(RuntimeError::DirectoryUnspecified);
    }
    let directory = std::path::absolute(directory).unwrap_or_else(|_| directory.to_path_buf());

    let found = candidates(&directory)?;
    info!(directory = %directory.display(), candidates = found.len(), phase = ?ctx.phase, "scanning plugin directory");

    let owner_pid = nix::unistd::getpid().as_raw();
    let mut report = LoadReport::empty(&directory);

    for path in found {
        if ctx.skip.is_some_and(|skip| skip.contains(&path)) {
            debug!(path = %path.display(), "already loaded; not reopening");
            continue;
        }

        let result = load_one(&path, ctx, owner_pid);
        match &result {
            Ok(LoadedAs::Inline { outcome }) => {
                info!(path = %path.display(), iterations = outcome.iterations, "inline plugin finished");
            },
            Ok(LoadedAs::Background { slot, registration }) => {
                info!(path = %path.display(), %slot, ?registration, "background plugin registered");
            },
            Err(e) => warn!(path = %path.display(), error = %e, "plugin skipped"),
        }
        report.outcomes.push(PluginOutcome { path, result });
    }

    info!(
        directory = %report.directory.display(),
        loaded = report.loaded(),
        skipped = report.skipped(),
        "plugin scan complete"
    );
    Ok(report)
}

fn load_one(path: &Path, ctx: &mut LoadContext<'_>, owner_pid: i32) -> RuntimeResult<LoadedAs> {
    let identity = PluginIdentity::from_path(path);
    if ctx.supervisor.store().slot_of(&identity).is_some() {
        return Err(RuntimeError::DuplicateIdentity {
            identity: identity.to_string(),
        });
    }

    let library = ctx.opener.open(path)?;
    let descriptor = PluginDescriptor::admit(library)?;

    let record = match ConfigRecord::new(
        identity.name(),
        &path.to_string_lossy(),
        ctx.custom_config,
        owner_pid,
    ) {
        Ok(record) => record,
        Err(e) => {
            if descriptor.kind() == PluginKind::Inline {
                descriptor.cleanup();
            }
            return Err(e.into());
        },
    };

    match descriptor.kind() {
        PluginKind::Inline => {
            let outcome = WorkLoop::new(&record).run_inline(
                |r: &ConfigRecord| descriptor.work(r),
                || descriptor.cleanup(),
            );
            drop(descriptor);
            Ok(LoadedAs::Inline { outcome })
        },
        PluginKind::Background => {
            let store = ctx.supervisor.store().clone();
            let slot = store.acquire(&identity)?.publish(&record);
            let spec = WorkerSpec {
                identity: identity.clone(),
                slot,
            };
            let registered = ctx.supervisor.register(ctx.phase, spec);
            drop(descriptor);
            match registered {
                Ok(registration) => Ok(LoadedAs::Background { slot, registration }),
                Err(e) => {
                    if store.slot_of(&identity) == Some(slot) {
                        store.release(slot);
                    }
                    Err(e)
                },
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_int;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::library::SymbolTable;
    use crate::store::{SharedConfigStore, StoreLayout};
    use crate::supervisor::SupervisorConfig;
    use crate::testing::{EventLog, FakeOpener, RecordingLauncher};

    fn supervisor(capacity: usize) -> (Supervisor, Arc<RecordingLauncher>) {
        let store = Arc::new(
            SharedConfigStore::create(StoreLayout::for_capacity(capacity).unwrap(), None).unwrap(),
        );
        let launcher = Arc::new(RecordingLauncher::new(Arc::clone(&store)));
        let config = SupervisorConfig {
            max_workers: capacity,
            start_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(5),
            ..SupervisorConfig::default()
        };
        (Supervisor::new(store, launcher.clone(), config), launcher)
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), b"").unwrap();
        }
    }

    fn scan(
        dir: &Path,
        supervisor: &mut Supervisor,
        opener: &FakeOpener,
        phase: BootPhase,
    ) -> RuntimeResult<LoadReport> {
        load_plugins_from_directory(
            dir,
            &mut LoadContext {
                supervisor,
                opener,
                phase,
                custom_config: "{\"k\":1}",
                skip: None,
            },
        )
    }

    unsafe extern "C" fn init_ok() -> c_int {
        0
    }
    unsafe extern "C" fn inline_type() -> c_int {
        0
    }
    unsafe extern "C" fn background_type() -> c_int {
        1
    }

    // Inline plugin that logs its calls into ORDER_EVENTS.
    static ORDER_EVENTS: EventLog = EventLog::new();
    unsafe extern "C" fn order_work(record: *const ConfigRecord) -> c_int {
        let name = unsafe { (*record).plugin_name().into_owned() };
        ORDER_EVENTS.push(format!("work {name}"));
        7
    }
    unsafe extern "C" fn order_cleanup() {
        ORDER_EVENTS.push("cleanup".to_string());
    }
    unsafe extern "C" fn order_bg_work(_: *const ConfigRecord) -> c_int {
        ORDER_EVENTS.push("background work".to_string());
        1
    }

    #[test]
    fn test_empty_path_is_unspecified() {
        static EVENTS: EventLog = EventLog::new();
        let (mut sup, _) = supervisor(1);
        let opener = FakeOpener::new(&EVENTS);
        let err = scan(Path::new(""), &mut sup, &opener, BootPhase::Preload).unwrap_err();
        assert!(matches!(err, RuntimeError::DirectoryUnspecified));
    }

    #[test]
    fn test_missing_directory_opens_nothing() {
        static EVENTS: EventLog = EventLog::new();
        let (mut sup, _) = supervisor(1);
        let opener = FakeOpener::new(&EVENTS);
        let err = scan(
            Path::new("/nonexistent/plinth-plugins"),
            &mut sup,
            &opener,
            BootPhase::Preload,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::DirectoryNotFound { .. }));
        assert!(EVENTS.snapshot().is_empty());
    }

    #[test]
    fn test_only_library_suffix_is_opened() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            0
        }
        unsafe extern "C" fn cleanup() {}

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["valid.so", "notes.txt", "libstatic.a"]);
        let opener = FakeOpener::new(&EVENTS).with_library(
            "valid.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(inline_type),
                work: Some(work),
                cleanup: Some(cleanup),
            },
        );
        let (mut sup, _) = supervisor(1);
        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Preload).unwrap();

        assert_eq!(opener.opened(), vec!["valid.so"]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.loaded(), 1);
    }

    #[test]
    fn test_unreadable_entry_does_not_abort_scan() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["b.so", "a.so", "readme.md"]);
        let entries = std::iter::once(Err(io::Error::other("stale entry")))
            .chain(fs::read_dir(dir.path()).unwrap())
            .chain(std::iter::once(Err(io::Error::other("stale entry"))));

        let found = collect_candidates(dir.path(), entries);
        assert_eq!(found, vec![dir.path().join("a.so"), dir.path().join("b.so")]);
    }

    #[test]
    fn test_partial_library_is_closed_and_skipped() {
        static EVENTS: EventLog = EventLog::new();
        static CALLS: AtomicU32 = AtomicU32::new(0);
        unsafe extern "C" fn counting_init() -> c_int {
            CALLS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["partial.so"]);
        let opener = FakeOpener::new(&EVENTS).with_library(
            "partial.so",
            SymbolTable {
                init: Some(counting_init),
                get_type: None,
                work: None,
                cleanup: None,
            },
        );
        let (mut sup, _) = supervisor(1);
        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Preload).unwrap();

        assert!(matches!(
            report.outcomes[0].result,
            Err(RuntimeError::MissingSymbols { .. })
        ));
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(EVENTS.snapshot(), vec!["open partial.so", "close partial.so"]);
    }

    #[test]
    fn test_inline_completes_before_scan_advances() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a_inline.so", "b_background.so"]);
        let opener = FakeOpener::new(&ORDER_EVENTS)
            .with_library(
                "a_inline.so",
                SymbolTable {
                    init: Some(init_ok),
                    get_type: Some(inline_type),
                    work: Some(order_work),
                    cleanup: Some(order_cleanup),
                },
            )
            .with_library(
                "b_background.so",
                SymbolTable {
                    init: Some(init_ok),
                    get_type: Some(background_type),
                    work: Some(order_bg_work),
                    cleanup: Some(order_cleanup),
                },
            );
        let (mut sup, launcher) = supervisor(2);
        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Preload).unwrap();

        assert_eq!(
            ORDER_EVENTS.snapshot(),
            vec![
                "open a_inline.so",
                "work a_inline.so",
                "cleanup",
                "close a_inline.so",
                "open b_background.so",
                "close b_background.so",
            ]
        );
        assert_eq!(report.loaded(), 2);
        match &report.outcomes[0].result {
            Ok(LoadedAs::Inline { outcome }) => {
                assert_eq!(outcome.iterations, 1);
                assert_eq!(outcome.reason, crate::work_loop::StopReason::Completed(7));
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            report.outcomes[1].result,
            Ok(LoadedAs::Background {
                registration: Registration::Deferred,
                ..
            })
        ));
        assert!(launcher.launched().is_empty());
        assert_eq!(sup.pending_workers(), 1);
    }

    #[test]
    fn test_background_slot_carries_record() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            1
        }
        unsafe extern "C" fn cleanup() {
            EVENTS.push("cleanup".to_string());
        }

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["ticker.so"]);
        let opener = FakeOpener::new(&EVENTS).with_library(
            "ticker.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(background_type),
                work: Some(work),
                cleanup: Some(cleanup),
            },
        );
        let (mut sup, launcher) = supervisor(1);
        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Runtime).unwrap();

        let Ok(LoadedAs::Background { slot, registration }) = &report.outcomes[0].result else {
            panic!("expected background registration");
        };
        assert!(matches!(registration, Registration::Started { .. }));
        assert_eq!(launcher.launched().len(), 1);

        let record = sup.store().snapshot(*slot).unwrap();
        assert_eq!(record.plugin_name(), "ticker.so");
        assert!(record.plugin_path().ends_with("/ticker.so"));
        assert_eq!(record.custom_config(), "{\"k\":1}");
        assert_eq!(record.owner_pid(), nix::unistd::getpid().as_raw());
        assert!(!EVENTS.snapshot().contains(&"cleanup".to_string()));
    }

    #[test]
    fn test_registration_failure_releases_slot() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            1
        }
        unsafe extern "C" fn cleanup() {}
        let table = SymbolTable {
            init: Some(init_ok),
            get_type: Some(background_type),
            work: Some(work),
            cleanup: Some(cleanup),
        };

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a.so", "b.so"]);
        let opener = FakeOpener::new(&EVENTS)
            .with_library("a.so", table)
            .with_library("b.so", table);

        // Two store slots, one worker.
        let store = Arc::new(
            SharedConfigStore::create(StoreLayout::for_capacity(2).unwrap(), None).unwrap(),
        );
        let launcher = Arc::new(RecordingLauncher::new(Arc::clone(&store)));
        let config = SupervisorConfig {
            max_workers: 1,
            ..SupervisorConfig::default()
        };
        let mut sup = Supervisor::new(Arc::clone(&store), launcher, config);

        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Preload).unwrap();
        assert_eq!(report.loaded(), 1);
        assert!(matches!(
            report.outcomes[1].result,
            Err(RuntimeError::WorkerCapacityExhausted { limit: 1 })
        ));
        assert_eq!(store.active_slots(), 1);
    }

    #[test]
    fn test_running_plugin_is_not_reopened() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            1
        }
        unsafe extern "C" fn cleanup() {}

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["bg.so"]);
        let opener = FakeOpener::new(&EVENTS).with_library(
            "bg.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(background_type),
                work: Some(work),
                cleanup: Some(cleanup),
            },
        );
        let (mut sup, _) = supervisor(2);
        scan(dir.path(), &mut sup, &opener, BootPhase::Preload).unwrap();
        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Runtime).unwrap();

        assert!(matches!(
            report.outcomes[0].result,
            Err(RuntimeError::DuplicateIdentity { .. })
        ));
        assert_eq!(opener.opened().len(), 1);
    }

    #[test]
    fn test_open_failure_does_not_abort_scan() {
        static EVENTS: EventLog = EventLog::new();
        unsafe extern "C" fn work(_: *const ConfigRecord) -> c_int {
            0
        }
        unsafe extern "C" fn cleanup() {}

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), &["a_broken.so", "b_good.so"]);
        let opener = FakeOpener::new(&EVENTS).with_library(
            "b_good.so",
            SymbolTable {
                init: Some(init_ok),
                get_type: Some(inline_type),
                work: Some(work),
                cleanup: Some(cleanup),
            },
        );
        let (mut sup, _) = supervisor(1);
        let report = scan(dir.path(), &mut sup, &opener, BootPhase::Preload).unwrap();

        assert!(matches!(
            report.outcomes[0].result,
            Err(RuntimeError::LibraryOpen { .. })
        ));
        assert!(report.outcomes[1].result.is_ok());
        assert_eq!(report.skipped(), 1);
    }
}
