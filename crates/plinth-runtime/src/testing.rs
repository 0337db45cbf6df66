//! In-process stand-ins for `dlopen` and worker processes.
//!
//! Compiled for this crate's tests and for dependents that enable the
//! `test-support` feature.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::error::{RuntimeError, RuntimeResult};
use crate::library::{LibraryOpener, PluginLibrary, SymbolTable};
use crate::store::{SharedConfigStore, SlotId};
use crate::supervisor::{WorkerExit, WorkerLauncher, WorkerProcess, WorkerSpec};
use crate::worker::run_worker;

/// Ordered log of test events. Usable as a `static`, so plain
/// `extern "C"` functions can write to it too.
#[derive(Debug, Default)]
pub struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    /// An empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    /// Append an event.
    pub fn push(&self, event: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.into());
    }

    /// Copy of all events so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A library whose symbols are Rust function pointers. Logs
/// `close <file>` when dropped.
pub struct FakeLibrary {
    path: PathBuf,
    symbols: SymbolTable,
    closed: Arc<AtomicBool>,
    events: Option<&'static EventLog>,
}

impl FakeLibrary {
    /// A fake library at `path`.
    #[must_use]
    pub fn boxed(path: impl Into<PathBuf>, symbols: SymbolTable) -> Box<dyn PluginLibrary> {
        Self::tracked(path, symbols).0
    }

    /// A fake library plus a flag that turns true once it is closed.
    #[must_use]
    pub fn tracked(
        path: impl Into<PathBuf>,
        symbols: SymbolTable,
    ) -> (Box<dyn PluginLibrary>, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let library = Self {
            path: path.into(),
            symbols,
            closed: Arc::clone(&closed),
            events: None,
        };
        (Box::new(library), closed)
    }
}

impl PluginLibrary for FakeLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbols(&self) -> SymbolTable {
        self.symbols
    }
}

impl Drop for FakeLibrary {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(events) = self.events {
            events.push(format!("close {}", file_name(&self.path)));
        }
    }
}

/// Opens [`FakeLibrary`]s registered by file name; any other path fails to
/// open. Logs `open <file>` for every attempt.
pub struct FakeOpener {
    libraries: HashMap<String, SymbolTable>,
    events: &'static EventLog,
}

impl FakeOpener {
    /// An opener that knows no libraries yet.
    #[must_use]
    pub fn new(events: &'static EventLog) -> Self {
        Self {
            libraries: HashMap::new(),
            events,
        }
    }

    /// Register a library under its file name.
    #[must_use]
    pub fn with_library(mut self, file_name: &str, symbols: SymbolTable) -> Self {
        self.libraries.insert(file_name.to_string(), symbols);
        self
    }

    /// File names of every open attempt, in order.
    #[must_use]
    pub fn opened(&self) -> Vec<String> {
        self.events
            .snapshot()
            .into_iter()
            .filter_map(|e| e.strip_prefix("open ").map(str::to_string))
            .collect()
    }
}

impl LibraryOpener for FakeOpener {
    fn open(&self, path: &Path) -> RuntimeResult<Box<dyn PluginLibrary>> {
        let name = file_name(path);
        self.events.push(format!("open {name}"));
        let symbols = self
            .libraries
            .get(&name)
            .copied()
            .ok_or_else(|| RuntimeError::LibraryOpen {
                path: path.to_path_buf(),
                message: "no such fake library".to_string(),
            })?;
        Ok(Box::new(FakeLibrary {
            path: path.to_path_buf(),
            symbols,
            closed: Arc::new(AtomicBool::new(false)),
            events: Some(self.events),
        }))
    }
}

/// Runs each worker on a thread of this process. Terminating a worker
/// raises its interrupt; killing it does the same and then joins.
pub struct ThreadLauncher {
    store: Arc<SharedConfigStore>,
    opener: Arc<dyn LibraryOpener>,
}

impl ThreadLauncher {
    /// Workers read from `store` and open libraries through `opener`.
    #[must_use]
    pub fn new(store: Arc<SharedConfigStore>, opener: Arc<dyn LibraryOpener>) -> Self {
        Self { store, opener }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, spec: &WorkerSpec) -> RuntimeResult<Box<dyn WorkerProcess>> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(&self.store);
        let opener = Arc::clone(&self.opener);
        let flag = Arc::clone(&interrupt);
        let slot = spec.slot;
        let handle = std::thread::Builder::new()
            .name(format!("plinth-worker-{}", slot.index()))
            .spawn(move || run_worker(&store, slot, opener.as_ref(), &flag))
            .map_err(|e| RuntimeError::WorkerSpawn {
                plugin: spec.identity.to_string(),
                message: e.to_string(),
            })?;
        Ok(Box::new(ThreadWorker {
            handle: Some(handle),
            interrupt,
            exit: None,
        }))
    }
}

struct ThreadWorker {
    handle: Option<JoinHandle<i32>>,
    interrupt: Arc<AtomicBool>,
    exit: Option<WorkerExit>,
}

impl ThreadWorker {
    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // A panicking worker thread reports like an aborted process.
            self.exit = Some(handle.join().map_or(WorkerExit::Signal(6), WorkerExit::Code));
        }
    }
}

impl WorkerProcess for ThreadWorker {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> RuntimeResult<Option<WorkerExit>> {
        if self.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            self.join();
        }
        Ok(self.exit)
    }

    fn terminate(&mut self) -> RuntimeResult<()> {
        self.interrupt.store(true, Ordering::Release);
        Ok(())
    }

    fn kill(&mut self) -> RuntimeResult<()> {
        self.interrupt.store(true, Ordering::Release);
        self.join();
        Ok(())
    }
}

/// Scripted behaviour for [`RecordingLauncher`] workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerScript {
    /// Reports started immediately; exits when terminated or finished.
    #[default]
    Starts,
    /// Never reports started.
    NeverStarts,
    /// Exits with the given code before reporting started.
    ExitsBeforeStart(i32),
    /// The launch itself fails.
    SpawnFails,
    /// Reports started and ignores terminate; only kill ends it.
    IgnoresTerminate,
}

type ExitTable = Arc<Mutex<HashMap<SlotId, WorkerExit>>>;

/// Records launches and simulates workers without running any plugin code.
/// A started worker marks its slot running, like a real one.
pub struct RecordingLauncher {
    store: Arc<SharedConfigStore>,
    script: WorkerScript,
    launched: Mutex<Vec<WorkerSpec>>,
    exits: ExitTable,
}

impl RecordingLauncher {
    /// Launcher whose workers report started at once.
    #[must_use]
    pub fn new(store: Arc<SharedConfigStore>) -> Self {
        Self {
            store,
            script: WorkerScript::default(),
            launched: Mutex::new(Vec::new()),
            exits: Arc::default(),
        }
    }

    /// Use `script` for every worker.
    #[must_use]
    pub fn with_script(mut self, script: WorkerScript) -> Self {
        self.script = script;
        self
    }

    /// Every spec launched so far.
    #[must_use]
    pub fn launched(&self) -> Vec<WorkerSpec> {
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make the worker on `slot` exit with `exit`.
    pub fn finish(&self, slot: SlotId, exit: WorkerExit) {
        self.exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slot, exit);
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn launch(&self, spec: &WorkerSpec) -> RuntimeResult<Box<dyn WorkerProcess>> {
        if self.script == WorkerScript::SpawnFails {
            return Err(RuntimeError::WorkerSpawn {
                plugin: spec.identity.to_string(),
                message: "scripted spawn failure".to_string(),
            });
        }
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        self.exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&spec.slot);

        match self.script {
            WorkerScript::Starts | WorkerScript::IgnoresTerminate => {
                self.store
                    .mark_running(spec.slot, nix::unistd::getpid().as_raw())?;
            },
            WorkerScript::ExitsBeforeStart(code) => {
                self.finish(spec.slot, WorkerExit::Code(code));
            },
            WorkerScript::NeverStarts | WorkerScript::SpawnFails => {},
        }

        Ok(Box::new(RecordedWorker {
            slot: spec.slot,
            exits: Arc::clone(&self.exits),
            ignores_terminate: self.script == WorkerScript::IgnoresTerminate,
        }))
    }
}

struct RecordedWorker {
    slot: SlotId,
    exits: ExitTable,
    ignores_terminate: bool,
}

impl RecordedWorker {
    fn set_exit(&self, exit: WorkerExit) {
        self.exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.slot)
            .or_insert(exit);
    }
}

impl WorkerProcess for RecordedWorker {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_wait(&mut self) -> RuntimeResult<Option<WorkerExit>> {
        Ok(self
            .exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.slot)
            .copied())
    }

    fn terminate(&mut self) -> RuntimeResult<()> {
        if !self.ignores_terminate {
            self.set_exit(WorkerExit::Code(0));
        }
        Ok(())
    }

    fn kill(&mut self) -> RuntimeResult<()> {
        self.set_exit(WorkerExit::Signal(9));
        Ok(())
    }
}
