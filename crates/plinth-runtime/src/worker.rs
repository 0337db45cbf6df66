//! Worker process entry.
//!
//! A worker owns exactly one BACKGROUND plugin instance. It never inherits
//! anything callable from the host: it copies its record out of the slot,
//! opens the library itself, and resolves `plugin_work` from its own handle.
//!
//! A crash inside plugin code kills this process and nothing else. The
//! supervisor reaps it as a signal exit, which the restart policy can act
//! on; the host and the other workers keep running.

use std::path::PathBuf;

use plinth_abi::ConfigRecord;
use tracing::{error, info, warn};

use crate::interrupt::{install_termination_handler, unblock_inherited_signals};
use crate::library::{DynamicLibraryOpener, LibraryOpener};
use crate::store::{SharedConfigStore, SlotId};
use crate::work_loop::{Interrupt, LoopState, WorkLoop};

/// Worker exit statuses.
pub mod exit_code {
    /// Plugin stopped on request or was interrupted.
    pub const OK: i32 = 0;
    /// The slot was absent or empty.
    pub const SLOT_MISSING: i32 = 1;
    /// The library could not be opened or lacks `plugin_work`.
    pub const LOAD_FAILED: i32 = 2;
    /// `plugin_work` faulted.
    pub const WORK_FAILED: i32 = 3;
}

/// Run the plugin in `slot` until it stops. Returns the exit status.
pub fn run_worker(
    store: &SharedConfigStore,
    slot: SlotId,
    opener: &dyn LibraryOpener,
    interrupt: &dyn Interrupt,
) -> i32 {
    let record = match store.snapshot(slot) {
        Ok(record) => record,
        Err(e) => {
            error!(%slot, error = %e, "no configuration for this worker");
            return exit_code::SLOT_MISSING;
        },
    };
    let plugin = record.plugin_name().into_owned();

    if let Err(e) = store.mark_running(slot, nix::unistd::getpid().as_raw()) {
        error!(plugin, %slot, error = %e, "slot was taken before the worker started");
        return exit_code::SLOT_MISSING;
    }

    let path = PathBuf::from(record.plugin_path().as_ref());
    let library = match opener.open(&path) {
        Ok(library) => library,
        Err(e) => {
            error!(plugin, error = %e, "worker failed to open plugin");
            store.mark_finished(slot, true);
            return exit_code::LOAD_FAILED;
        },
    };
    let Some(work) = library.work_entry() else {
        error!(plugin, path = %path.display(), "plugin_work did not resolve in worker");
        store.mark_finished(slot, true);
        return exit_code::LOAD_FAILED;
    };

    info!(plugin, %slot, "worker running");
    let outcome = WorkLoop::new(&record).run_background(
        // SAFETY: `work` was resolved from `library`, which outlives the loop.
        |r: &ConfigRecord| unsafe { work(r) },
        interrupt,
    );
    drop(library);

    let failed = outcome.state == LoopState::Failed;
    store.mark_finished(slot, failed);
    info!(plugin, iterations = outcome.iterations, reason = ?outcome.reason, "worker finished");
    if failed {
        exit_code::WORK_FAILED
    } else {
        exit_code::OK
    }
}

/// Entry point of a worker process: attach to the named store and run the
/// plugin in `slot` with real signals and `dlopen`.
pub fn worker_main(store_name: &str, slot: SlotId) -> i32 {
    if let Err(e) = unblock_inherited_signals() {
        warn!(error = %e, "could not clear inherited signal mask");
    }
    let interrupt = match install_termination_handler() {
        Ok(interrupt) => interrupt,
        Err(e) => {
            error!(error = %e, "could not install termination handler");
            return exit_code::LOAD_FAILED;
        },
    };
    let store = match SharedConfigStore::attach(store_name) {
        Ok(store) => store,
        Err(e) => {
            error!(store = store_name, error = %e, "could not attach configuration store");
            return exit_code::SLOT_MISSING;
        },
    };
    run_worker(&store, slot, &DynamicLibraryOpener, &interrupt)
}
