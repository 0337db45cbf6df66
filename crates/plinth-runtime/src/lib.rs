//! Plugin execution framework for plinth.
//!
//! Plugins are shared libraries exporting four C entry points
//! (`plugin_init`, `plugin_get_type`, `plugin_work`, `plugin_cleanup`).
//! This crate finds them, checks that contract, and runs each one in one of
//! two ways:
//!
//! - **INLINE**: one `plugin_work` call on the scanning thread, then
//!   `plugin_cleanup`.
//! - **BACKGROUND**: a worker process of its own that calls `plugin_work`
//!   until the plugin asks to stop or the host interrupts it.
//!
//! Each BACKGROUND plugin gets its own slot in a [`SharedConfigStore`], a
//! fixed-size table in process-shared memory. The host writes the slot once
//! and the worker only reads a copy of it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use plinth_runtime::{
//!     DynamicLibraryOpener, HostOptions, PluginHost, ProcessLauncher, StoreBacking,
//!     SupervisorConfig, WorkerLauncher, unique_store_name,
//! };
//!
//! # fn main() -> Result<(), plinth_runtime::RuntimeError> {
//! let store_name = unique_store_name();
//! let options = HostOptions {
//!     directory: Some("/opt/plinth/plugins".into()),
//!     custom_config: r#"{"mode":"fast"}"#.into(),
//!     supervisor: SupervisorConfig::default(),
//!     store: StoreBacking::Named(store_name.clone()),
//! };
//! let program = std::env::current_exe()?;
//! let mut host = PluginHost::new(options, Arc::new(DynamicLibraryOpener), |_| {
//!     Arc::new(ProcessLauncher::new(program, store_name)) as Arc<dyn WorkerLauncher>
//! })?;
//!
//! let report = host.boot()?;
//! println!("{} plugin(s) loaded", report.loaded());
//! host.finish_boot();
//! # Ok(())
//! # }
//! ```
//!
//! INLINE plugins share the host's thread, so a fault inside one takes the
//! host down. BACKGROUND plugins are isolated by their process.

#![allow(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod descriptor;
pub mod error;
pub mod host;
pub mod identity;
pub mod interrupt;
pub mod launcher;
pub mod library;
pub mod loader;
pub mod shm;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod work_loop;
pub mod worker;

pub use descriptor::PluginDescriptor;
pub use error::{RuntimeError, RuntimeResult};
pub use host::{HostOptions, PluginHost, StoreBacking};
pub use identity::PluginIdentity;
pub use interrupt::{SignalInterrupt, install_termination_handler, unblock_inherited_signals};
pub use launcher::{ChildProcess, ProcessLauncher};
pub use library::{DynamicLibraryOpener, LibraryOpener, PluginLibrary, SymbolTable};
pub use loader::{
    LIBRARY_EXTENSION, LoadContext, LoadReport, LoadedAs, PluginOutcome, candidates, is_candidate,
    load_plugins_from_directory,
};
pub use store::{SharedConfigStore, SlotId, SlotState, SlotWriter, StoreLayout, unique_store_name};
pub use supervisor::{
    BootPhase, Registration, RestartPolicy, Supervisor, SupervisorConfig, WorkerEvent, WorkerExit,
    WorkerHandle, WorkerLauncher, WorkerProcess, WorkerSpec,
};
pub use work_loop::{
    Interrupt, LoopOutcome, LoopState, NeverInterrupt, StopReason, WorkEntry, WorkLoop,
};
pub use worker::{exit_code, run_worker, worker_main};
