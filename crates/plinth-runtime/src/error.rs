//! Errors raised while loading plugins and supervising workers.

use std::ffi::c_int;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use plinth_abi::AbiError;
use thiserror::Error;

/// Errors raised by the loader, the configuration store, and the supervisor.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No plugin directory was given.
    #[error("Plugin directory is not specified")]
    DirectoryUnspecified,

    /// The plugin directory could not be opened.
    #[error("Plugin directory {path} could not be opened: {source}")]
    DirectoryNotFound {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The shared library could not be opened.
    #[error("Failed to open plugin library {path}: {message}")]
    LibraryOpen {
        /// Library path.
        path: PathBuf,
        /// Loader error text.
        message: String,
    },

    /// One or more of the four entry points did not resolve.
    #[error("Plugin {path} is missing required symbols: {}", missing.join(", "))]
    MissingSymbols {
        /// Library path.
        path: PathBuf,
        /// Unresolved symbol names.
        missing: Vec<&'static str>,
    },

    /// `plugin_init` returned nonzero.
    #[error("Plugin {path} declined to load (init returned {code})")]
    InitRejected {
        /// Library path.
        path: PathBuf,
        /// Value returned by `plugin_init`.
        code: c_int,
    },

    /// `plugin_get_type` returned neither INLINE nor BACKGROUND.
    #[error("Plugin {path} reported an invalid type: {source}")]
    UnknownPluginKind {
        /// Library path.
        path: PathBuf,
        /// Decoding error.
        #[source]
        source: AbiError,
    },

    /// Every configuration slot is taken.
    #[error("No free configuration slot (capacity {capacity})")]
    StoreCapacityExhausted {
        /// Total slot count.
        capacity: usize,
    },

    /// The plugin already holds a slot.
    #[error("Plugin {identity} already holds a configuration slot")]
    DuplicateIdentity {
        /// Plugin identity.
        identity: String,
    },

    /// The worker limit is reached.
    #[error("Worker capacity exhausted ({limit} workers)")]
    WorkerCapacityExhausted {
        /// Configured worker limit.
        limit: usize,
    },

    /// A worker was registered but did not report started in time.
    #[error("Worker for {plugin} did not start within {timeout:?}")]
    WorkerStartTimeout {
        /// Plugin identity.
        plugin: String,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// A worker exited before reporting started.
    #[error("Worker for {plugin} exited before starting ({exit})")]
    WorkerStartFailed {
        /// Plugin identity.
        plugin: String,
        /// How the worker exited.
        exit: String,
    },

    /// The worker process could not be spawned.
    #[error("Failed to spawn worker for {plugin}: {message}")]
    WorkerSpawn {
        /// Plugin identity.
        plugin: String,
        /// Spawn error text.
        message: String,
    },

    /// A worker found its slot absent or empty.
    #[error("Configuration slot {slot} is missing or empty")]
    SlotMissing {
        /// Slot index.
        slot: u32,
    },

    /// Shared memory could not be created, opened, or mapped.
    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    /// A value did not fit the plugin ABI.
    #[error(transparent)]
    Abi(#[from] AbiError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
