//! Opening plugin libraries and resolving their entry points.
//!
//! [`LibraryOpener`] and [`PluginLibrary`] are the seam between the loader
//! and `dlopen`. Production code uses [`DynamicLibraryOpener`]; tests swap in
//! fakes that hand back Rust function pointers.

use std::path::{Path, PathBuf};

use libloading::Library;
use plinth_abi::{
    CLEANUP_SYMBOL, CleanupFn, GET_TYPE_SYMBOL, GetTypeFn, INIT_SYMBOL, InitFn, WORK_SYMBOL,
    WorkFn,
};
use tracing::debug;

use crate::error::{RuntimeError, RuntimeResult};

/// Entry points found in a library. `None` marks a symbol that did not
/// resolve; nothing here is ever called while it is `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolTable {
    /// `plugin_init`
    pub init: Option<InitFn>,
    /// `plugin_get_type`
    pub get_type: Option<GetTypeFn>,
    /// `plugin_work`
    pub work: Option<WorkFn>,
    /// `plugin_cleanup`
    pub cleanup: Option<CleanupFn>,
}

impl SymbolTable {
    /// Names of the entry points that did not resolve.
    #[must_use]
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (INIT_SYMBOL, self.init.is_some()),
            (GET_TYPE_SYMBOL, self.get_type.is_some()),
            (WORK_SYMBOL, self.work.is_some()),
            (CLEANUP_SYMBOL, self.cleanup.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, found)| (!found).then_some(name))
        .collect()
    }
}

/// An open plugin library. Dropping it closes the handle.
///
/// Function pointers handed out by a library are only valid while it is
/// open and only inside the process that opened it.
pub trait PluginLibrary: Send {
    /// Path the library was opened from.
    fn path(&self) -> &Path;

    /// Resolve all four entry points by name.
    fn symbols(&self) -> SymbolTable;

    /// Resolve just `plugin_work`, as a worker process does.
    fn work_entry(&self) -> Option<WorkFn> {
        self.symbols().work
    }
}

/// Opens plugin libraries.
pub trait LibraryOpener: Send + Sync {
    /// Open the library at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::LibraryOpen`] if the library cannot be loaded.
    fn open(&self, path: &Path) -> RuntimeResult<Box<dyn PluginLibrary>>;
}

/// `dlopen`-backed opener.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicLibraryOpener;

impl LibraryOpener for DynamicLibraryOpener {
    fn open(&self, path: &Path) -> RuntimeResult<Box<dyn PluginLibrary>> {
        // SAFETY: loading a library runs its initialisers. Plugins come from
        // the operator-configured directory and are trusted to the same
        // degree as the host binary.
        let library = unsafe { Library::new(path) }.map_err(|e| RuntimeError::LibraryOpen {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        debug!(path = %path.display(), "opened plugin library");
        Ok(Box::new(DynamicLibrary {
            path: path.to_path_buf(),
            library,
        }))
    }
}

/// A library opened with `dlopen`.
#[derive(Debug)]
pub struct DynamicLibrary {
    path: PathBuf,
    library: Library,
}

impl DynamicLibrary {
    /// Look up `name` and copy the function pointer out of the symbol.
    ///
    /// # Safety
    ///
    /// `T` must be the symbol's real signature.
    unsafe fn lookup<T: Copy>(&self, name: &str) -> Option<T> {
        let mut symbol = Vec::with_capacity(name.len().saturating_add(1));
        symbol.extend_from_slice(name.as_bytes());
        symbol.push(0);
        // SAFETY: the caller guarantees the type; the copied pointer is used
        // only while `self.library` is alive.
        unsafe { self.library.get::<T>(&symbol) }.ok().map(|s| *s)
    }
}

impl PluginLibrary for DynamicLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbols(&self) -> SymbolTable {
        // SAFETY: the fn types mirror the plugin ABI declarations.
        unsafe {
            SymbolTable {
                init: self.lookup::<InitFn>(INIT_SYMBOL),
                get_type: self.lookup::<GetTypeFn>(GET_TYPE_SYMBOL),
                work: self.lookup::<WorkFn>(WORK_SYMBOL),
                cleanup: self.lookup::<CleanupFn>(CLEANUP_SYMBOL),
            }
        }
    }

    fn work_entry(&self) -> Option<WorkFn> {
        // SAFETY: as above.
        unsafe { self.lookup::<WorkFn>(WORK_SYMBOL) }
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "closing plugin library");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn zero() -> i32 {
        0
    }

    unsafe extern "C" fn noop() {}

    #[test]
    fn test_missing_lists_unresolved_in_order() {
        let table = SymbolTable {
            init: Some(zero),
            get_type: None,
            work: None,
            cleanup: Some(noop),
        };
        assert_eq!(table.missing(), vec![GET_TYPE_SYMBOL, WORK_SYMBOL]);
        assert_eq!(SymbolTable::default().missing().len(), 4);
    }

    #[test]
    fn test_open_nonexistent_library() {
        let err = DynamicLibraryOpener
            .open(Path::new("/nonexistent/libnothing.so"))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::LibraryOpen { .. }));
    }

    #[test]
    fn test_open_non_library_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.so");
        std::fs::write(&path, b"not an ELF file").unwrap();
        assert!(DynamicLibraryOpener.open(&path).is_err());
    }
}
