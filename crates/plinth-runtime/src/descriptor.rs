//! Admitted plugins.
//!
//! A [`PluginDescriptor`] only exists for a library that resolved all four
//! entry points, returned 0 from `plugin_init`, and reported a valid type.
//! Anything less is closed and reported instead.

use std::ffi::c_int;
use std::fmt;
use std::path::Path;

use plinth_abi::{CleanupFn, ConfigRecord, PluginKind, WorkFn};
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::PluginIdentity;
use crate::library::PluginLibrary;

/// A fully conformant plugin, holding the library open.
pub struct PluginDescriptor {
    work: WorkFn,
    cleanup: CleanupFn,
    kind: PluginKind,
    identity: PluginIdentity,
    // Declared last: dropped after the function pointers it backs.
    library: Box<dyn PluginLibrary>,
}

impl PluginDescriptor {
    /// Resolve, initialise, and classify a plugin.
    ///
    /// The library is closed (dropped) on every error path.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::MissingSymbols`] if any entry point is absent,
    /// [`RuntimeError::InitRejected`] if `plugin_init` returns nonzero,
    /// [`RuntimeError::UnknownPluginKind`] if `plugin_get_type` returns
    /// something other than INLINE or BACKGROUND. In the last case
    /// `plugin_cleanup` runs first, since `plugin_init` already succeeded.
    pub fn admit(library: Box<dyn PluginLibrary>) -> RuntimeResult<Self> {
        let path = library.path().to_path_buf();
        let symbols = library.symbols();

        let (Some(init), Some(get_type), Some(work), Some(cleanup)) =
            (symbols.init, symbols.get_type, symbols.work, symbols.cleanup)
        else {
            return Err(RuntimeError::MissingSymbols {
                missing: symbols.missing(),
                path,
            });
        };

        // SAFETY: resolved from `library`, which is still open.
        let code = unsafe { init() };
        if code != 0 {
            return Err(RuntimeError::InitRejected { path, code });
        }

        // SAFETY: as above.
        let raw_kind = unsafe { get_type() };
        let kind = match PluginKind::from_raw(raw_kind) {
            Ok(kind) => kind,
            Err(source) => {
                warn!(path = %path.display(), raw_kind, "invalid plugin type; cleaning up");
                // SAFETY: as above.
                unsafe { cleanup() };
                return Err(RuntimeError::UnknownPluginKind { path, source });
            },
        };

        debug!(path = %path.display(), %kind, "plugin admitted");
        Ok(Self {
            work,
            cleanup,
            kind,
            identity: PluginIdentity::from_path(&path),
            library,
        })
    }

    /// Declared execution model.
    #[must_use]
    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    /// Identity derived from the library path.
    #[must_use]
    pub fn identity(&self) -> &PluginIdentity {
        &self.identity
    }

    /// Library path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.library.path()
    }

    /// Call `plugin_work` with `record`.
    pub fn work(&self, record: &ConfigRecord) -> c_int {
        // SAFETY: the library stays open for the lifetime of `self`, and
        // `record` outlives the call.
        unsafe { (self.work)(record) }
    }

    /// Run `plugin_cleanup`.
    pub fn cleanup(&self) {
        // SAFETY: the library stays open for the lifetime of `self`.
        unsafe { (self.cleanup)() };
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("path", &self.library.path())
            .finish_non_exhaustive()
    }
}
