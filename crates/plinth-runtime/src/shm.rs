//! POSIX shared memory regions.
//!
//! A named region (`shm_open` + `mmap`) is how the host hands configuration
//! slots to worker processes: the worker re-opens the region by name. An
//! anonymous shared mapping serves in-process workers.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};

fn shm_err(op: &str, name: &str, e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::SharedMemory(format!("{op} {name}: {e}"))
}

/// A mapped, process-shared memory region. Unmapped on drop; a region this
/// process created by name is also unlinked.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    name: Option<String>,
    owner: bool,
}

// SAFETY: the region is plain shared memory. Synchronisation of its contents
// is the responsibility of the types laid out inside it.
unsafe impl Send for SharedRegion {}
// SAFETY: as above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a new named region of `len` zeroed bytes. Fails if the name
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] if the object cannot be created,
    /// sized, or mapped.
    pub fn create_named(name: &str, len: usize) -> RuntimeResult<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| shm_err("create", name, "region length must be nonzero"))?;

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| shm_err("shm_open", name, e))?;
        let file = File::from(fd);

        if let Err(e) = file.set_len(len as u64) {
            let _ = shm_unlink(name);
            return Err(shm_err("ftruncate", name, e));
        }

        let ptr = match map_file(&file, size) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(shm_err("mmap", name, e));
            },
        };

        debug!(name, len, "created shared memory region");
        Ok(Self {
            ptr,
            len,
            name: Some(name.to_owned()),
            owner: true,
        })
    }

    /// Map an existing named region in full.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] if the object does not exist or
    /// cannot be mapped.
    pub fn open_named(name: &str) -> RuntimeResult<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| shm_err("shm_open", name, e))?;
        let file = File::from(fd);

        let len = file
            .metadata()
            .map_err(|e| shm_err("fstat", name, e))
            .and_then(|m| {
                usize::try_from(m.len()).map_err(|e| shm_err("fstat", name, e))
            })?;
        let size =
            NonZeroUsize::new(len).ok_or_else(|| shm_err("open", name, "region is empty"))?;

        let ptr = map_file(&file, size).map_err(|e| shm_err("mmap", name, e))?;

        debug!(name, len, "attached shared memory region");
        Ok(Self {
            ptr,
            len,
            name: Some(name.to_owned()),
            owner: false,
        })
    }

    /// An anonymous shared mapping of `len` zeroed bytes, visible only to
    /// this process and its forked children.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] if the mapping fails.
    pub fn anonymous(len: usize) -> RuntimeResult<Self> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| shm_err("mmap", "<anonymous>", "region length must be nonzero"))?;

        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| shm_err("mmap", "<anonymous>", e))?;

        Ok(Self {
            ptr: ptr.cast(),
            len,
            name: None,
            owner: true,
        })
    }

    /// Start of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty. Never true for a constructed region.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name the region was created or opened under.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

fn map_file(file: &File, size: NonZeroUsize) -> nix::Result<NonNull<u8>> {
    // SAFETY: the new mapping is backed by a shared memory object and does not
    // alias any Rust-owned memory.
    let ptr = unsafe {
        mmap(
            None,
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }?;
    Ok(ptr.cast())
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created by this value and no
        // references into it outlive `self`.
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
            warn!(error = %e, "munmap failed");
        }
        if let (true, Some(name)) = (self.owner, self.name.as_deref()) {
            match shm_unlink(name) {
                Ok(()) => debug!(name, "unlinked shared memory region"),
                Err(e) => warn!(name, error = %e, "shm_unlink failed"),
            }
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
