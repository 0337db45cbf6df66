//! Shared configuration store: one [`ConfigRecord`] slot per active
//! BACKGROUND plugin, laid out in a process-shared region.
//!
//! The store follows the usual two-phase shared memory lifecycle:
//!
//! 1. **Size request.** [`StoreLayout::for_capacity`] computes the bytes
//!    needed for the configured maximum number of concurrent plugins.
//! 2. **Attach/init.** [`SharedConfigStore::create`] maps the region and
//!    marks every slot free; a worker process maps the same region with
//!    [`SharedConfigStore::attach`].
//!
//! A slot is written exactly once, through a [`SlotWriter`], while it is
//! `Reserved`. [`SlotWriter::publish`] consumes the writer, so no handle that
//! could write to the slot survives the hand-off. Readers only ever take a
//! copy with [`SharedConfigStore::snapshot`].
//!
//! Region layout:
//!
//! ```text
//! +--------------+-----------+-----------+-----+
//! | StoreHeader  | SlotCell0 | SlotCell1 | ... |
//! +--------------+-----------+-----------+-----+
//! ```

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use plinth_abi::{ConfigRecord, Pid};
use tracing::{debug, info};

use crate::error::{RuntimeError, RuntimeResult};
use crate::identity::PluginIdentity;
use crate::shm::SharedRegion;

const STORE_MAGIC: u64 = u64::from_be_bytes(*b"PLINTHCS");
const STORE_VERSION: u32 = 1;

#[repr(C)]
struct StoreHeader {
    magic: u64,
    version: u32,
    capacity: u32,
}

#[repr(C)]
struct SlotCell {
    state: AtomicU32,
    generation: AtomicU32,
    worker_pid: AtomicI32,
    _reserved: u32,
    record: UnsafeCell<ConfigRecord>,
}

const CELLS_OFFSET: usize = {
    let header = size_of::<StoreHeader>();
    let align = align_of::<SlotCell>();
    header.div_ceil(align).saturating_mul(align)
};

/// Name of a fresh store region, unique to this host process.
#[must_use]
pub fn unique_store_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("/plinth-{}-{}", std::process::id(), &id[..8])
}

/// Index of a configuration slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    /// Wrap a raw index, e.g. one received on a worker's command line.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    /// Unused.
    Free = 0,
    /// Acquired by the host; being written.
    Reserved = 1,
    /// Written and handed off; waiting for its worker.
    Published = 2,
    /// A worker took its snapshot and is running.
    Running = 3,
    /// The worker ended normally.
    Exited = 4,
    /// The worker ended with an error.
    Failed = 5,
}

impl SlotState {
    const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Reserved),
            2 => Some(Self::Published),
            3 => Some(Self::Running),
            4 => Some(Self::Exited),
            5 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Bytes needed for a store of a given capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLayout {
    capacity: usize,
    bytes: usize,
}

impl StoreLayout {
    /// Size request for `capacity` concurrent plugins.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] for a zero capacity or one whose
    /// size overflows.
    pub fn for_capacity(capacity: usize) -> RuntimeResult<Self> {
        if capacity == 0 || u32::try_from(capacity).is_err() {
            return Err(RuntimeError::SharedMemory(format!(
                "invalid store capacity {capacity}"
            )));
        }
        let bytes = size_of::<SlotCell>()
            .checked_mul(capacity)
            .and_then(|cells| cells.checked_add(CELLS_OFFSET))
            .ok_or_else(|| {
                RuntimeError::SharedMemory(format!("store capacity {capacity} is too large"))
            })?;
        Ok(Self { capacity, bytes })
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total region size in bytes.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Fixed-capacity table of configuration slots in shared memory.
pub struct SharedConfigStore {
    region: SharedRegion,
    capacity: usize,
    /// Host-side map of identities to the slot they hold.
    index: Mutex<HashMap<PluginIdentity, SlotId>>,
}

impl SharedConfigStore {
    /// Map a new region for `layout` and initialise every slot to free.
    ///
    /// With a `name`, the region is a named POSIX object that worker
    /// processes can attach to. Without one it is an anonymous mapping for
    /// in-process use.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] if the region cannot be created.
    pub fn create(layout: StoreLayout, name: Option<&str>) -> RuntimeResult<Self> {
        let region = match name {
            Some(name) => SharedRegion::create_named(name, layout.bytes())?,
            None => SharedRegion::anonymous(layout.bytes())?,
        };
        let capacity_raw = u32::try_from(layout.capacity())
            .map_err(|e| RuntimeError::SharedMemory(e.to_string()))?;

        // SAFETY: the region is freshly mapped, at least `layout.bytes()`
        // long, and page aligned. Nothing else references it yet.
        unsafe {
            region.as_ptr().cast::<StoreHeader>().as_ptr().write(StoreHeader {
                magic: STORE_MAGIC,
                version: STORE_VERSION,
                capacity: capacity_raw,
            });
            let cells = region.as_ptr().as_ptr().add(CELLS_OFFSET).cast::<SlotCell>();
            for i in 0..layout.capacity() {
                cells.add(i).write(SlotCell {
                    state: AtomicU32::new(SlotState::Free as u32),
                    generation: AtomicU32::new(0),
                    worker_pid: AtomicI32::new(0),
                    _reserved: 0,
                    record: UnsafeCell::new(ConfigRecord::empty()),
                });
            }
        }

        info!(
            capacity = layout.capacity(),
            bytes = layout.bytes(),
            name = name.unwrap_or("<anonymous>"),
            "configuration store initialised"
        );
        Ok(Self {
            region,
            capacity: layout.capacity(),
            index: Mutex::new(HashMap::new()),
        })
    }

    /// Attach to a store another process created.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::SharedMemory`] if the region is missing, too
    /// small, or not a store of this version.
    pub fn attach(name: &str) -> RuntimeResult<Self> {
        let region = SharedRegion::open_named(name)?;
        if region.len() < CELLS_OFFSET {
            return Err(RuntimeError::SharedMemory(format!(
                "{name} is too small to hold a store header"
            )));
        }

        // SAFETY: the region is at least one header long and page aligned.
        let header = unsafe { region.as_ptr().cast::<StoreHeader>().as_ptr().read() };
        if header.magic != STORE_MAGIC || header.version != STORE_VERSION {
            return Err(RuntimeError::SharedMemory(format!(
                "{name} is not a version {STORE_VERSION} configuration store"
            )));
        }

        let capacity = header.capacity as usize;
        let layout = StoreLayout::for_capacity(capacity)?;
        if region.len() < layout.bytes() {
            return Err(RuntimeError::SharedMemory(format!(
                "{name} is {} bytes; {capacity} slots need {}",
                region.len(),
                layout.bytes()
            )));
        }

        debug!(name, capacity, "attached to configuration store");
        Ok(Self {
            region,
            capacity,
            index: Mutex::new(HashMap::new()),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Name of the backing region, if it is named.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.region.name()
    }

    fn cell(&self, slot: SlotId) -> Option<&SlotCell> {
        let i = slot.index() as usize;
        if i >= self.capacity {
            return None;
        }
        // SAFETY: `i` is within the capacity validated against the region
        // length, and cells were initialised by `create`.
        Some(unsafe {
            &*self
                .region
                .as_ptr()
                .as_ptr()
                .add(CELLS_OFFSET)
                .cast::<SlotCell>()
                .add(i)
        })
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<PluginIdentity, SlotId>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a free slot for `identity`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::DuplicateIdentity`] if the identity already holds a
    /// slot, [`RuntimeError::StoreCapacityExhausted`] if none is free.
    pub fn acquire(&self, identity: &PluginIdentity) -> RuntimeResult<SlotWriter<'_>> {
        let mut index = self.lock_index();
        if index.contains_key(identity) {
            return Err(RuntimeError::DuplicateIdentity {
                identity: identity.to_string(),
            });
        }

        for i in 0..self.capacity {
            let slot = SlotId(u32::try_from(i).unwrap_or(u32::MAX));
            let Some(cell) = self.cell(slot) else {
                break;
            };
            if cell
                .state
                .compare_exchange(
                    SlotState::Free as u32,
                    SlotState::Reserved as u32,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                index.insert(identity.clone(), slot);
                debug!(plugin = %identity, %slot, "slot acquired");
                return Ok(SlotWriter {
                    store: self,
                    slot,
                    armed: true,
                });
            }
        }

        Err(RuntimeError::StoreCapacityExhausted {
            capacity: self.capacity,
        })
    }

    /// Return a slot to the free pool and forget its identity.
    pub fn release(&self, slot: SlotId) {
        let Some(cell) = self.cell(slot) else {
            return;
        };
        cell.worker_pid.store(0, Ordering::Relaxed);
        cell.state.store(SlotState::Free as u32, Ordering::Release);
        self.lock_index().retain(|_, held| *held != slot);
        debug!(%slot, "slot released");
    }

    /// Copy a slot's record.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SlotMissing`] if the slot is out of range, not yet
    /// published, or carries no plugin path.
    pub fn snapshot(&self, slot: SlotId) -> RuntimeResult<ConfigRecord> {
        let cell = self.cell(slot).ok_or_else(|| missing_slot(slot))?;

        match self.slot_state(slot) {
            Some(SlotState::Published | SlotState::Running) => {},
            _ => return Err(missing_slot(slot)),
        }

        // SAFETY: the acquire load above synchronises with the release store
        // in `publish`. Published records are never written again.
        let record = unsafe { (*cell.record.get()).clone() };
        if record.is_empty() {
            return Err(missing_slot(slot));
        }
        Ok(record)
    }

    /// Current state of a slot, or `None` if out of range.
    #[must_use]
    pub fn slot_state(&self, slot: SlotId) -> Option<SlotState> {
        self.cell(slot)
            .and_then(|cell| SlotState::from_raw(cell.state.load(Ordering::Acquire)))
    }

    /// Pid of the worker running a slot, if one reported started.
    #[must_use]
    pub fn worker_pid(&self, slot: SlotId) -> Option<Pid> {
        self.cell(slot)
            .map(|cell| cell.worker_pid.load(Ordering::Acquire))
            .filter(|pid| *pid != 0)
    }

    /// How many times the slot has been published.
    #[must_use]
    pub fn generation(&self, slot: SlotId) -> Option<u32> {
        self.cell(slot)
            .map(|cell| cell.generation.load(Ordering::Acquire))
    }

    /// Worker side: report started.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SlotMissing`] if the slot is not published.
    pub fn mark_running(&self, slot: SlotId, pid: Pid) -> RuntimeResult<()> {
        let cell = self.cell(slot).ok_or_else(|| missing_slot(slot))?;
        cell.state
            .compare_exchange(
                SlotState::Published as u32,
                SlotState::Running as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| missing_slot(slot))?;
        // Only the worker that won the slot records its pid.
        cell.worker_pid.store(pid, Ordering::Release);
        Ok(())
    }

    /// Record how a slot's worker ended. Ignored unless the slot is in use.
    pub fn mark_finished(&self, slot: SlotId, failed: bool) {
        let Some(cell) = self.cell(slot) else {
            return;
        };
        let next = if failed {
            SlotState::Failed
        } else {
            SlotState::Exited
        };
        let _ = cell
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match SlotState::from_raw(raw) {
                    Some(SlotState::Published | SlotState::Running) => Some(next as u32),
                    _ => None,
                }
            });
    }

    /// Make a finished slot available to a restarted worker. The record is
    /// left as originally published.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::SlotMissing`] if the slot is not finished.
    pub fn rearm(&self, slot: SlotId) -> RuntimeResult<()> {
        let cell = self.cell(slot).ok_or_else(|| missing_slot(slot))?;
        cell.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match SlotState::from_raw(raw) {
                    Some(SlotState::Exited | SlotState::Failed | SlotState::Running) => {
                        Some(SlotState::Published as u32)
                    },
                    _ => None,
                }
            })
            .map_err(|_| missing_slot(slot))?;
        cell.worker_pid.store(0, Ordering::Release);
        Ok(())
    }

    /// Slot held by `identity`, if any.
    #[must_use]
    pub fn slot_of(&self, identity: &PluginIdentity) -> Option<SlotId> {
        self.lock_index().get(identity).copied()
    }

    /// Number of slots held by this host.
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.lock_index().len()
    }
}

fn missing_slot(slot: SlotId) -> RuntimeError {
    RuntimeError::SlotMissing { slot: slot.index() }
}

impl fmt::Debug for SharedConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConfigStore")
            .field("name", &self.region.name())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Exclusive write access to a reserved slot.
///
/// Dropping the writer without publishing releases the slot.
#[must_use = "an unpublished slot is released on drop"]
pub struct SlotWriter<'a> {
    store: &'a SharedConfigStore,
    slot: SlotId,
    armed: bool,
}

impl SlotWriter<'_> {
    /// Slot being written.
    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Write the record and hand the slot off. After this, the slot is
    /// read-only.
    pub fn publish(mut self, record: &ConfigRecord) -> SlotId {
        if let Some(cell) = self.store.cell(self.slot) {
            // SAFETY: the slot is `Reserved` and this writer is its only
            // handle; no reader looks at a slot before it is published.
            unsafe { *cell.record.get() = record.clone() };
            cell.generation.fetch_add(1, Ordering::Relaxed);
            cell.state
                .store(SlotState::Published as u32, Ordering::Release);
        }
        self.armed = false;
        debug!(slot = %self.slot, plugin = %record.plugin_name(), "slot published");
        self.slot
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.release(self.slot);
        }
    }
}

// SAFETY: slot records are only written while `Reserved`, through a unique
// `SlotWriter`, and only read after an acquire load observes `Published`.
// All other shared fields are atomics.
unsafe impl Sync for SharedConfigStore {}
// SAFETY: see above; the region itself is `Send`.
unsafe impl Send for SharedConfigStore {}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn store(capacity: usize) -> SharedConfigStore {
        SharedConfigStore::create(StoreLayout::for_capacity(capacity).unwrap(), None).unwrap()
    }

    fn identity(name: &str) -> PluginIdentity {
        PluginIdentity::from_path(&Path::new("/plugins").join(name))
    }

    fn record(name: &str, config: &str) -> ConfigRecord {
        ConfigRecord::new(name, &format!("/plugins/{name}"), config, 1).unwrap()
    }

    #[test]
    fn test_layout_grows_with_capacity() {
        let one = StoreLayout::for_capacity(1).unwrap();
        let four = StoreLayout::for_capacity(4).unwrap();
        assert_eq!(four.bytes() - one.bytes(), 3 * size_of::<SlotCell>());
        assert!(StoreLayout::for_capacity(0).is_err());
    }

    #[test]
    fn test_each_plugin_gets_its_own_slot() {
        let store = store(4);
        let a = store.acquire(&identity("a.so")).unwrap().publish(&record("a.so", "{\"a\":1}"));
        let b = store.acquire(&identity("b.so")).unwrap().publish(&record("b.so", "{\"b\":2}"));
        assert_ne!(a, b);

        let snap_a = store.snapshot(a).unwrap();
        let snap_b = store.snapshot(b).unwrap();
        assert_eq!(snap_a.plugin_name(), "a.so");
        assert_eq!(snap_a.custom_config(), "{\"a\":1}");
        assert_eq!(snap_b.plugin_name(), "b.so");
        assert_eq!(snap_b.plugin_path(), "/plugins/b.so");
        assert_eq!(store.active_slots(), 2);
    }

    #[test]
    fn test_capacity_exhausted() {
        let store = store(1);
        let _held = store.acquire(&identity("a.so")).unwrap().publish(&record("a.so", ""));
        let err = store.acquire(&identity("b.so")).err().unwrap();
        assert!(matches!(err, RuntimeError::StoreCapacityExhausted { capacity: 1 }));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let store = store(2);
        let _held = store.acquire(&identity("a.so")).unwrap().publish(&record("a.so", ""));
        assert!(matches!(
            store.acquire(&identity("a.so")),
            Err(RuntimeError::DuplicateIdentity { .. })
        ));
    }

    #[test]
    fn test_unpublished_writer_releases_slot() {
        let store = store(1);
        let writer = store.acquire(&identity("a.so")).unwrap();
        let slot = writer.slot();
        assert_eq!(store.slot_state(slot), Some(SlotState::Reserved));
        assert!(store.snapshot(slot).is_err());
        drop(writer);

        assert_eq!(store.slot_state(slot), Some(SlotState::Free));
        assert_eq!(store.active_slots(), 0);
        assert!(store.acquire(&identity("a.so")).is_ok());
    }

    #[test]
    fn test_release_recycles_slot() {
        let store = store(1);
        let slot = store.acquire(&identity("a.so")).unwrap().publish(&record("a.so", ""));
        store.release(slot);
        assert!(matches!(
            store.snapshot(slot),
            Err(RuntimeError::SlotMissing { .. })
        ));

        let again = store.acquire(&identity("b.so")).unwrap().publish(&record("b.so", ""));
        assert_eq!(again, slot);
        assert_eq!(store.snapshot(again).unwrap().plugin_name(), "b.so");
        assert_eq!(store.generation(again), Some(2));
    }

    #[test]
    fn test_snapshot_of_empty_record_is_missing() {
        let store = store(1);
        let slot = store
            .acquire(&identity("a.so"))
            .unwrap()
            .publish(&ConfigRecord::empty());
        assert!(matches!(
            store.snapshot(slot),
            Err(RuntimeError::SlotMissing { slot: 0 })
        ));
    }

    #[test]
    fn test_out_of_range_slot() {
        let store = store(1);
        assert!(store.snapshot(SlotId::new(7)).is_err());
        assert_eq!(store.slot_state(SlotId::new(7)), None);
    }

    #[test]
    fn test_worker_lifecycle_and_rearm() {
        let store = store(1);
        let slot = store.acquire(&identity("a.so")).unwrap().publish(&record("a.so", "{}"));

        store.mark_running(slot, 4242).unwrap();
        assert_eq!(store.slot_state(slot), Some(SlotState::Running));
        assert_eq!(store.worker_pid(slot), Some(4242));
        assert!(store.mark_running(slot, 1).is_err());
        assert_eq!(store.worker_pid(slot), Some(4242));

        store.mark_finished(slot, true);
        assert_eq!(store.slot_state(slot), Some(SlotState::Failed));

        store.rearm(slot).unwrap();
        assert_eq!(store.slot_state(slot), Some(SlotState::Published));
        assert_eq!(store.worker_pid(slot), None);
        assert_eq!(store.snapshot(slot).unwrap().custom_config(), "{}");
    }

    #[test]
    fn test_mark_running_on_unpublished_slot_keeps_pid_clear() {
        let store = store(2);
        assert!(store.mark_running(SlotId::new(1), 99).is_err());
        assert_eq!(store.slot_state(SlotId::new(1)), Some(SlotState::Free));
        assert_eq!(store.worker_pid(SlotId::new(1)), None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = store(1);
        let slot = store.acquire(&identity("a.so")).unwrap().publish(&record("a.so", "{\"v\":1}"));
        let snap = store.snapshot(slot).unwrap();
        store.release(slot);
        let _other = store.acquire(&identity("b.so")).unwrap().publish(&record("b.so", "{\"v\":2}"));
        assert_eq!(snap.custom_config(), "{\"v\":1}");
    }

    #[test]
    fn test_attach_sees_published_records() {
        let name = format!("/plinth-test-{}", uuid::Uuid::new_v4().simple());
        let host =
            SharedConfigStore::create(StoreLayout::for_capacity(2).unwrap(), Some(&name)).unwrap();
        let slot = host.acquire(&identity("a.so")).unwrap().publish(&record("a.so", "{}"));

        let worker = SharedConfigStore::attach(&name).unwrap();
        assert_eq!(worker.capacity(), 2);
        assert_eq!(worker.snapshot(slot).unwrap().plugin_name(), "a.so");

        worker.mark_running(slot, 99).unwrap();
        assert_eq!(host.slot_state(slot), Some(SlotState::Running));
    }

    #[test]
    fn test_attach_missing_region() {
        assert!(matches!(
            SharedConfigStore::attach("/plinth-test-does-not-exist"),
            Err(RuntimeError::SharedMemory(_))
        ));
    }
}
