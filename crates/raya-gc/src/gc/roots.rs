//! GC root tracking
//!
//! Roots are the starting points of every trace. Besides thread stacks
//! (see [`crate::thread`]) the runtime can register:
//! - Exact ranges: every word is a reference or null, and is rewritten on moves
//! - Ambiguous ranges: words that might be references; their targets are pinned
//! - Scanner callbacks that hand their own slots to the collector
//! - Owned roots: slots owned by the heap, released when the handle drops

use super::format::Fixer;
use crate::{GcError, GcResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Identifier of a registered root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(u64);

impl RootHandle {
    /// Raw id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Callback that reports root slots to the collector
pub type RootScanner = Box<dyn FnMut(&mut dyn Fixer) + Send>;

/// What a root covers
pub enum RootKind {
    /// `count` words at `base`, each a reference or null
    Exact {
        /// First slot
        base: *mut usize,
        /// Number of slots
        count: usize,
    },
    /// `count` words at `base` that may or may not be references
    Ambiguous {
        /// First word
        base: *const usize,
        /// Number of words
        count: usize,
    },
    /// Slots reported by a callback
    Scanner(RootScanner),
}

enum RootEntry {
    Exact { base: *mut usize, count: usize },
    Ambiguous { base: *const usize, count: usize },
    Scanner(RootScanner),
    Owned(Arc<[AtomicUsize]>),
}

// SAFETY: the registrant guarantees ranges stay valid while registered, and
// entries are only dereferenced by the collector while the world is stopped.
unsafe impl Send for RootEntry {}
unsafe impl Sync for RootEntry {}

/// Registered roots of one arena
pub struct RootTable {
    entries: DashMap<u64, RootEntry>,
    next_id: AtomicU64,
}

impl RootTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_handle(&self) -> RootHandle {
        RootHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a root
    ///
    /// # Safety
    ///
    /// Ranges must stay valid and correctly sized until the root is destroyed.
    pub unsafe fn create(&self, kind: RootKind) -> RootHandle {
        let handle = self.next_handle();
        let entry = match kind {
            RootKind::Exact { base, count } => RootEntry::Exact { base, count },
            RootKind::Ambiguous { base, count } => RootEntry::Ambiguous { base, count },
            RootKind::Scanner(scanner) => RootEntry::Scanner(scanner),
        };
        self.entries.insert(handle.0, entry);
        handle
    }

    /// Register `count` heap-owned exact slots, initially null
    pub fn create_owned(&self, count: usize) -> (RootHandle, Arc<[AtomicUsize]>) {
        let handle = self.next_handle();
        let slots: Arc<[AtomicUsize]> = (0..count).map(|_| AtomicUsize::new(0)).collect();
        self.entries.insert(handle.0, RootEntry::Owned(slots.clone()));
        (handle, slots)
    }

    /// Deregister a root
    pub fn destroy(&self, handle: RootHandle) -> GcResult<()> {
        self.entries
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(GcError::UnknownRoot(handle.0))
    }

    /// Number of registered roots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every root
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Address ranges of every ambiguous root
    pub fn ambiguous_ranges(&self) -> Vec<(usize, usize)> {
        self.entries
            .iter()
            .filter_map(|entry| match *entry.value() {
                RootEntry::Ambiguous { base, count } => {
                    let start = base as usize;
                    Some((start, start + count * std::mem::size_of::<usize>()))
                }
                _ => None,
            })
            .collect()
    }

    /// Hand every exact slot to `fixer`
    ///
    /// # Safety
    ///
    /// The world must be stopped.
    pub unsafe fn scan_exact(&self, fixer: &mut dyn Fixer) {
        for mut entry in self.entries.iter_mut() {
            match entry.value_mut() {
                RootEntry::Exact { base, count } => {
                    for index in 0..*count {
                        let slot = base.add(index);
                        if *slot != 0 {
                            fixer.fix(&mut *slot);
                        }
                    }
                }
                RootEntry::Owned(slots) => {
                    for slot in slots.iter() {
                        let mut value = slot.load(Ordering::Relaxed);
                        if value != 0 {
                            fixer.fix(&mut value);
                            slot.store(value, Ordering::Relaxed);
                        }
                    }
                }
                RootEntry::Scanner(scanner) => scanner(&mut *fixer),
                RootEntry::Ambiguous { .. } => {}
            }
        }
    }
}

impl Default for RootTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Root whose slots are owned by the heap
///
/// Slots start out null. Dropping the handle destroys the root.
pub struct OwnedRoot {
    table: Arc<RootTable>,
    handle: RootHandle,
    slots: Arc<[AtomicUsize]>,
}

impl OwnedRoot {
    pub(crate) fn new(table: Arc<RootTable>, count: usize) -> Self {
        let (handle, slots) = table.create_owned(count);
        Self { table, handle, slots }
    }

    /// Handle of the underlying root
    pub fn handle(&self) -> RootHandle {
        self.handle
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the root has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current value of a slot
    pub fn get(&self, index: usize) -> usize {
        self.slots[index].load(Ordering::Relaxed)
    }

    /// Store a reference in a slot
    pub fn set(&self, index: usize, value: usize) {
        self.slots[index].store(value, Ordering::Relaxed)
    }
}

impl Drop for OwnedRoot {
    fn drop(&mut self) {
        // The arena may already have cleared its roots during destroy
        let _ = self.table.destroy(self.handle);
    }
}

impl std::fmt::Debug for OwnedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedRoot")
            .field("handle", &self.handle)
            .field("len", &self.slots.len())
            .finish()
    }
}
