//! Descriptor table
//!
//! Owns every descriptor created for an arena. Descriptors are boxed so
//! their addresses stay fixed for as long as any header may point at them.
//! Freeing is deferred: objects awaiting finalization may still name a
//! descriptor after the runtime has dropped it, so frees go to a pending set
//! that is only reclaimed after a heap walk proves nothing refers to them.

use super::descriptor::{DescriptorRef, TypeDescriptor};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

/// Table of descriptors with deferred free
pub struct TypeTable {
    /// Live descriptors keyed by address
    live: Mutex<FxHashMap<usize, Box<TypeDescriptor>>>,

    /// Descriptors the runtime has freed but the heap may still reference
    pending: Mutex<FxHashSet<usize>>,
}

impl TypeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            live: Mutex::new(FxHashMap::default()),
            pending: Mutex::new(FxHashSet::default()),
        }
    }

    /// Take ownership of a descriptor
    pub fn insert(&self, descriptor: TypeDescriptor) -> DescriptorRef {
        let boxed = Box::new(descriptor);
        // The box is owned by `live` and only leaves it through `reclaim`,
        // which is what invalidates the handle.
        let handle = DescriptorRef::from_ref(&boxed);
        self.live.lock().insert(handle.addr(), boxed);
        handle
    }

    /// Check whether `addr` names a descriptor owned by this table
    pub fn contains(&self, addr: usize) -> bool {
        self.live.lock().contains_key(&addr)
    }

    /// Number of owned descriptors, including pending ones
    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Check if the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule a descriptor for reclamation. Returns the pending count.
    pub fn schedule_free(&self, descriptor: DescriptorRef) -> usize {
        let mut pending = self.pending.lock();
        if self.live.lock().contains_key(&descriptor.addr()) {
            pending.insert(descriptor.addr());
        }
        pending.len()
    }

    /// Number of descriptors waiting for reclamation
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check whether a descriptor has been scheduled for reclamation
    pub fn is_pending(&self, descriptor: DescriptorRef) -> bool {
        self.pending.lock().contains(&descriptor.addr())
    }

    /// Release every pending descriptor not named in `in_use`.
    /// Returns the number released.
    pub fn reclaim(&self, in_use: &FxHashSet<usize>) -> usize {
        let mut pending = self.pending.lock();
        let mut live = self.live.lock();
        let before = pending.len();
        pending.retain(|addr| {
            if in_use.contains(addr) {
                true
            } else {
                live.remove(addr);
                false
            }
        });
        before - pending.len()
    }

    /// Drop every descriptor
    pub fn clear(&self) {
        self.pending.lock().clear();
        self.live.lock().clear();
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}
