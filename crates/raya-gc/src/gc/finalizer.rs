//! Finalization queue
//!
//! The collector queues objects that became unreachable while registered
//! for finalization; it keeps them alive for that one cycle. Finalizers run
//! later, outside the pause, from allocation calls or an explicit
//! [`crate::Arena::run_finalizers`].
//!
//! A drain only processes the entries present when it starts, so a
//! finalizer that allocates more finalizable objects cannot keep the
//! drain going forever. Only one thread drains at a time.

use super::header::{self, Header};
use crate::defaults::HEADER_SIZE;
use crate::{GcError, GcResult};
use crossbeam::queue::SegQueue;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

thread_local! {
    static IN_FINALIZER: Cell<bool> = const { Cell::new(false) };
}

/// Check whether the calling thread is currently running a finalizer
pub fn in_finalizer() -> bool {
    IN_FINALIZER.with(Cell::get)
}

struct DrainGuard<'a> {
    queue: &'a FinalizationQueue,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.in_flight.store(0, Ordering::Release);
        self.queue.draining.store(false, Ordering::Release);
    }
}

struct FinalizerScope;

impl FinalizerScope {
    fn enter() -> Self {
        IN_FINALIZER.with(|flag| flag.set(true));
        FinalizerScope
    }
}

impl Drop for FinalizerScope {
    fn drop(&mut self) {
        IN_FINALIZER.with(|flag| flag.set(false));
    }
}

/// Objects awaiting their finalizer
#[derive(Debug, Default)]
pub struct FinalizationQueue {
    /// Client addresses, in the order the collector found them dead
    queue: SegQueue<usize>,

    /// Some thread is draining
    draining: AtomicBool,

    /// Object whose finalizer is running. Scanned as an ambiguous root.
    in_flight: AtomicUsize,

    /// Finalizers run so far
    finalized: AtomicUsize,
}

impl FinalizationQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an object
    pub fn push(&self, client: usize) {
        self.queue.push(client);
    }

    /// Number of queued objects
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Object whose finalizer is currently running, or 0
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of finalizers run so far
    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Hand every queued entry to `fix`. Order is preserved.
    ///
    /// Only called with the world stopped, when nothing else pushes or pops.
    pub fn fix_entries(&self, mut fix: impl FnMut(&mut usize)) {
        let count = self.queue.len();
        for _ in 0..count {
            if let Some(mut client) = self.queue.pop() {
                fix(&mut client);
                self.queue.push(client);
            }
        }
    }

    /// Run the finalizers of every object queued when the drain starts
    ///
    /// Returns the number run. Fails with [`GcError::ReentrantFinalization`]
    /// when called from inside a finalizer. If another thread is already
    /// draining this returns immediately.
    pub fn drain(&self) -> GcResult<usize> {
        if in_finalizer() {
            return Err(GcError::ReentrantFinalization);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(0);
        }
        let _guard = DrainGuard { queue: self };

        let batch = self.queue.len();
        let mut ran = 0;
        for _ in 0..batch {
            let Some(client) = self.queue.pop() else {
                break;
            };
            self.in_flight.store(client, Ordering::Release);
            // SAFETY: the collector only queues client pointers of data objects,
            // and the in-flight object is pinned by the next collection
            if unsafe { finalize(client)? } {
                ran += 1;
            }
        }

        if ran > 0 {
            self.finalized.fetch_add(ran, Ordering::Relaxed);
            tracing::debug!(ran, remaining = self.queue.len(), "drained finalizers");
        }
        Ok(ran)
    }

    /// Drop every queued entry without running it
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

/// Run the finalizer of the object at `client` and flag it finalized.
/// Returns whether a finalizer ran.
unsafe fn finalize(client: usize) -> GcResult<bool> {
    let base = (client - HEADER_SIZE) as *mut u8;
    let (descriptor, finalized) = match Header::read(base) {
        Header::Object { descriptor, finalized } => (&*descriptor, finalized),
        other => {
            return Err(GcError::HeapCorrupted(format!(
                "finalization queue entry {client:#x} holds {other:?}"
            )))
        }
    };
    if finalized {
        return Err(GcError::DoubleFinalization(client));
    }
    let Some(finalizer) = descriptor.finalizer() else {
        return Ok(false);
    };
    // An object without its dispatch table was never fully constructed
    if descriptor.kind().has_vtable() && *(client as *const usize) == 0 {
        header::set_finalized(base);
        return Ok(false);
    }

    {
        let _scope = FinalizerScope::enter();
        finalizer(client as *mut u8);
    }
    header::set_finalized(base);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::format::fixed_size;
    use crate::types::{TypeDescriptor, TypeKind};
    use std::sync::atomic::AtomicUsize;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_call(_object: *mut u8) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn object(storage: &mut Vec<usize>, descriptor: &TypeDescriptor) -> usize {
        storage.resize(fixed_size(descriptor.stride()) / 8, 0);
        let base = storage.as_mut_ptr() as *mut u8;
        unsafe { header::write_object(base, descriptor) };
        base as usize + HEADER_SIZE
    }

    #[test]
    fn test_queue_starts_empty() {
        let queue = FinalizationQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.drain().unwrap(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_finalizer_runs_once() {
        let descriptor =
            TypeDescriptor::new(TypeKind::Fixed, std::ptr::null(), 16, vec![], Some(count_call)).unwrap();
        let mut storage = Vec::new();
        let client = object(&mut storage, &descriptor);

        let before = CALLS.load(Ordering::SeqCst);
        let queue = FinalizationQueue::new();
        queue.push(client);
        assert_eq!(queue.drain().unwrap(), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
        assert_eq!(queue.finalized(), 1);

        let header = unsafe { Header::read((client - HEADER_SIZE) as *const u8) };
        assert!(matches!(header, Header::Object { finalized: true, .. }));

        queue.push(client);
        assert!(matches!(queue.drain(), Err(GcError::DoubleFinalization(c)) if c == client));
    }

    #[test]
    fn test_missing_vtable_is_skipped() {
        let descriptor = TypeDescriptor::new(
            TypeKind::FixedWithVTable,
            std::ptr::null(),
            16,
            vec![],
            Some(count_call),
        )
        .unwrap();
        let mut storage = Vec::new();
        let client = object(&mut storage, &descriptor);

        let queue = FinalizationQueue::new();
        queue.push(client);
        assert_eq!(queue.drain().unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reentrant_drain_is_rejected() {
        let queue = FinalizationQueue::new();
        let _scope = FinalizerScope::enter();
        assert!(matches!(queue.drain(), Err(GcError::ReentrantFinalization)));
    }

    #[test]
    fn test_fix_entries_preserves_order() {
        let queue = FinalizationQueue::new();
        for addr in [0x100, 0x200, 0x300] {
            queue.push(addr);
        }
        queue.fix_entries(|slot| *slot += 1);
        let drained: Vec<usize> = std::iter::from_fn(|| queue.queue.pop()).collect();
        assert_eq!(drained, vec![0x101, 0x201, 0x301]);
    }
}
