//! Registry of attached OS threads

use super::native::approximate_sp;
use super::stacks::{StackScanReport, StackScanner, StackSet};
use crate::gc::alloc_point::AllocPoint;
use crate::gc::block::{Generation, PoolKind};
use crate::{GcError, GcResult};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Per-thread heap state
pub struct ThreadDescriptor {
    id: ThreadId,

    /// Young data allocation point
    pub(crate) ap: Mutex<AllocPoint>,

    /// Green-thread stacks maintained by the scheduler
    stacks: Arc<StackSet>,

    /// Root callback; the stack set unless the runtime supplied its own
    scanner: Arc<dyn StackScanner>,

    /// Highest address of the native stack
    stack_top: AtomicUsize,

    /// Stack pointer recorded when the thread last stopped running
    saved_sp: AtomicUsize,

    /// Allocations since attach
    allocations: AtomicUsize,

    /// Nesting depth of native regions
    native_depth: AtomicUsize,
}

impl ThreadDescriptor {
    /// Describe the calling thread
    pub fn for_current(stack_top: usize, scanner: Option<Arc<dyn StackScanner>>) -> Self {
        let stacks = Arc::new(StackSet::new());
        let scanner = scanner.unwrap_or_else(|| stacks.clone() as Arc<dyn StackScanner>);
        Self {
            id: std::thread::current().id(),
            ap: Mutex::new(AllocPoint::new(PoolKind::Data, Generation::Young)),
            stacks,
            scanner,
            stack_top: AtomicUsize::new(stack_top),
            saved_sp: AtomicUsize::new(approximate_sp()),
            allocations: AtomicUsize::new(0),
            native_depth: AtomicUsize::new(0),
        }
    }

    /// OS thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Green-thread stacks of this thread
    pub fn stacks(&self) -> &Arc<StackSet> {
        &self.stacks
    }

    /// Highest address of the native stack
    pub fn stack_top(&self) -> usize {
        self.stack_top.load(Ordering::Acquire)
    }

    /// Re-read the native stack bounds after the thread was handed between
    /// runtimes
    pub fn refresh_stack(&self, stack_top: usize) {
        self.stack_top.store(stack_top, Ordering::Release);
        self.saved_sp.store(approximate_sp(), Ordering::Release);
    }

    /// Slot receiving the stack pointer at safepoints
    pub fn saved_sp(&self) -> &AtomicUsize {
        &self.saved_sp
    }

    /// Whether the thread is inside a native region
    pub fn in_native(&self) -> bool {
        self.native_depth.load(Ordering::Acquire) > 0
    }

    /// Enter a native region. Returns whether this is the outermost one.
    pub(crate) fn push_native(&self) -> bool {
        self.native_depth.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Leave a native region. Returns whether it was the outermost one.
    pub(crate) fn pop_native(&self) -> bool {
        self.native_depth.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Count one allocation. Returns the new total.
    #[inline]
    pub fn count_allocation(&self) -> usize {
        self.allocations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Allocations since attach
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Stack pointer recorded when the thread last stopped running, with
    /// the top of its native stack. The stack pointer lies above `top`
    /// when the thread stopped on a green stack mapped above it.
    pub fn native_range(&self) -> Option<(usize, usize)> {
        let sp = self.saved_sp.load(Ordering::Acquire);
        (sp != 0).then(|| (sp, self.stack_top()))
    }

    /// Run the root callback
    pub fn scan(&self, native: Option<(usize, usize)>) -> StackScanReport {
        self.scanner.scan(native)
    }
}

impl std::fmt::Debug for ThreadDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadDescriptor")
            .field("id", &self.id)
            .field("stack_top", &format_args!("{:#x}", self.stack_top()))
            .field("stacks", &self.stacks.len())
            .finish()
    }
}

/// Registry entry: nested attaches share one descriptor
#[derive(Debug)]
pub struct ThreadEntry {
    refs: usize,
    descriptor: Arc<ThreadDescriptor>,
}

impl ThreadEntry {
    /// The thread's descriptor
    pub fn descriptor(&self) -> &Arc<ThreadDescriptor> {
        &self.descriptor
    }
}

/// All threads attached to one arena
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<FxHashMap<ThreadId, ThreadEntry>>,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. A thread may only be registered once.
    pub fn register(&self, descriptor: Arc<ThreadDescriptor>) -> GcResult<()> {
        let mut threads = self.threads.lock();
        if threads.contains_key(&descriptor.id()) {
            return Err(GcError::DuplicateThread);
        }
        tracing::debug!(thread = ?descriptor.id(), "thread registered");
        threads.insert(descriptor.id(), ThreadEntry { refs: 1, descriptor });
        Ok(())
    }

    /// Add a nested attach for an already registered thread
    pub fn retain(&self, id: ThreadId) -> GcResult<()> {
        let mut threads = self.threads.lock();
        let entry = threads.get_mut(&id).ok_or(GcError::ThreadNotAttached)?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one attach. Returns the descriptor once the last one is gone.
    pub fn release(&self, id: ThreadId) -> GcResult<Option<Arc<ThreadDescriptor>>> {
        let mut threads = self.threads.lock();
        let entry = threads.get_mut(&id).ok_or(GcError::ThreadNotAttached)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(None);
        }
        tracing::debug!(thread = ?id, "thread deregistered");
        Ok(threads.remove(&id).map(|entry| entry.descriptor))
    }

    /// Drop every attach of a thread at once
    pub fn remove(&self, id: ThreadId) -> Option<Arc<ThreadDescriptor>> {
        self.threads.lock().remove(&id).map(|entry| entry.descriptor)
    }

    /// Descriptor of a thread
    pub fn get(&self, id: ThreadId) -> Option<Arc<ThreadDescriptor>> {
        self.threads.lock().get(&id).map(|entry| entry.descriptor.clone())
    }

    /// Number of nested attaches of a thread
    pub fn refs(&self, id: ThreadId) -> usize {
        self.threads.lock().get(&id).map_or(0, |entry| entry.refs)
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Check if no thread is registered
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Lock the registry. The collector holds this for a whole collection.
    pub fn lock(&self) -> MutexGuard<'_, FxHashMap<ThreadId, ThreadEntry>> {
        self.threads.lock()
    }

    /// Forget every thread
    pub fn clear(&self) {
        self.threads.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::native::stack_top;

    fn descriptor() -> Arc<ThreadDescriptor> {
        Arc::new(ThreadDescriptor::for_current(stack_top(), None))
    }

    #[test]
    fn test_registry_creation() {
        let registry = ThreadRegistry::new();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = ThreadRegistry::new();
        registry.register(descriptor()).unwrap();
        assert!(matches!(registry.register(descriptor()), Err(GcError::DuplicateThread)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_nested_attach_refcount() {
        let registry = ThreadRegistry::new();
        let desc = descriptor();
        let id = desc.id();
        registry.register(desc).unwrap();
        registry.retain(id).unwrap();
        assert_eq!(registry.refs(id), 2);

        assert!(registry.release(id).unwrap().is_none());
        assert!(registry.release(id).unwrap().is_some());
        assert!(registry.is_empty());
        assert!(matches!(registry.release(id), Err(GcError::ThreadNotAttached)));
    }

    #[test]
    fn test_native_range_of_current_thread() {
        let desc = descriptor();
        let (sp, top) = desc.native_range().unwrap();
        assert!(sp < top);
        assert_eq!(top, desc.stack_top());
    }

    #[test]
    fn test_native_depth_nests() {
        let desc = descriptor();
        assert!(!desc.in_native());
        assert!(desc.push_native());
        assert!(!desc.push_native());
        assert!(!desc.pop_native());
        assert!(desc.in_native());
        assert!(desc.pop_native());
        assert!(!desc.in_native());
    }

    #[test]
    fn test_default_scanner_is_stack_set() {
        let desc = descriptor();
        let report = desc.scan(Some((0x1000, 0x2000)));
        assert_eq!(report.ranges, vec![(0x1000, 0x2000)]);
    }
}
