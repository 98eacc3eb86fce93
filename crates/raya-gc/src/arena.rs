//! Arena: the public heap object
//!
//! An [`Arena`] is a cheaply cloneable handle to one independent heap.
//! Several arenas may coexist in a process; a thread attaches to each one
//! it allocates from.
//!
//! # Example
//!
//! ```ignore
//! let arena = Arena::new(GcConfig::default())?;
//! arena.attach_thread()?;
//!
//! let pair = arena.alloc_type(TypeDescriptor::new(TypeKind::Fixed, null(), 16, vec![0, 8], None)?);
//! let root = arena.create_owned_root(1)?;
//! root.set(0, arena.allocate(pair)?.as_ptr() as usize);
//!
//! arena.collect()?;
//! arena.detach_thread()?;
//! ```

use crate::backend::GcBackend;
use crate::config::GcConfig;
use crate::defaults::{HEADER_SIZE, PENDING_FREE_THRESHOLD};
use crate::gc::alloc_point::AllocPoint;
use crate::gc::array::{GcArray, GcWeakArray};
use crate::gc::block::{Generation, PoolKind};
use crate::gc::check;
use crate::gc::code::{code_size, CodeBlock};
use crate::gc::collector::{descriptors_in_use, Collection, CollectionKind, GcStats};
use crate::gc::finalizer::FinalizationQueue;
use crate::gc::format::{array_size, fixed_size, walk};
use crate::gc::header::{self, Header};
use crate::gc::heap::{Heap, MemorySummary};
use crate::gc::roots::{OwnedRoot, RootHandle, RootKind, RootTable};
use crate::gc::watch::{Epochs, Mobility, Watch, WatchSource};
use crate::thread::native::{stack_top, with_registers_spilled};
use crate::thread::{SafepointCoordinator, StackScanner, StackSet, ThreadDescriptor, ThreadRegistry};
use crate::types::{DescriptorRef, TypeDescriptor, TypeKind, TypeTable};
use crate::{GcError, GcResult};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// One arena this thread is attached to
struct Attachment {
    arena_id: u64,
    arena: Weak<ArenaShared>,
    descriptor: Arc<ThreadDescriptor>,
}

/// Attachments of the current thread. Dropped at thread exit, which
/// detaches the thread from every arena it forgot to detach from.
#[derive(Default)]
struct Attachments(Vec<Attachment>);

impl Drop for Attachments {
    fn drop(&mut self) {
        for attachment in self.0.drain(..) {
            if let Some(shared) = attachment.arena.upgrade() {
                tracing::debug!(arena = attachment.arena_id, "thread exited while attached");
                shared.forget_thread(&attachment.descriptor);
            }
        }
    }
}

thread_local! {
    static ATTACHMENTS: RefCell<Attachments> = RefCell::new(Attachments::default());
}

fn current_thread(arena_id: u64) -> Option<Arc<ThreadDescriptor>> {
    ATTACHMENTS
        .try_with(|attachments| {
            attachments
                .borrow()
                .0
                .iter()
                .find(|a| a.arena_id == arena_id)
                .map(|a| a.descriptor.clone())
        })
        .ok()
        .flatten()
}

fn forget_attachment(arena_id: u64) {
    let _ = ATTACHMENTS.try_with(|attachments| {
        attachments.borrow_mut().0.retain(|a| a.arena_id != arena_id);
    });
}

/// State shared by every handle of one arena
pub(crate) struct ArenaShared {
    id: u64,
    config: GcConfig,
    types: TypeTable,
    weak_descriptor: Box<TypeDescriptor>,
    roots: Arc<RootTable>,
    heap: Mutex<Heap>,
    static_ap: Mutex<AllocPoint>,
    weak_ap: Mutex<AllocPoint>,
    code_ap: Mutex<AllocPoint>,
    safepoint: SafepointCoordinator,
    registry: ThreadRegistry,
    finalization: FinalizationQueue,
    collections: AtomicU64,
    full_collections: AtomicU64,
    collect_requested: AtomicBool,
    next_alloc_id: AtomicUsize,
    destroyed: AtomicBool,
}

impl ArenaShared {
    fn check_alive(&self) -> GcResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(GcError::Destroyed);
        }
        Ok(())
    }

    /// Entry of every allocation: the only place background work runs
    fn enter_allocation(&self) -> GcResult<Arc<ThreadDescriptor>> {
        self.check_alive()?;
        let thread = current_thread(self.id).ok_or(GcError::ThreadNotAttached)?;
        if thread.in_native() {
            return Err(GcError::InNativeRegion);
        }
        self.safepoint.poll(thread.saved_sp());
        self.check_alive()?;

        if self.collect_requested.swap(false, Ordering::AcqRel) {
            self.collect_if_needed()?;
        }

        let count = thread.count_allocation();
        if count % self.config.finalization_interval.max(1) == 0 && !self.finalization.is_empty() {
            self.drain_finalizers()?;
        }
        #[cfg(feature = "check-memory")]
        if count % self.config.check_interval.max(1) == 0 {
            self.check_memory()?;
        }
        Ok(thread)
    }

    /// Reserve, initialize and commit `size` bytes in `pool`. `init` writes
    /// the header and hidden words of the zeroed memory at `base`.
    fn allocate_in(
        &self,
        thread: &ThreadDescriptor,
        pool: PoolKind,
        size: usize,
        init: impl FnOnce(*mut u8),
    ) -> GcResult<NonNull<u8>> {
        let mut ap = match pool {
            PoolKind::Data => thread.ap.lock(),
            PoolKind::Static => self.static_ap.lock(),
            PoolKind::Weak => self.weak_ap.lock(),
            PoolKind::Code => self.code_ap.lock(),
        };
        let base = match ap.try_reserve(size) {
            Some(base) => base,
            None => {
                let mut heap = self.heap.lock();
                let base = ap.reserve(&mut heap.blocks, size)?;
                if heap.needs_minor() || heap.needs_full() {
                    self.collect_requested.store(true, Ordering::Release);
                }
                base
            }
        };

        let ptr = base as *mut u8;
        init(ptr);
        // SAFETY: the reservation is `size` writable bytes
        unsafe { check::stamp(ptr, size, self.next_alloc_id.fetch_add(1, Ordering::Relaxed)) };
        ap.commit(base, size);
        drop(ap);

        // SAFETY: blocks never start at address zero
        Ok(unsafe { NonNull::new_unchecked(ptr.add(HEADER_SIZE)) })
    }

    fn register_finalizable(&self, descriptor: &TypeDescriptor, client: NonNull<u8>) {
        if descriptor.finalizer().is_some() {
            self.heap.lock().finalizable.push(client.as_ptr() as usize);
        }
    }

    fn allocate_fixed(&self, descriptor: DescriptorRef, pool: PoolKind) -> GcResult<NonNull<u8>> {
        match descriptor.kind() {
            TypeKind::Fixed | TypeKind::FixedWithVTable | TypeKind::TypeDescriptorItself => {}
            other => {
                return Err(GcError::KindMismatch {
                    expected: "fixed object",
                    found: other.name(),
                })
            }
        }
        let pool = if descriptor.kind() == TypeKind::TypeDescriptorItself {
            PoolKind::Static
        } else {
            pool
        };
        let thread = self.enter_allocation()?;
        let size = fixed_size(descriptor.stride());
        let client = self.allocate_in(&thread, pool, size, |base| {
            // SAFETY: `base` is a fresh reservation
            unsafe { header::write_object(base, descriptor.as_ptr()) }
        })?;
        self.register_finalizable(&descriptor, client);
        Ok(client)
    }

    fn collect_if_needed(&self) -> GcResult<()> {
        let kind = {
            let heap = self.heap.lock();
            if heap.needs_full() {
                CollectionKind::Full
            } else if heap.needs_minor() {
                CollectionKind::Minor
            } else {
                return Ok(());
            }
        };
        self.run_collection(kind, true)?;
        Ok(())
    }

    /// Stop the world, retire every allocation point and run `f` on the heap
    fn stopped<R>(&self, mut f: impl FnMut(&[Arc<ThreadDescriptor>], &mut Heap) -> R) -> R {
        // A thread in a native region already left the running set
        let me = current_thread(self.id).filter(|thread| !thread.in_native());
        loop {
            let done = with_registers_spilled(|sp| {
                if let Some(thread) = &me {
                    thread.saved_sp().store(sp, Ordering::Release);
                }
                let _world = self.safepoint.stop_the_world(me.is_some())?;
                let registry = self.registry.lock();
                let threads: Vec<Arc<ThreadDescriptor>> =
                    registry.values().map(|entry| entry.descriptor().clone()).collect();
                for thread in &threads {
                    self.retire(&thread.ap);
                }
                self.retire(&self.static_ap);
                self.retire(&self.weak_ap);
                self.retire(&self.code_ap);

                let mut heap = self.heap.lock();
                let result = f(&threads, &mut heap);
                drop(heap);
                drop(registry);
                Some(result)
            });
            if let Some(result) = done {
                return result;
            }
        }
    }

    fn retire(&self, ap: &Mutex<AllocPoint>) {
        let mut ap = ap.lock();
        let mut heap = self.heap.lock();
        ap.retire(&mut heap.blocks);
    }

    /// Run one collection. With `only_if_needed`, a collection another
    /// thread completed in the meantime satisfies the request.
    fn run_collection(&self, kind: CollectionKind, only_if_needed: bool) -> GcResult<bool> {
        self.check_alive()?;
        let ran = self.stopped(|threads, heap| {
            if only_if_needed && !heap.needs_minor() && !heap.needs_full() {
                return false;
            }
            let collection = Collection {
                heap,
                roots: &self.roots,
                queue: &self.finalization,
                types: &self.types,
                threads,
                scan_native_stacks: self.config.scan_native_stacks,
            };
            // SAFETY: the world is stopped and every allocation point retired
            unsafe { collection.run(kind) };
            self.collections.fetch_add(1, Ordering::Release);
            if kind == CollectionKind::Full {
                self.full_collections.fetch_add(1, Ordering::Release);
            }
            true
        });
        Ok(ran)
    }

    fn drain_finalizers(&self) -> GcResult<usize> {
        match self.finalization.drain() {
            // A finalizer allocating does not drain recursively
            Err(GcError::ReentrantFinalization) => Ok(0),
            other => other,
        }
    }

    /// Release pending descriptors nothing refers to any more
    fn reclaim_descriptors(&self) -> usize {
        self.stopped(|_, heap| {
            // SAFETY: the world is stopped and every block is walkable
            let in_use = unsafe { descriptors_in_use(&heap.blocks) };
            let released = self.types.reclaim(&in_use);
            heap.stats.descriptors_reclaimed += released;
            released
        })
    }

    fn check_memory(&self) -> GcResult<usize> {
        self.check_alive()?;
        // SAFETY: the world is stopped and every allocation point retired
        self.stopped(|_, heap| unsafe { check::verify_blocks(&heap.blocks) })
    }

    /// Remove a thread that exits without detaching
    fn forget_thread(&self, descriptor: &Arc<ThreadDescriptor>) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.retire(&descriptor.ap);
        if !descriptor.in_native() {
            self.safepoint.enter_native(descriptor.saved_sp());
        }
        self.registry.remove(descriptor.id());
    }
}

impl WatchSource for ArenaShared {
    fn mobility(&self, addr: usize) -> Mobility {
        let heap = self.heap.lock();
        let Some(block) = heap.blocks.find(addr).and_then(|id| heap.blocks.get(id)) else {
            return Mobility::Fixed;
        };
        match (block.pool.is_moving(), block.generation) {
            (false, _) => Mobility::Fixed,
            (true, Generation::Young) => Mobility::Young,
            (true, Generation::Old) => Mobility::Old,
        }
    }

    fn epochs(&self) -> Epochs {
        Epochs {
            any: self.collections.load(Ordering::Acquire),
            full: self.full_collections.load(Ordering::Acquire),
        }
    }
}

impl Drop for ArenaShared {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            if let Err(e) = self.drain_finalizers() {
                tracing::warn!(error = %e, "finalizers failed while dropping arena");
            }
        }
        tracing::info!(arena = self.id, "arena dropped");
    }
}

/// Leaves running state for the lifetime of the guard
///
/// While the guard is alive the thread does not hold up stop-the-world
/// pauses. It must not touch the heap until the guard is dropped.
#[must_use = "the thread returns to running state when the region is dropped"]
pub struct NativeRegion<'a> {
    arena: &'a Arena,
    thread: Arc<ThreadDescriptor>,
}

impl NativeRegion<'_> {
    /// Return to running state, waiting out any pause in progress
    pub fn leave(self) {}
}

impl Drop for NativeRegion<'_> {
    fn drop(&mut self) {
        if self.thread.pop_native() {
            self.arena.shared.safepoint.leave_native();
        }
    }
}

/// Handle to a moving, generational heap
#[derive(Clone)]
pub struct Arena {
    shared: Arc<ArenaShared>,
}

impl Arena {
    /// Create an arena
    pub fn new(config: GcConfig) -> GcResult<Self> {
        let id = NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            arena = id,
            block_size = config.block_size,
            limit = config.arena_limit,
            "arena created"
        );
        Ok(Self {
            shared: Arc::new(ArenaShared {
                id,
                types: TypeTable::new(),
                weak_descriptor: Box::new(TypeDescriptor::weak_array()),
                roots: Arc::new(RootTable::new()),
                heap: Mutex::new(Heap::new(&config)),
                static_ap: Mutex::new(AllocPoint::new(PoolKind::Static, Generation::Old)),
                weak_ap: Mutex::new(AllocPoint::new(PoolKind::Weak, Generation::Old)),
                code_ap: Mutex::new(AllocPoint::new(PoolKind::Code, Generation::Old)),
                safepoint: SafepointCoordinator::new(),
                registry: ThreadRegistry::new(),
                finalization: FinalizationQueue::new(),
                collections: AtomicU64::new(0),
                full_collections: AtomicU64::new(0),
                collect_requested: AtomicBool::new(false),
                next_alloc_id: AtomicUsize::new(1),
                destroyed: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Configuration the arena was created with
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    // ===== Types =====

    /// Register a descriptor. It stays valid until freed with [`Arena::free_type`].
    pub fn alloc_type(&self, descriptor: TypeDescriptor) -> DescriptorRef {
        self.shared.types.insert(descriptor)
    }

    /// Schedule a descriptor for release. It is released once a heap walk
    /// shows no allocation refers to it.
    pub fn free_type(&self, descriptor: DescriptorRef) -> GcResult<()> {
        self.shared.check_alive()?;
        let pending = self.shared.types.schedule_free(descriptor);
        if pending > PENDING_FREE_THRESHOLD {
            let released = self.shared.reclaim_descriptors();
            tracing::debug!(released, pending, "reclaimed descriptors");
        }
        Ok(())
    }

    /// Descriptor of the object at `ptr`; `None` for code blocks
    ///
    /// # Safety
    ///
    /// `ptr` must be a live client pointer handed out by this arena.
    pub unsafe fn type_of(&self, ptr: NonNull<u8>) -> Option<DescriptorRef> {
        match Header::read(ptr.as_ptr().sub(HEADER_SIZE)) {
            Header::Object { descriptor, .. } => DescriptorRef::from_raw(descriptor),
            _ => None,
        }
    }

    /// Give a live object a new, layout-compatible descriptor
    ///
    /// # Safety
    ///
    /// `ptr` must be a live client pointer handed out by this arena.
    pub unsafe fn switch_type(&self, ptr: NonNull<u8>, descriptor: DescriptorRef) -> GcResult<()> {
        let current = self.type_of(ptr).ok_or(GcError::KindMismatch {
            expected: descriptor.kind().name(),
            found: "code block",
        })?;
        if current.kind() != descriptor.kind() {
            return Err(GcError::KindMismatch {
                expected: current.kind().name(),
                found: descriptor.kind().name(),
            });
        }
        if !current.is_layout_compatible(&descriptor) {
            return Err(GcError::StrideMismatch(format!(
                "cannot switch a {} of stride {} to stride {}",
                current.kind().name(),
                current.stride(),
                descriptor.stride()
            )));
        }

        header::replace_descriptor(ptr.as_ptr().sub(HEADER_SIZE), descriptor.as_ptr());

        let client = ptr.as_ptr() as usize;
        match (current.finalizer().is_some(), descriptor.finalizer().is_some()) {
            (false, true) => self.shared.heap.lock().finalizable.push(client),
            (true, false) => self.shared.heap.lock().finalizable.retain(|&c| c != client),
            _ => {}
        }
        Ok(())
    }

    // ===== Allocation =====

    /// Allocate a zeroed fixed object
    pub fn allocate(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>> {
        self.shared.allocate_fixed(descriptor, PoolKind::Data)
    }

    /// Allocate a zeroed fixed object in the non-moving pool
    pub fn allocate_static(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>> {
        self.shared.allocate_fixed(descriptor, PoolKind::Static)
    }

    /// Allocate an array of `count` zeroed elements
    pub fn allocate_array(&self, descriptor: DescriptorRef, count: usize) -> GcResult<NonNull<u8>> {
        if descriptor.kind() != TypeKind::Array {
            return Err(GcError::KindMismatch {
                expected: TypeKind::Array.name(),
                found: descriptor.kind().name(),
            });
        }
        let size = array_size(descriptor.stride(), count).ok_or(GcError::OutOfMemory {
            requested: usize::MAX,
            limit: self.shared.config.arena_limit,
        })?;
        let thread = self.shared.enter_allocation()?;
        let client = self.shared.allocate_in(&thread, PoolKind::Data, size, |base| {
            // SAFETY: `base` is a fresh reservation of `size` bytes
            unsafe {
                header::write_object(base, descriptor.as_ptr());
                GcArray::init(base.add(HEADER_SIZE), count);
            }
        })?;
        self.shared.register_finalizable(&descriptor, client);
        Ok(client)
    }

    /// Allocate a weak array of `count` null slots. Zero slots yield `None`.
    pub fn allocate_weak_array(&self, count: usize) -> GcResult<Option<NonNull<u8>>> {
        if count == 0 {
            return Ok(None);
        }
        let size = array_size(crate::defaults::WORD, count).ok_or(GcError::OutOfMemory {
            requested: usize::MAX,
            limit: self.shared.config.arena_limit,
        })?;
        let thread = self.shared.enter_allocation()?;
        let descriptor: *const TypeDescriptor = &*self.shared.weak_descriptor;
        let client = self.shared.allocate_in(&thread, PoolKind::Weak, size, |base| {
            // SAFETY: `base` is a fresh reservation of `size` bytes
            unsafe {
                header::write_object(base, descriptor);
                GcWeakArray::init(base.add(HEADER_SIZE), count);
            }
        })?;
        Ok(Some(client))
    }

    /// Allocate a code block for `size` bytes of machine code and `refs`
    /// reference table entries, all unset
    pub fn allocate_code(&self, size: usize, refs: usize) -> GcResult<NonNull<u8>> {
        let total = code_size(size, refs).ok_or(GcError::OutOfMemory {
            requested: usize::MAX,
            limit: self.shared.config.arena_limit,
        })?;
        let thread = self.shared.enter_allocation()?;
        self.shared.allocate_in(&thread, PoolKind::Code, total, |base| {
            // SAFETY: `base` is a fresh reservation of `total` bytes
            unsafe {
                header::write_code(base, size);
                CodeBlock::init(base.add(HEADER_SIZE), size, refs);
            }
        })
    }

    // ===== Roots =====

    /// Register a root
    ///
    /// # Safety
    ///
    /// Ranges must stay valid until the root is destroyed.
    pub unsafe fn create_root(&self, kind: RootKind) -> GcResult<RootHandle> {
        self.shared.check_alive()?;
        Ok(self.shared.roots.create(kind))
    }

    /// Register `count` heap-owned exact slots, destroyed with the handle
    pub fn create_owned_root(&self, count: usize) -> GcResult<OwnedRoot> {
        self.shared.check_alive()?;
        Ok(OwnedRoot::new(self.shared.roots.clone(), count))
    }

    /// Deregister a root
    pub fn destroy_root(&self, handle: RootHandle) -> GcResult<()> {
        self.shared.roots.destroy(handle)
    }

    // ===== Threads =====

    /// Attach the calling thread. Nested attaches are counted.
    pub fn attach_thread(&self) -> GcResult<()> {
        self.attach(None)
    }

    /// Attach the calling thread with a root callback of its own instead of
    /// the default green-thread stack set
    pub fn attach_thread_with_scanner(&self, scanner: Arc<dyn StackScanner>) -> GcResult<()> {
        self.attach(Some(scanner))
    }

    fn attach(&self, scanner: Option<Arc<dyn StackScanner>>) -> GcResult<()> {
        let shared = &self.shared;
        shared.check_alive()?;
        if let Some(thread) = current_thread(shared.id) {
            return shared.registry.retain(thread.id());
        }

        let descriptor = Arc::new(ThreadDescriptor::for_current(stack_top(), scanner));
        shared.registry.register(descriptor.clone())?;
        ATTACHMENTS.with(|attachments| {
            attachments.borrow_mut().0.push(Attachment {
                arena_id: shared.id,
                arena: Arc::downgrade(shared),
                descriptor: descriptor.clone(),
            })
        });
        shared.safepoint.leave_native();
        tracing::info!(arena = shared.id, thread = ?descriptor.id(), "thread attached");
        Ok(())
    }

    /// Undo one attach of the calling thread. The last one releases its
    /// allocation point and removes its roots.
    pub fn detach_thread(&self) -> GcResult<()> {
        let shared = &self.shared;
        shared.check_alive()?;
        let thread = current_thread(shared.id).ok_or(GcError::ThreadNotAttached)?;
        if thread.in_native() {
            return Err(GcError::InNativeRegion);
        }
        if shared.registry.refs(thread.id()) > 1 {
            shared.registry.release(thread.id())?;
            return Ok(());
        }

        shared.retire(&thread.ap);
        shared.safepoint.enter_native(thread.saved_sp());
        shared.registry.release(thread.id())?;
        forget_attachment(shared.id);
        tracing::info!(arena = shared.id, thread = ?thread.id(), "thread detached");
        Ok(())
    }

    /// Refresh the calling thread's stack bounds after it was handed to
    /// another runtime. The thread must be attached.
    pub fn reattach_thread(&self) -> GcResult<()> {
        self.shared.check_alive()?;
        let thread = current_thread(self.shared.id).ok_or(GcError::ThreadNotAttached)?;
        thread.refresh_stack(stack_top());
        tracing::debug!(thread = ?thread.id(), "thread re-attached");
        Ok(())
    }

    /// Check whether the calling thread is attached
    pub fn is_attached(&self) -> bool {
        current_thread(self.shared.id).is_some()
    }

    /// Number of attached threads
    pub fn thread_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Green-thread stacks of the calling thread, for the scheduler to update
    pub fn thread_stacks(&self) -> GcResult<Arc<StackSet>> {
        let thread = current_thread(self.shared.id).ok_or(GcError::ThreadNotAttached)?;
        Ok(thread.stacks().clone())
    }

    /// Wait out a pending pause. For long loops that do not allocate.
    pub fn safepoint(&self) -> GcResult<()> {
        let thread = current_thread(self.shared.id).ok_or(GcError::ThreadNotAttached)?;
        if !thread.in_native() {
            self.shared.safepoint.poll(thread.saved_sp());
        }
        Ok(())
    }

    /// Leave running state until the returned region is dropped. Regions
    /// nest; the thread runs again when the outermost one ends. Allocating
    /// or detaching inside a region fails with [`GcError::InNativeRegion`].
    pub fn enter_native(&self) -> GcResult<NativeRegion<'_>> {
        let thread = current_thread(self.shared.id).ok_or(GcError::ThreadNotAttached)?;
        if thread.push_native() {
            self.shared.safepoint.enter_native(thread.saved_sp());
        }
        Ok(NativeRegion { arena: self, thread })
    }

    // ===== Collection =====

    /// Run a full collection, then drain finalizers
    pub fn collect(&self) -> GcResult<()> {
        self.shared.run_collection(CollectionKind::Full, false)?;
        self.shared.drain_finalizers()?;
        Ok(())
    }

    /// Run a minor collection
    pub fn collect_minor(&self) -> GcResult<()> {
        self.shared.run_collection(CollectionKind::Minor, false)?;
        Ok(())
    }

    /// Do one bounded unit of collection work
    ///
    /// Collects the nursery if it holds anything; otherwise runs a full
    /// collection if the old generation is over its threshold and the
    /// budget is not zero. Returns whether a collection ran. Calling it
    /// until it returns `false` converges.
    pub fn collect_step(&self, budget: Duration) -> GcResult<bool> {
        let shared = &self.shared;
        shared.check_alive()?;
        let kind = {
            let heap = shared.heap.lock();
            if heap.has_young() {
                CollectionKind::Minor
            } else if heap.needs_full() && !budget.is_zero() {
                CollectionKind::Full
            } else {
                return Ok(false);
            }
        };
        shared.run_collection(kind, false)?;
        shared.drain_finalizers()?;
        Ok(true)
    }

    /// Visit every data object with the world stopped
    ///
    /// The visitor must not call back into the arena.
    pub fn walk_objects(&self, mut visit: impl FnMut(NonNull<u8>, DescriptorRef)) -> GcResult<()> {
        self.shared.check_alive()?;
        self.shared.stopped(|_, heap| {
            for id in heap.blocks.ids() {
                let Some(block) = heap.blocks.get(id) else {
                    continue;
                };
                if block.pool == PoolKind::Code {
                    continue;
                }
                // SAFETY: the world is stopped and every block is walkable
                unsafe {
                    walk(block.pool.format(), block.start(), block.limit(), |base, header| {
                        if let Header::Object { descriptor, .. } = header {
                            if let Some(descriptor) = DescriptorRef::from_raw(descriptor) {
                                visit(NonNull::new_unchecked(base.add(HEADER_SIZE)), descriptor);
                            }
                        }
                    })?;
                }
            }
            Ok(())
        })
    }

    /// Create a staleness oracle for cached addresses
    pub fn create_watch(&self) -> Watch {
        Watch::new(self.shared.clone())
    }

    // ===== Finalization =====

    /// Run pending finalizers. Fails when called from inside a finalizer.
    pub fn run_finalizers(&self) -> GcResult<usize> {
        self.shared.check_alive()?;
        self.shared.finalization.drain()
    }

    /// Number of objects waiting for their finalizer
    pub fn pending_finalizers(&self) -> usize {
        self.shared.finalization.len()
    }

    /// Whether the object's finalizer has not run yet
    ///
    /// # Safety
    ///
    /// `ptr` must be a live client pointer handed out by this arena.
    pub unsafe fn is_live(&self, ptr: NonNull<u8>) -> bool {
        match Header::read(ptr.as_ptr().sub(HEADER_SIZE)) {
            Header::Object { finalized, .. } => !finalized,
            _ => true,
        }
    }

    // ===== Diagnostics =====

    /// Walk the whole heap and verify its structure (and canaries, with the
    /// `check-memory` feature). Returns the number of allocations and markers.
    pub fn check_memory(&self) -> GcResult<usize> {
        self.shared.check_memory()
    }

    /// Collection statistics
    pub fn stats(&self) -> GcStats {
        self.shared.heap.lock().stats.clone()
    }

    /// Memory usage per pool
    pub fn summary(&self) -> MemorySummary {
        self.shared.heap.lock().summary()
    }

    /// Stop-the-world pause statistics as (pauses, total us, max us)
    pub fn pause_stats(&self) -> (usize, usize, usize) {
        let stats = &self.shared.safepoint.stats;
        (stats.total_pauses(), stats.total_pause_time_us(), stats.max_pause_time_us())
    }

    // ===== Lifecycle =====

    /// Run the remaining finalizers, then detach every thread, drop every
    /// root and unmap all memory. Later calls fail with [`GcError::Destroyed`].
    ///
    /// Other attached threads must be parked or in native state.
    pub fn destroy(&self) -> GcResult<()> {
        let shared = &self.shared;
        if shared.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        shared.drain_finalizers()?;

        shared.stopped(|_, heap| {
            shared.destroyed.store(true, Ordering::Release);
            heap.finalizable.clear();
            heap.blocks.clear();
        });
        shared.registry.clear();
        shared.roots.clear();
        shared.finalization.clear();
        forget_attachment(shared.id);
        tracing::info!(arena = shared.id, "arena destroyed");
        Ok(())
    }

    /// Check whether [`Arena::destroy`] has run
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.shared.id)
            .field("threads", &self.shared.registry.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl GcBackend for Arena {
    fn name(&self) -> &'static str {
        "arena"
    }

    fn alloc_type(&self, descriptor: TypeDescriptor) -> DescriptorRef {
        Arena::alloc_type(self, descriptor)
    }

    fn free_type(&self, descriptor: DescriptorRef) -> GcResult<()> {
        Arena::free_type(self, descriptor)
    }

    fn allocate(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>> {
        Arena::allocate(self, descriptor)
    }

    fn allocate_array(&self, descriptor: DescriptorRef, count: usize) -> GcResult<NonNull<u8>> {
        Arena::allocate_array(self, descriptor, count)
    }

    fn allocate_weak_array(&self, count: usize) -> GcResult<Option<NonNull<u8>>> {
        Arena::allocate_weak_array(self, count)
    }

    fn allocate_static(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>> {
        Arena::allocate_static(self, descriptor)
    }

    fn allocate_code(&self, size: usize, refs: usize) -> GcResult<NonNull<u8>> {
        Arena::allocate_code(self, size, refs)
    }

    unsafe fn type_of(&self, ptr: NonNull<u8>) -> Option<DescriptorRef> {
        Arena::type_of(self, ptr)
    }

    unsafe fn switch_type(&self, ptr: NonNull<u8>, descriptor: DescriptorRef) -> GcResult<()> {
        Arena::switch_type(self, ptr, descriptor)
    }

    fn attach_thread(&self) -> GcResult<()> {
        Arena::attach_thread(self)
    }

    fn detach_thread(&self) -> GcResult<()> {
        Arena::detach_thread(self)
    }

    fn collect(&self) -> GcResult<()> {
        Arena::collect(self)
    }

    fn collect_step(&self, budget: Duration) -> GcResult<bool> {
        Arena::collect_step(self, budget)
    }

    fn walk_objects(&self, visit: &mut dyn FnMut(NonNull<u8>, DescriptorRef)) -> GcResult<()> {
        Arena::walk_objects(self, visit)
    }

    fn create_watch(&self) -> Watch {
        Arena::create_watch(self)
    }

    fn run_finalizers(&self) -> GcResult<usize> {
        Arena::run_finalizers(self)
    }

    unsafe fn is_live(&self, ptr: NonNull<u8>) -> bool {
        Arena::is_live(self, ptr)
    }
}
