//! Non-moving fallback backend
//!
//! [`MallocBackend`] bump-allocates from fixed-size chunks and never frees,
//! never moves and never collects. Objects keep the same header layout as
//! in an [`Arena`](crate::Arena), with canary words in the check-memory
//! build, so runtime code runs unchanged on either backend.

use crate::backend::GcBackend;
use crate::config::GcConfig;
use crate::defaults::{HEADER_SIZE, WORD};
use crate::gc::array::{GcArray, GcWeakArray};
use crate::gc::block::PoolKind;
use crate::gc::check;
use crate::gc::code::{code_size, CodeBlock};
use crate::gc::format::{array_size, fixed_size, walk};
use crate::gc::header::{self, Header};
use crate::gc::memory::{Chunk, Protection};
use crate::gc::watch::{Epochs, Mobility, Watch, WatchSource};
use crate::types::{DescriptorRef, TypeDescriptor, TypeKind, TypeTable};
use crate::{GcError, GcResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

/// Size of the chunks objects are carved from
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk with a bump cursor
struct BumpChunk {
    chunk: Chunk,
    used: usize,
}

impl BumpChunk {
    fn free(&self) -> usize {
        self.chunk.size() - self.used
    }
}

/// Chunks of every pool plus the mapped total
struct Chunks {
    pools: FxHashMap<PoolKind, Vec<BumpChunk>>,
    mapped: usize,
}

/// The fallback never moves anything
struct Immovable;

impl WatchSource for Immovable {
    fn mobility(&self, _addr: usize) -> Mobility {
        Mobility::Fixed
    }

    fn epochs(&self) -> Epochs {
        Epochs { any: 0, full: 0 }
    }
}

/// Heap that allocates and never collects
pub struct MallocBackend {
    config: GcConfig,
    types: TypeTable,
    weak_descriptor: Box<TypeDescriptor>,
    chunks: Mutex<Chunks>,
    threads: Mutex<FxHashMap<ThreadId, usize>>,
    next_alloc_id: std::sync::atomic::AtomicUsize,
}

impl MallocBackend {
    /// Create an empty heap
    pub fn new(config: GcConfig) -> Self {
        tracing::info!(limit = config.arena_limit, "fallback heap created");
        Self {
            config,
            types: TypeTable::new(),
            weak_descriptor: Box::new(TypeDescriptor::weak_array()),
            chunks: Mutex::new(Chunks {
                pools: FxHashMap::default(),
                mapped: 0,
            }),
            threads: Mutex::new(FxHashMap::default()),
            next_alloc_id: std::sync::atomic::AtomicUsize::new(1),
        }
    }

    /// Bytes mapped so far
    pub fn mapped(&self) -> usize {
        self.chunks.lock().mapped
    }

    fn check_attached(&self) -> GcResult<()> {
        if self.threads.lock().contains_key(&std::thread::current().id()) {
            Ok(())
        } else {
            Err(GcError::ThreadNotAttached)
        }
    }

    fn reserve(&self, pool: PoolKind, size: usize) -> GcResult<usize> {
        let mut chunks = self.chunks.lock();
        let Chunks { pools, mapped } = &mut *chunks;
        let list = pools.entry(pool).or_default();
        if let Some(last) = list.last_mut() {
            if last.free() >= size {
                let base = last.chunk.start() + last.used;
                last.used += size;
                return Ok(base);
            }
        }

        let wanted = size.max(CHUNK_SIZE);
        if *mapped + wanted > self.config.arena_limit {
            return Err(GcError::OutOfMemory {
                requested: size,
                limit: self.config.arena_limit,
            });
        }
        let protection = if pool == PoolKind::Code && self.config.executable_code {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        };
        let chunk = Chunk::map(wanted, protection)?;
        *mapped += chunk.size();
        tracing::debug!(?pool, size = chunk.size(), "fallback chunk mapped");
        let base = chunk.start();
        list.push(BumpChunk { chunk, used: size });
        Ok(base)
    }

    fn allocate_in(&self, pool: PoolKind, size: usize, init: impl FnOnce(*mut u8)) -> GcResult<NonNull<u8>> {
        self.check_attached()?;
        let base = self.reserve(pool, size)? as *mut u8;
        init(base);
        let alloc_id = self.next_alloc_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        // SAFETY: the reservation is `size` zeroed bytes we own
        unsafe {
            check::stamp(base, size, alloc_id);
            Ok(NonNull::new_unchecked(base.add(HEADER_SIZE)))
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
        self.allocate_in(pool, fixed_size(descriptor.stride()), |base| {
            // SAFETY: `base` is a fresh reservation
            unsafe { header::write_object(base, descriptor.as_ptr()) }
        })
    }

    fn too_large(&self) -> GcError {
        GcError::OutOfMemory {
            requested: usize::MAX,
            limit: self.config.arena_limit,
        }
    }
}

impl GcBackend for MallocBackend {
    fn name(&self) -> &'static str {
        "malloc"
    }

    fn alloc_type(&self, descriptor: TypeDescriptor) -> DescriptorRef {
        self.types.insert(descriptor)
    }

    /// Objects are never freed, so neither are descriptors
    fn free_type(&self, descriptor: DescriptorRef) -> GcResult<()> {
        self.types.schedule_free(descriptor);
        Ok(())
    }

    fn allocate(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>> {
        self.allocate_fixed(descriptor, PoolKind::Data)
    }

    fn allocate_array(&self, descriptor: DescriptorRef, count: usize) -> GcResult<NonNull<u8>> {
        if descriptor.kind() != TypeKind::Array {
            return Err(GcError::KindMismatch {
                expected: TypeKind::Array.name(),
                found: descriptor.kind().name(),
            });
        }
        let size = array_size(descriptor.stride(), count).ok_or_else(|| self.too_large())?;
        self.allocate_in(PoolKind::Data, size, |base| {
            // SAFETY: `base` is a fresh reservation of `size` bytes
            unsafe {
                header::write_object(base, descriptor.as_ptr());
                GcArray::init(base.add(HEADER_SIZE), count);
            }
        })
    }

    fn allocate_weak_array(&self, count: usize) -> GcResult<Option<NonNull<u8>>> {
        if count == 0 {
            return Ok(None);
        }
        let size = array_size(WORD, count).ok_or_else(|| self.too_large())?;
        let descriptor: *const TypeDescriptor = &*self.weak_descriptor;
        self.allocate_in(PoolKind::Weak, size, |base| {
            // SAFETY: `base` is a fresh reservation of `size` bytes
            unsafe {
                header::write_object(base, descriptor);
                GcWeakArray::init(base.add(HEADER_SIZE), count);
            }
        })
        .map(Some)
    }

    fn allocate_static(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>> {
        self.allocate_fixed(descriptor, PoolKind::Static)
    }

    fn allocate_code(&self, size: usize, refs: usize) -> GcResult<NonNull<u8>> {
        let total = code_size(size, refs).ok_or_else(|| self.too_large())?;
        self.allocate_in(PoolKind::Code, total, |base| {
            // SAFETY: `base` is a fresh reservation of `total` bytes
            unsafe {
                header::write_code(base, size);
                CodeBlock::init(base.add(HEADER_SIZE), size, refs);
            }
        })
    }

    unsafe fn type_of(&self, ptr: NonNull<u8>) -> Option<DescriptorRef> {
        match Header::read(ptr.as_ptr().sub(HEADER_SIZE)) {
            Header::Object { descriptor, .. } => DescriptorRef::from_raw(descriptor),
            _ => None,
        }
    }

    unsafe fn switch_type(&self, ptr: NonNull<u8>, descriptor: DescriptorRef) -> GcResult<()> {
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
                "cannot switch stride {} to {}",
                current.stride(),
                descriptor.stride()
            )));
        }
        header::replace_descriptor(ptr.as_ptr().sub(HEADER_SIZE), descriptor.as_ptr());
        Ok(())
    }

    fn attach_thread(&self) -> GcResult<()> {
        *self.threads.lock().entry(std::thread::current().id()).or_insert(0) += 1;
        Ok(())
    }

    fn detach_thread(&self) -> GcResult<()> {
        let mut threads = self.threads.lock();
        let id = std::thread::current().id();
        let refs = threads.get_mut(&id).ok_or(GcError::ThreadNotAttached)?;
        *refs -= 1;
        if *refs == 0 {
            threads.remove(&id);
        }
        Ok(())
    }

    fn collect(&self) -> GcResult<()> {
        Ok(())
    }

    fn collect_step(&self, _budget: Duration) -> GcResult<bool> {
        Ok(false)
    }

    fn walk_objects(&self, visit: &mut dyn FnMut(NonNull<u8>, DescriptorRef)) -> GcResult<()> {
        let chunks = self.chunks.lock();
        for (pool, list) in &chunks.pools {
            if *pool == PoolKind::Code {
                continue;
            }
            for bump in list {
                let start = bump.chunk.start();
                // SAFETY: chunks hold contiguous allocations up to `used`
                unsafe {
                    walk(pool.format(), start, start + bump.used, |base, header| {
                        if let Header::Object { descriptor, .. } = header {
                            if let Some(descriptor) = DescriptorRef::from_raw(descriptor) {
                                visit(NonNull::new_unchecked(base.add(HEADER_SIZE)), descriptor);
                            }
                        }
                    })?;
                }
            }
        }
        Ok(())
    }

    fn create_watch(&self) -> Watch {
        Watch::new(Arc::new(Immovable))
    }

    /// Nothing dies, so nothing is ever queued
    fn run_finalizers(&self) -> GcResult<usize> {
        Ok(0)
    }

    unsafe fn is_live(&self, ptr: NonNull<u8>) -> bool {
        match Header::read(ptr.as_ptr().sub(HEADER_SIZE)) {
            Header::Object { finalized, .. } => !finalized,
            _ => true,
        }
    }
}
