//! Backend contract
//!
//! The runtime talks to the heap through [`GcBackend`]. [`crate::Arena`] is
//! the moving collector; [`crate::MallocBackend`] is a non-moving fallback
//! for bring-up and debugging. Both lay objects out identically, so code
//! compiled against one runs unchanged on the other.

use crate::gc::watch::Watch;
use crate::types::{DescriptorRef, TypeDescriptor};
use crate::GcResult;
use std::ptr::NonNull;
use std::time::Duration;

/// Operations every heap backend provides
pub trait GcBackend: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &'static str;

    /// Register a descriptor
    fn alloc_type(&self, descriptor: TypeDescriptor) -> DescriptorRef;

    /// Release a descriptor once no object refers to it any more
    fn free_type(&self, descriptor: DescriptorRef) -> GcResult<()>;

    /// Allocate a fixed object, zeroed
    fn allocate(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>>;

    /// Allocate an array of `count` zeroed elements
    fn allocate_array(&self, descriptor: DescriptorRef, count: usize) -> GcResult<NonNull<u8>>;

    /// Allocate a weak array. A zero-element request returns `None`.
    fn allocate_weak_array(&self, count: usize) -> GcResult<Option<NonNull<u8>>>;

    /// Allocate a fixed object that never moves
    fn allocate_static(&self, descriptor: DescriptorRef) -> GcResult<NonNull<u8>>;

    /// Allocate a code block for `size` bytes of code and `refs` reference
    /// table entries. The caller fills in both.
    fn allocate_code(&self, size: usize, refs: usize) -> GcResult<NonNull<u8>>;

    /// Descriptor of a data object; `None` for code blocks
    ///
    /// # Safety
    ///
    /// `ptr` must be a live client pointer handed out by this backend.
    unsafe fn type_of(&self, ptr: NonNull<u8>) -> Option<DescriptorRef>;

    /// Replace the descriptor of a live object with a layout-compatible one
    ///
    /// # Safety
    ///
    /// As for [`GcBackend::type_of`].
    unsafe fn switch_type(&self, ptr: NonNull<u8>, descriptor: DescriptorRef) -> GcResult<()>;

    /// Attach the calling thread. Nested attaches are counted.
    fn attach_thread(&self) -> GcResult<()>;

    /// Undo one attach of the calling thread
    fn detach_thread(&self) -> GcResult<()>;

    /// Run a full collection, then drain finalizers
    fn collect(&self) -> GcResult<()>;

    /// Do a bounded amount of collection work. Returns whether any was done.
    fn collect_step(&self, budget: Duration) -> GcResult<bool>;

    /// Visit every data object with the world stopped
    fn walk_objects(&self, visit: &mut dyn FnMut(NonNull<u8>, DescriptorRef)) -> GcResult<()>;

    /// Create a staleness oracle for cached addresses
    fn create_watch(&self) -> Watch;

    /// Run pending finalizers. Returns the number run.
    fn run_finalizers(&self) -> GcResult<usize>;

    /// Whether an object has not been finalized yet
    ///
    /// # Safety
    ///
    /// As for [`GcBackend::type_of`].
    unsafe fn is_live(&self, ptr: NonNull<u8>) -> bool;
}
