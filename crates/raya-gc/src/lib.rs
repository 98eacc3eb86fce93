//! Raya moving heap
//!
//! This crate provides the memory substrate of the Raya runtime:
//! - Precise, generational, copying collection driven by per-type pointer maps
//! - Arrays, weak arrays and non-moving static objects
//! - A relocatable code pool whose blocks carry their own reference table
//! - Thread registry and root scanning for green threads multiplexed on OS threads
//! - Asynchronous finalization drained from allocation calls
//! - A non-moving fallback backend with the same external contract
//!
//! The collector never interprets objects itself. Everything it knows about
//! memory comes from the object formats in [`gc::format`] and [`gc::code`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod backend;
pub mod config;
pub mod defaults;
pub mod fallback;
pub mod gc;
pub mod thread;
pub mod types;

pub use arena::{Arena, NativeRegion};
pub use backend::GcBackend;
pub use config::GcConfig;
pub use fallback::MallocBackend;
pub use gc::array::{GcArray, GcWeakArray};
pub use gc::code::{CodeRef, CodeRefKind};
pub use gc::collector::{CollectionKind, GcStats};
pub use gc::heap::{MemorySummary, PoolSummary};
pub use gc::roots::{OwnedRoot, RootHandle, RootKind};
pub use gc::watch::Watch;
pub use thread::stacks::{LightweightStack, StackScanReport, StackScanner, StackSet, StackState};
pub use types::{DescriptorRef, Finalizer, TypeDescriptor, TypeKind};

/// Heap errors
///
/// Every variant is either a fatal allocation failure or an internal
/// consistency failure. Neither is meant to be recovered from: the surrounding
/// runtime is expected to report the error and stop.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// The arena limit would be exceeded
    #[error("Out of memory: requested {requested} bytes with arena limit {limit}")]
    OutOfMemory {
        /// Bytes that were requested
        requested: usize,
        /// Configured arena limit
        limit: usize,
    },

    /// The operating system refused to map memory
    #[error("Failed to reserve {size} bytes: {reason}")]
    ReservationFailed {
        /// Bytes that were requested
        size: usize,
        /// Reason reported by the platform
        reason: String,
    },

    /// A descriptor was used with an allocation entry point of another kind
    #[error("Kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Kind the entry point requires
        expected: &'static str,
        /// Kind of the descriptor that was passed
        found: &'static str,
    },

    /// A descriptor's stride or offsets are inconsistent with its kind
    #[error("Stride mismatch: {0}")]
    StrideMismatch(String),

    /// The calling thread is not attached to this arena
    #[error("Thread is not attached to the arena")]
    ThreadNotAttached,

    /// The thread is already present in the registry
    #[error("Thread registered twice")]
    DuplicateThread,

    /// Finalizers were drained from inside a finalizer
    #[error("Finalizer drain re-entered from a finalizer")]
    ReentrantFinalization,

    /// An object reached the finalization queue after it was finalized
    #[error("Object at {0:#x} finalized twice")]
    DoubleFinalization(usize),

    /// A relative code operand cannot encode its target
    #[error("Relative operand at offset {offset} cannot reach {target:#x}")]
    RelativeOutOfRange {
        /// Offset of the operand within the code
        offset: usize,
        /// Target address
        target: usize,
    },

    /// The calling thread is inside a native region
    #[error("Thread is in a native region")]
    InNativeRegion,

    /// A root handle that does not exist was destroyed
    #[error("Unknown root handle {0}")]
    UnknownRoot(u64),

    /// A heap walk found a structural inconsistency
    #[error("Heap corrupted: {0}")]
    HeapCorrupted(String),

    /// The arena has already been destroyed
    #[error("Arena has been destroyed")]
    Destroyed,
}

impl GcError {
    /// Check whether this is an allocation failure (as opposed to a defect in
    /// the caller or in the heap's own bookkeeping)
    pub fn is_fatal_allocation(&self) -> bool {
        matches!(
            self,
            GcError::OutOfMemory { .. } | GcError::ReservationFailed { .. }
        )
    }
}

/// Heap result
pub type GcResult<T> = Result<T, GcError>;
