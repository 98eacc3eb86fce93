//! Default constants for heap configuration and object layout.
//!
//! The layout constants form the binary contract with separately compiled
//! code: header size, alignment and the array header must match byte for
//! byte across everything loaded into one process.

use std::mem::size_of;

/// Size of a machine word in bytes.
pub const WORD: usize = size_of::<usize>();

/// Size of the hidden header preceding every client pointer.
#[cfg(not(feature = "check-memory"))]
pub const HEADER_SIZE: usize = WORD;

/// Size of the hidden header preceding every client pointer.
///
/// Layout: type word, total size, allocation id, canary word.
#[cfg(feature = "check-memory")]
pub const HEADER_SIZE: usize = 4 * WORD;

/// Alignment of every allocation.
#[cfg(not(feature = "check-memory"))]
pub const ALIGNMENT: usize = WORD;

/// Alignment of every allocation. Gaps must be able to hold a full header.
#[cfg(feature = "check-memory")]
pub const ALIGNMENT: usize = HEADER_SIZE;

/// Canary bytes following every live payload.
#[cfg(not(feature = "check-memory"))]
pub const FOOTER_SIZE: usize = 0;

/// Canary bytes following every live payload.
#[cfg(feature = "check-memory")]
pub const FOOTER_SIZE: usize = WORD;

/// Hidden words at the start of an array payload: element count and filled count.
pub const ARRAY_HEADER_SIZE: usize = 2 * WORD;

/// Bytes between the start of a dispatch table allocation and the pointer
/// stored in objects. Tables are word arrays and objects point at element 0.
pub const VTABLE_ALLOC_OFFSET: usize = ARRAY_HEADER_SIZE;

/// Default size of one pool block (64 KB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default amount of young memory that triggers a minor collection (2 MB).
pub const DEFAULT_NURSERY_LIMIT: usize = 2 * 1024 * 1024;

/// Default amount of old memory that triggers a full collection (16 MB).
pub const DEFAULT_OLD_THRESHOLD: usize = 16 * 1024 * 1024;

/// Default maximum amount of memory the arena may map (1 GB).
pub const DEFAULT_ARENA_LIMIT: usize = 1024 * 1024 * 1024;

/// Default number of allocations on one thread between finalizer drains.
pub const DEFAULT_FINALIZATION_INTERVAL: usize = 500;

/// Default number of allocations on one thread between consistency checks.
pub const DEFAULT_CHECK_INTERVAL: usize = 100_000;

/// Pending descriptor frees tolerated before a reclamation walk is forced.
pub const PENDING_FREE_THRESHOLD: usize = 100;

/// Canary byte written before the payload.
pub const CANARY_HEADER: u8 = 0xBB;

/// Canary byte written after the payload.
pub const CANARY_FOOTER: u8 = 0xAA;

/// Round `size` up to [`ALIGNMENT`].
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}
