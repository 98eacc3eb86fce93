//! Array views
//!
//! Array payloads start with two hidden words:
//!
//! ```text
//! GcArray                         GcWeakArray
//! ┌──────────────┐                ┌──────────────────────┐
//! │ count        │                │ (count << 1) | 1     │
//! │ filled       │                │ (splatted << 1) | 1  │
//! ├──────────────┤                ├──────────────────────┤
//! │ element 0    │                │ slot 0               │
//! │ ...          │                │ ...                  │
//! └──────────────┘                └──────────────────────┘
//! ```
//!
//! Weak counters carry a tag bit so they can never be mistaken for a
//! reference. The views below are the only code that reads them.

use crate::defaults::{ARRAY_HEADER_SIZE, WORD};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

#[inline]
fn tag(value: usize) -> usize {
    (value << 1) | 1
}

#[inline]
fn untag(raw: usize) -> usize {
    debug_assert_eq!(raw & 1, 1, "weak counter lost its tag");
    raw >> 1
}

/// View of an [`Array`](crate::TypeKind::Array) allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcArray {
    ptr: NonNull<u8>,
}

impl GcArray {
    /// Wrap a client pointer
    ///
    /// # Safety
    ///
    /// `ptr` must be the client pointer of an array allocation.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Write the hidden words of a fresh array
    ///
    /// # Safety
    ///
    /// `ptr` must point to a zeroed array payload.
    #[inline]
    pub(crate) unsafe fn init(ptr: *mut u8, count: usize) {
        *(ptr as *mut usize) = count;
    }

    /// Client pointer
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn words(&self) -> *mut usize {
        self.ptr.as_ptr() as *mut usize
    }

    /// Number of elements
    #[inline]
    pub fn count(&self) -> usize {
        // SAFETY: guaranteed by `from_raw`
        unsafe { *self.words() }
    }

    /// Number of elements the runtime has marked as in use
    #[inline]
    pub fn filled(&self) -> usize {
        // SAFETY: guaranteed by `from_raw`
        unsafe { *self.words().add(1) }
    }

    /// Update the filled count. Values above `count` are clamped.
    #[inline]
    pub fn set_filled(&self, filled: usize) {
        let filled = filled.min(self.count());
        // SAFETY: guaranteed by `from_raw`
        unsafe { *self.words().add(1) = filled }
    }

    /// Address of element `index` for an array of `stride`-byte elements
    #[inline]
    pub fn element(&self, index: usize, stride: usize) -> *mut u8 {
        debug_assert!(index < self.count());
        // SAFETY: within the allocation for in-range indices
        unsafe { self.ptr.as_ptr().add(ARRAY_HEADER_SIZE + index * stride) }
    }

    /// Read a word-sized element (stride = one word)
    #[inline]
    pub fn get(&self, index: usize) -> usize {
        assert!(index < self.count(), "index {index} out of bounds");
        // SAFETY: bounds checked above
        unsafe { *(self.element(index, WORD) as *const usize) }
    }

    /// Write a word-sized element (stride = one word)
    #[inline]
    pub fn set(&self, index: usize, value: usize) {
        assert!(index < self.count(), "index {index} out of bounds");
        // SAFETY: bounds checked above
        unsafe { *(self.element(index, WORD) as *mut usize) = value }
    }
}

/// View of a [`WeakArray`](crate::TypeKind::WeakArray) allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcWeakArray {
    ptr: NonNull<u8>,
}

impl GcWeakArray {
    /// Wrap a client pointer
    ///
    /// # Safety
    ///
    /// `ptr` must be the client pointer of a weak array allocation.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Write the hidden words of a fresh weak array
    ///
    /// # Safety
    ///
    /// `ptr` must point to a zeroed weak array payload.
    #[inline]
    pub(crate) unsafe fn init(ptr: *mut u8, count: usize) {
        let words = ptr as *mut usize;
        *words = tag(count);
        *words.add(1) = tag(0);
    }

    /// Number of elements in the weak array at `ptr`
    ///
    /// # Safety
    ///
    /// `ptr` must be the client pointer of a weak array.
    #[inline]
    pub(crate) unsafe fn raw_count(ptr: *const u8) -> usize {
        untag(*(ptr as *const usize))
    }

    /// Clear `slot` and count it as splatted
    ///
    /// # Safety
    ///
    /// `ptr` must be the client pointer of a weak array and `slot` one of its slots.
    #[inline]
    pub(crate) unsafe fn splat(ptr: *mut u8, slot: *mut usize) {
        let counter = (ptr as *mut usize).add(1);
        *counter = tag(untag(*counter) + 1);
        (*(slot as *const AtomicUsize)).store(0, Ordering::Release);
    }

    /// Client pointer
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicUsize {
        assert!(index < self.count(), "index {index} out of bounds");
        // SAFETY: bounds checked above; slots are word aligned
        unsafe { &*(self.ptr.as_ptr().add(ARRAY_HEADER_SIZE + index * WORD) as *const AtomicUsize) }
    }

    /// Number of slots
    #[inline]
    pub fn count(&self) -> usize {
        // SAFETY: guaranteed by `from_raw`
        unsafe { Self::raw_count(self.ptr.as_ptr()) }
    }

    /// Number of slots cleared because their referent died
    #[inline]
    pub fn splatted(&self) -> usize {
        // SAFETY: guaranteed by `from_raw`
        unsafe { untag(*(self.ptr.as_ptr() as *const usize).add(1)) }
    }

    /// Read a slot. Null once the referent has been collected.
    #[inline]
    pub fn get(&self, index: usize) -> usize {
        self.slot(index).load(Ordering::Acquire)
    }

    /// Store a reference in a slot
    #[inline]
    pub fn set(&self, index: usize, value: usize) {
        self.slot(index).store(value, Ordering::Release)
    }
}
