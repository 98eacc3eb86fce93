//! Page-granular memory chunks
//!
//! Blocks are carved from chunks mapped straight from the operating system.
//! Code chunks may be mapped executable. On platforms without `mmap` the
//! global allocator stands in, without execute permission.

use crate::{GcError, GcResult};
use once_cell::sync::Lazy;
use std::ptr::NonNull;

/// System page size
pub static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size);

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

/// Round `size` up to a whole number of pages
#[inline]
pub fn page_round(size: usize) -> usize {
    let page = *PAGE_SIZE;
    (size + page - 1) & !(page - 1)
}

/// Access rights of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    /// Data pages
    ReadWrite,
    /// Code pages
    ReadWriteExecute,
}

/// A mapped, page-aligned region
#[derive(Debug)]
pub struct Chunk {
    ptr: NonNull<u8>,
    size: usize,
    protection: Protection,
}

// SAFETY: a chunk is exclusively owned memory; access is coordinated by the
// heap state that owns it.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    /// Map a zeroed chunk of at least `size` bytes
    pub fn map(size: usize, protection: Protection) -> GcResult<Self> {
        let size = page_round(size.max(1));
        let ptr = map_pages(size, protection)?;
        tracing::trace!(size, ?protection, addr = ?ptr, "mapped chunk");
        Ok(Self { ptr, size, protection })
    }

    /// First byte
    #[inline]
    pub fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last byte
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Mapped size
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Access rights
    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Zero the whole chunk
    pub fn clear(&mut self) {
        // SAFETY: the chunk owns `size` writable bytes
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.size) };
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`size` came from `map_pages`
        unsafe { unmap_pages(self.ptr, self.size) };
    }
}

#[cfg(unix)]
fn map_pages(size: usize, protection: Protection) -> GcResult<NonNull<u8>> {
    let prot = match protection {
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    };
    // SAFETY: anonymous private mapping with no address hint
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(GcError::ReservationFailed {
            size,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| GcError::ReservationFailed {
        size,
        reason: "mmap returned null".to_string(),
    })
}

#[cfg(unix)]
unsafe fn unmap_pages(ptr: NonNull<u8>, size: usize) {
    libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
}

#[cfg(not(unix))]
fn map_pages(size: usize, _protection: Protection) -> GcResult<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(size, *PAGE_SIZE).map_err(|e| {
        GcError::ReservationFailed { size, reason: e.to_string() }
    })?;
    // SAFETY: layout has non-zero size
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or_else(|| GcError::ReservationFailed {
        size,
        reason: "allocator returned null".to_string(),
    })
}

#[cfg(not(unix))]
unsafe fn unmap_pages(ptr: NonNull<u8>, size: usize) {
    let layout = std::alloc::Layout::from_size_align_unchecked(size, *PAGE_SIZE);
    std::alloc::dealloc(ptr.as_ptr(), layout);
}
