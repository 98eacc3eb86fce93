//! Object header and marker encoding
//!
//! Every allocation starts with a hidden header; the client pointer handed
//! to the runtime points just past it. The first header word (`info`) is a
//! tagged union:
//!
//! ```text
//! info (low 3 bits select the variant)
//! ┌──────────────────────────────────────────────┬─────┐
//! │ *const TypeDescriptor                        │ 0F0 │  object, F = finalized
//! │ code byte size                               │ 001 │  code block
//! │ marker kind (Pad0 / Pad / Forward1 / Forward)│ 100 │  marker
//! └──────────────────────────────────────────────┴─────┘
//! ```
//!
//! Markers keep their payload in the words following the header:
//!
//! ```text
//! Pad0      [info]                         gap of exactly one header
//! Pad       [info][total size]             gap of any larger size
//! Forward1  [info][new base]               object of header + one word
//! Forward   [info][new base][total size]   any larger object
//! ```
//!
//! The raw word is only touched in this module. Everything else goes
//! through [`Header`] and the `write_*` functions.

use crate::defaults::{HEADER_SIZE, WORD};
use crate::types::TypeDescriptor;

const TAG_MASK: usize = 0b111;
const TAG_CODE: usize = 0b001;
const TAG_MARKER: usize = 0b100;
const FINALIZED: usize = 0b010;

const MARKER_PAD0: usize = 0;
const MARKER_PAD: usize = 1;
const MARKER_FORWARD1: usize = 2;
const MARKER_FORWARD: usize = 3;

/// Raw header layout
///
/// ```text
/// ┌─────────────────────────────────────────┐
/// │ ObjHeader (8-byte aligned)              │
/// │  - info: usize (tagged union)           │
/// │  - total: usize       (check-memory)    │
/// │  - alloc_id: usize    (check-memory)    │
/// │  - canary: usize      (check-memory)    │
/// ├─────────────────────────────────────────┤
/// │ Client payload                          │
/// └─────────────────────────────────────────┘
/// ```
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub struct ObjHeader {
    /// Tagged union word
    pub info: usize,

    /// Total allocation size, written at allocation time
    #[cfg(feature = "check-memory")]
    pub total: usize,

    /// Monotonic allocation id
    #[cfg(feature = "check-memory")]
    pub alloc_id: usize,

    /// Canary word
    #[cfg(feature = "check-memory")]
    pub canary: usize,
}

/// Decoded header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Live (or dead but not yet reclaimed) data object
    Object {
        /// Descriptor of the object
        descriptor: *const TypeDescriptor,
        /// Whether the finalizer has already run
        finalized: bool,
    },
    /// Code block holding `size` bytes of machine code
    Code {
        /// Byte size of the code, excluding the reference table
        size: usize,
    },
    /// Gap of exactly [`HEADER_SIZE`] bytes
    Pad0,
    /// Gap of `size` bytes
    Pad {
        /// Total size of the gap
        size: usize,
    },
    /// Moved object of [`HEADER_SIZE`] + one word
    Forward1 {
        /// Base address of the new copy
        to: usize,
    },
    /// Moved object of `size` bytes
    Forward {
        /// Base address of the new copy
        to: usize,
        /// Total size of the old allocation
        size: usize,
    },
}

impl Header {
    /// Decode the header at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the start of an allocation or marker.
    #[inline]
    pub unsafe fn read(base: *const u8) -> Header {
        let info = *(base as *const usize);
        let payload = base.add(HEADER_SIZE) as *const usize;
        match info & TAG_MASK {
            TAG_CODE => Header::Code { size: info >> 3 },
            TAG_MARKER => match info >> 3 {
                MARKER_PAD0 => Header::Pad0,
                MARKER_PAD => Header::Pad { size: *payload },
                MARKER_FORWARD1 => Header::Forward1 { to: *payload },
                MARKER_FORWARD => Header::Forward {
                    to: *payload,
                    size: *payload.add(1),
                },
                other => panic!("corrupt marker kind {other} at {:p}", base),
            },
            tag if tag & !FINALIZED == 0 => Header::Object {
                descriptor: (info & !TAG_MASK) as *const TypeDescriptor,
                finalized: tag & FINALIZED != 0,
            },
            _ => panic!("corrupt header word {info:#x} at {:p}", base),
        }
    }

    /// Whether this header denotes an allocation rather than a marker
    #[inline]
    pub fn is_allocation(&self) -> bool {
        matches!(self, Header::Object { .. } | Header::Code { .. })
    }

    /// Forwarding target, if this is a forwarding marker
    #[inline]
    pub fn forwarded_to(&self) -> Option<usize> {
        match *self {
            Header::Forward1 { to } | Header::Forward { to, .. } => Some(to),
            _ => None,
        }
    }
}

#[inline]
unsafe fn set_info(base: *mut u8, info: usize) {
    *(base as *mut usize) = info;
}

/// Write an object header
///
/// # Safety
///
/// `base` must point to at least [`HEADER_SIZE`] writable bytes.
#[inline]
pub unsafe fn write_object(base: *mut u8, descriptor: *const TypeDescriptor) {
    debug_assert_eq!(descriptor as usize & TAG_MASK, 0, "misaligned descriptor");
    set_info(base, descriptor as usize);
}

/// Replace the descriptor of an object, keeping its finalized flag
///
/// # Safety
///
/// `base` must hold an object header.
#[inline]
pub unsafe fn replace_descriptor(base: *mut u8, descriptor: *const TypeDescriptor) {
    let info = *(base as *const usize);
    set_info(base, descriptor as usize | (info & FINALIZED));
}

/// Flag an object as finalized
///
/// # Safety
///
/// `base` must hold an object header.
#[inline]
pub unsafe fn set_finalized(base: *mut u8) {
    let info = *(base as *const usize);
    debug_assert_eq!(info & (TAG_CODE | TAG_MARKER), 0);
    set_info(base, info | FINALIZED);
}

/// Write a code header
///
/// # Safety
///
/// `base` must point to at least [`HEADER_SIZE`] writable bytes.
#[inline]
pub unsafe fn write_code(base: *mut u8, size: usize) {
    set_info(base, (size << 3) | TAG_CODE);
}

/// Turn `size` bytes at `base` into padding
///
/// # Safety
///
/// The range must be writable and `size` must be a multiple of the
/// allocation alignment, at least [`HEADER_SIZE`].
#[inline]
pub unsafe fn write_pad(base: *mut u8, size: usize) {
    debug_assert!(size >= HEADER_SIZE);
    if size == HEADER_SIZE {
        set_info(base, (MARKER_PAD0 << 3) | TAG_MARKER);
    } else {
        set_info(base, (MARKER_PAD << 3) | TAG_MARKER);
        *(base.add(HEADER_SIZE) as *mut usize) = size;
    }
}

/// Turn the `size`-byte allocation at `base` into a forwarder to `to`
///
/// # Safety
///
/// `base` must be an allocation of `size` bytes, at least the minimum
/// allocation size.
#[inline]
pub unsafe fn write_forward(base: *mut u8, to: usize, size: usize) {
    let payload = base.add(HEADER_SIZE) as *mut usize;
    if size <= HEADER_SIZE + WORD {
        set_info(base, (MARKER_FORWARD1 << 3) | TAG_MARKER);
        *payload = to;
    } else {
        set_info(base, (MARKER_FORWARD << 3) | TAG_MARKER);
        *payload = to;
        *payload.add(1) = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::WORD;

    #[repr(align(8))]
    struct Buf([u8; 64]);

    #[test]
    fn test_header_size_matches_layout() {
        assert_eq!(std::mem::size_of::<ObjHeader>(), HEADER_SIZE);
        assert_eq!(std::mem::align_of::<ObjHeader>(), 8);
    }

    #[test]
    fn test_object_and_finalized_flag() {
        let mut buf = Buf([0; 64]);
        let base = buf.0.as_mut_ptr();
        let fake = 0x1000 as *const TypeDescriptor;
        unsafe {
            write_object(base, fake);
            assert_eq!(
                Header::read(base),
                Header::Object { descriptor: fake, finalized: false }
            );
            set_finalized(base);
            assert_eq!(
                Header::read(base),
                Header::Object { descriptor: fake, finalized: true }
            );
            let other = 0x2000 as *const TypeDescriptor;
            replace_descriptor(base, other);
            assert_eq!(
                Header::read(base),
                Header::Object { descriptor: other, finalized: true }
            );
        }
    }

    #[test]
    fn test_code_header() {
        let mut buf = Buf([0; 64]);
        let base = buf.0.as_mut_ptr();
        unsafe {
            write_code(base, 13);
            assert_eq!(Header::read(base), Header::Code { size: 13 });
            assert!(Header::read(base).is_allocation());
        }
    }

    #[test]
    fn test_pad_variants() {
        let mut buf = Buf([0; 64]);
        let base = buf.0.as_mut_ptr();
        unsafe {
            write_pad(base, HEADER_SIZE);
            assert_eq!(Header::read(base), Header::Pad0);
            write_pad(base, HEADER_SIZE + 3 * WORD);
            assert_eq!(Header::read(base), Header::Pad { size: HEADER_SIZE + 3 * WORD });
            assert!(!Header::read(base).is_allocation());
        }
    }

    #[test]
    fn test_forward_variants() {
        let mut buf = Buf([0; 64]);
        let base = buf.0.as_mut_ptr();
        unsafe {
            write_forward(base, 0xdead0, HEADER_SIZE + WORD);
            assert_eq!(Header::read(base), Header::Forward1 { to: 0xdead0 });
            write_forward(base, 0xbeef0, HEADER_SIZE + 4 * WORD);
            let header = Header::read(base);
            assert_eq!(header, Header::Forward { to: 0xbeef0, size: HEADER_SIZE + 4 * WORD });
            assert_eq!(header.forwarded_to(), Some(0xbeef0));
        }
    }
}
