//! Object formats
//!
//! The collector never looks inside an allocation. It drives the five
//! operations of [`ObjectFormat`] and hands reference slots to a [`Fixer`]:
//!
//! - **size**: total bytes of the allocation or marker at a base address
//! - **skip**: base address of the next allocation
//! - **scan**: enumerate reference slots and fix them
//! - **forward**: replace a moved allocation with a forwarding marker
//! - **pad**: replace an unusable gap with a padding marker
//!
//! [`DataFormat`] understands typed objects; the code pool uses
//! [`CodeFormat`](super::code::CodeFormat). Both understand markers.

use super::array::GcWeakArray;
use super::header::{self, Header};
use crate::defaults::{
    align_up, ALIGNMENT, ARRAY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, VTABLE_ALLOC_OFFSET, WORD,
};
use crate::types::{TypeDescriptor, TypeKind};
use crate::{GcError, GcResult};

/// Smallest allocation the heap hands out. It must be able to hold a
/// one-word forwarding marker.
pub const MIN_ALLOCATION: usize = align_up(HEADER_SIZE + WORD + FOOTER_SIZE);

/// Total size of a fixed object of `stride` bytes
#[inline]
pub const fn fixed_size(stride: usize) -> usize {
    let payload = if stride < WORD { WORD } else { stride };
    align_up(HEADER_SIZE + payload + FOOTER_SIZE)
}

/// Total size of an array of `count` elements of `stride` bytes
#[inline]
pub fn array_size(stride: usize, count: usize) -> Option<usize> {
    let elements = stride.checked_mul(count)?;
    let raw = (HEADER_SIZE + ARRAY_HEADER_SIZE + FOOTER_SIZE).checked_add(elements)?;
    let padded = raw.checked_add(ALIGNMENT - 1)?;
    Some(padded & !(ALIGNMENT - 1))
}

/// Receives reference slots during a scan
///
/// `fix` may move the referent and rewrite the slot. `fix_weak` is only
/// called for weak array slots; returning `true` means the referent died
/// and the slot must be cleared. `fix_descriptor` reports descriptor
/// references so descriptor reclamation can tell which are in use.
pub trait Fixer {
    /// Fix an ordinary reference held in `slot`
    fn fix(&mut self, slot: &mut usize);

    /// Resolve a weak reference. Returns `true` if the slot must be splatted.
    fn fix_weak(&mut self, _slot: &mut usize) -> bool {
        false
    }

    /// Note a reference to a descriptor
    fn fix_descriptor(&mut self, _descriptor: *const TypeDescriptor) {}
}

/// Memory format used by a pool
pub trait ObjectFormat: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &'static str;

    /// Total size of the allocation or marker at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the start of an allocation or marker of this format.
    unsafe fn size(&self, base: *const u8) -> usize;

    /// Start of the allocation following the one at `base`
    ///
    /// # Safety
    ///
    /// As for [`ObjectFormat::size`].
    #[inline]
    unsafe fn skip(&self, base: *const u8) -> *const u8 {
        base.add(self.size(base))
    }

    /// Hand every reference of the allocation at `base` to `fixer`
    ///
    /// # Safety
    ///
    /// As for [`ObjectFormat::size`]; the allocation must be writable.
    unsafe fn scan(&self, base: *mut u8, fixer: &mut dyn Fixer);

    /// Replace the allocation at `base` with a forwarder to `to`
    ///
    /// # Safety
    ///
    /// `base` must be an allocation of this format that has been copied to `to`.
    #[inline]
    unsafe fn forward(&self, base: *mut u8, to: *mut u8) {
        let size = self.size(base);
        header::write_forward(base, to as usize, size);
    }

    /// New location of the allocation at `base`, if it has been moved
    ///
    /// # Safety
    ///
    /// As for [`ObjectFormat::size`].
    #[inline]
    unsafe fn is_forwarded(&self, base: *const u8) -> Option<*mut u8> {
        Header::read(base).forwarded_to().map(|to| to as *mut u8)
    }

    /// Fill `size` bytes at `base` with a padding marker
    ///
    /// # Safety
    ///
    /// The range must be writable, aligned, and at least [`HEADER_SIZE`] long.
    #[inline]
    unsafe fn pad(&self, base: *mut u8, size: usize) {
        header::write_pad(base, size);
    }
}

/// Size of a marker, or `None` for allocations
#[inline]
pub(crate) fn marker_size(header: Header) -> Option<usize> {
    match header {
        Header::Pad0 => Some(HEADER_SIZE),
        Header::Pad { size } | Header::Forward { size, .. } => Some(size),
        Header::Forward1 { .. } => Some(HEADER_SIZE + WORD),
        Header::Object { .. } | Header::Code { .. } => None,
    }
}

/// Total size of a typed object whose client payload starts at `client`
///
/// # Safety
///
/// `client` must be the payload of an object described by `descriptor`.
#[inline]
pub unsafe fn object_size(descriptor: &TypeDescriptor, client: *const u8) -> usize {
    match descriptor.kind() {
        TypeKind::Fixed | TypeKind::FixedWithVTable | TypeKind::TypeDescriptorItself => {
            fixed_size(descriptor.stride())
        }
        TypeKind::Array => {
            let count = *(client as *const usize);
            align_up(HEADER_SIZE + ARRAY_HEADER_SIZE + descriptor.stride() * count + FOOTER_SIZE)
        }
        TypeKind::WeakArray => {
            let count = GcWeakArray::raw_count(client);
            align_up(HEADER_SIZE + ARRAY_HEADER_SIZE + WORD * count + FOOTER_SIZE)
        }
    }
}

#[inline]
unsafe fn fix_slot(fixer: &mut dyn Fixer, at: *mut u8) {
    let slot = at as *mut usize;
    let mut value = *slot;
    if value == 0 {
        return;
    }
    fixer.fix(&mut value);
    *slot = value;
}

/// Fix the interior dispatch-table pointer at offset 0. The stored pointer
/// is [`VTABLE_ALLOC_OFFSET`] bytes into its allocation.
#[inline]
unsafe fn fix_vtable(fixer: &mut dyn Fixer, client: *mut u8) {
    let slot = client as *mut usize;
    let value = *slot;
    if value == 0 {
        return;
    }
    let mut alloc = value.wrapping_sub(VTABLE_ALLOC_OFFSET);
    fixer.fix(&mut alloc);
    *slot = alloc.wrapping_add(VTABLE_ALLOC_OFFSET);
}

/// Scan a typed object
///
/// # Safety
///
/// `client` must be the payload of an object described by `descriptor`.
pub unsafe fn scan_object(descriptor: &TypeDescriptor, client: *mut u8, fixer: &mut dyn Fixer) {
    fixer.fix_descriptor(descriptor);
    let offsets = descriptor.offsets();
    match descriptor.kind() {
        TypeKind::Fixed => {
            for &offset in offsets {
                fix_slot(fixer, client.add(offset));
            }
        }
        TypeKind::FixedWithVTable => {
            fix_vtable(fixer, client);
            for &offset in offsets {
                fix_slot(fixer, client.add(offset));
            }
        }
        TypeKind::TypeDescriptorItself => {
            fix_vtable(fixer, client);
            let described = *(client.add(offsets[0]) as *const *const TypeDescriptor);
            if !described.is_null() {
                fixer.fix_descriptor(described);
            }
            for &offset in &offsets[1..] {
                fix_slot(fixer, client.add(offset));
            }
        }
        TypeKind::Array => {
            let count = *(client as *const usize);
            let stride = descriptor.stride();
            let mut element = client.add(ARRAY_HEADER_SIZE);
            for _ in 0..count {
                for &offset in offsets {
                    fix_slot(fixer, element.add(offset));
                }
                element = element.add(stride);
            }
        }
        TypeKind::WeakArray => {
            let count = GcWeakArray::raw_count(client);
            for index in 0..count {
                let slot = client.add(ARRAY_HEADER_SIZE + index * WORD) as *mut usize;
                let mut value = *slot;
                if value == 0 {
                    continue;
                }
                if fixer.fix_weak(&mut value) {
                    GcWeakArray::splat(client, slot);
                } else {
                    *slot = value;
                }
            }
        }
    }
}

/// Format of typed data objects
#[derive(Debug, Default, Clone, Copy)]
pub struct DataFormat;

impl ObjectFormat for DataFormat {
    fn name(&self) -> &'static str {
        "data"
    }

    unsafe fn size(&self, base: *const u8) -> usize {
        let header = Header::read(base);
        if let Some(size) = marker_size(header) {
            return size;
        }
        match header {
            Header::Object { descriptor, .. } => object_size(&*descriptor, base.add(HEADER_SIZE)),
            _ => panic!("code block at {:p} in a data pool", base),
        }
    }

    unsafe fn scan(&self, base: *mut u8, fixer: &mut dyn Fixer) {
        match Header::read(base) {
            Header::Object { descriptor, .. } => {
                scan_object(&*descriptor, base.add(HEADER_SIZE), fixer)
            }
            Header::Code { .. } => panic!("code block at {:p} in a data pool", base),
            _ => {}
        }
    }
}

/// Walk `[start, end)` with `skip`, calling `visit` on every allocation
/// and marker. Fails if the walk does not land exactly on `end`.
///
/// # Safety
///
/// The range must hold a contiguous sequence of allocations and markers of
/// `format`.
pub unsafe fn walk(
    format: &dyn ObjectFormat,
    start: usize,
    end: usize,
    mut visit: impl FnMut(*mut u8, Header),
) -> GcResult<usize> {
    let mut at = start;
    let mut count = 0;
    while at < end {
        let base = at as *mut u8;
        let header = Header::read(base);
        let size = format.size(base);
        if size == 0 || size % ALIGNMENT != 0 {
            return Err(GcError::HeapCorrupted(format!(
                "{} allocation at {at:#x} reports size {size}",
                format.name()
            )));
        }
        visit(base, header);
        at += size;
        count += 1;
    }
    if at != end {
        return Err(GcError::HeapCorrupted(format!(
            "{} walk overshot: ended at {at:#x}, expected {end:#x}",
            format.name()
        )));
    }
    Ok(count)
}
