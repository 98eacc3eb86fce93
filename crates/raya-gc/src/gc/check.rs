//! Heap consistency checking
//!
//! [`verify_blocks`] walks every block and fails on the first structural
//! error. With the `check-memory` feature every allocation also carries a
//! canary word in its header, its total size, a monotonically increasing
//! id and a canary footer; the walk checks all four.

use super::block::BlockTable;
use super::format::walk;
use crate::GcResult;

#[cfg(feature = "check-memory")]
use super::header::ObjHeader;
#[cfg(feature = "check-memory")]
use crate::defaults::{CANARY_FOOTER, CANARY_HEADER, FOOTER_SIZE, WORD};
#[cfg(feature = "check-memory")]
use crate::GcError;

#[cfg(feature = "check-memory")]
const HEADER_CANARY_WORD: usize = usize::from_ne_bytes([CANARY_HEADER; WORD]);
#[cfg(feature = "check-memory")]
const FOOTER_CANARY_WORD: usize = usize::from_ne_bytes([CANARY_FOOTER; WORD]);

/// Fill in the checking words of a fresh allocation
///
/// # Safety
///
/// `base` must be a writable allocation of `size` bytes.
#[cfg(feature = "check-memory")]
#[inline]
pub unsafe fn stamp(base: *mut u8, size: usize, alloc_id: usize) {
    let header = base as *mut ObjHeader;
    (*header).total = size;
    (*header).alloc_id = alloc_id;
    (*header).canary = HEADER_CANARY_WORD;
    *(base.add(size - FOOTER_SIZE) as *mut usize) = FOOTER_CANARY_WORD;
}

/// Fill in the checking words of a fresh allocation
///
/// # Safety
///
/// Nothing is written without the `check-memory` feature.
#[cfg(not(feature = "check-memory"))]
#[inline(always)]
pub unsafe fn stamp(_base: *mut u8, _size: usize, _alloc_id: usize) {}

#[cfg(feature = "check-memory")]
unsafe fn check_allocation(base: *mut u8, size: usize, last_id: &mut usize) -> GcResult<()> {
    let header = &*(base as *const ObjHeader);
    if header.canary != HEADER_CANARY_WORD {
        return Err(GcError::HeapCorrupted(format!(
            "header canary of {base:p} overwritten: {:#x}",
            header.canary
        )));
    }
    if header.total != size {
        return Err(GcError::HeapCorrupted(format!(
            "allocation at {base:p} recorded {} bytes, format reports {size}",
            header.total
        )));
    }
    let footer = *(base.add(size - FOOTER_SIZE) as *const usize);
    if footer != FOOTER_CANARY_WORD {
        return Err(GcError::HeapCorrupted(format!(
            "footer canary of {base:p} overwritten: {footer:#x}"
        )));
    }
    if header.alloc_id == 0 {
        return Err(GcError::HeapCorrupted(format!("allocation at {base:p} has no id")));
    }
    *last_id = (*last_id).max(header.alloc_id);
    Ok(())
}

/// Walk every block. Returns the number of allocations and markers seen.
///
/// # Safety
///
/// No allocation point may be filling a block during the walk.
pub unsafe fn verify_blocks(blocks: &BlockTable) -> GcResult<usize> {
    let mut seen = 0;
    #[cfg(feature = "check-memory")]
    let mut last_id = 0usize;

    for id in blocks.ids() {
        let Some(block) = blocks.get(id) else {
            continue;
        };
        let format = block.pool.format();

        #[cfg(feature = "check-memory")]
        {
            let mut failure = None;
            seen += walk(format, block.start(), block.limit(), |base, header| {
                if failure.is_none() && header.is_allocation() {
                    let size = format.size(base);
                    if let Err(e) = check_allocation(base, size, &mut last_id) {
                        failure = Some(e);
                    }
                }
            })?;
            if let Some(e) = failure {
                return Err(e);
            }
        }

        #[cfg(not(feature = "check-memory"))]
        {
            seen += walk(format, block.start(), block.limit(), |_, _| {})?;
        }
    }

    #[cfg(feature = "check-memory")]
    tracing::trace!(seen, last_id, "heap verified");
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::alloc_point::AllocPoint;
    use crate::gc::block::{Generation, PoolKind};
    use crate::gc::format::fixed_size;
    use crate::gc::header;
    use crate::types::{TypeDescriptor, TypeKind};

    #[test]
    fn test_verify_filled_block() {
        let descriptor = TypeDescriptor::new(TypeKind::Fixed, std::ptr::null(), 24, vec![], None).unwrap();
        let mut table = BlockTable::new(64 * 1024, 1 << 24, false);
        let mut ap = AllocPoint::new(PoolKind::Data, Generation::Young);
        let size = fixed_size(24);
        for id in 1..=10 {
            let base = ap.reserve(&mut table, size).unwrap();
            unsafe {
                header::write_object(base as *mut u8, &descriptor);
                stamp(base as *mut u8, size, id);
            }
            ap.commit(base, size);
        }
        ap.retire(&mut table);

        // Ten objects plus the padding of the retired tail
        assert_eq!(unsafe { verify_blocks(&table) }.unwrap(), 11);
    }

    #[cfg(feature = "check-memory")]
    #[test]
    fn test_footer_overwrite_is_detected() {
        let descriptor = TypeDescriptor::new(TypeKind::Fixed, std::ptr::null(), 8, vec![], None).unwrap();
        let mut table = BlockTable::new(64 * 1024, 1 << 24, false);
        let mut ap = AllocPoint::new(PoolKind::Data, Generation::Young);
        let size = fixed_size(8);
        let base = ap.reserve(&mut table, size).unwrap();
        unsafe {
            header::write_object(base as *mut u8, &descriptor);
            stamp(base as *mut u8, size, 1);
            *((base + size - FOOTER_SIZE) as *mut u8) = 0;
        }
        ap.commit(base, size);
        ap.retire(&mut table);

        assert!(matches!(unsafe { verify_blocks(&table) }, Err(GcError::HeapCorrupted(_))));
    }
}
