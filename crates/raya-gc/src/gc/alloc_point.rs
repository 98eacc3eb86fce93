//! Allocation points
//!
//! An allocation point is a bump cursor over one block of a pool. Each
//! attached thread owns one for the data pool; the static, weak and code
//! pools share one each behind a mutex. The collector uses the same type
//! for its to-space copy cursors.
//!
//! Allocation is two-step. [`AllocPoint::reserve`] hands out memory past the
//! committed boundary; [`AllocPoint::commit`] makes it part of the walkable
//! block once its header is written. A block is only walked up to the
//! committed boundary, so a half-initialized object is never observed.

use super::block::{BlockId, BlockTable, Generation, PoolKind};
use super::format::ObjectFormat;
use crate::defaults::HEADER_SIZE;
use crate::{GcError, GcResult};

fn lost_block(id: BlockId) -> GcError {
    GcError::HeapCorrupted(format!("block {id} vanished right after acquisition"))
}

/// Bump allocator over one block at a time
#[derive(Debug)]
pub struct AllocPoint {
    /// Pool served by this point
    pool: PoolKind,

    /// Generation of blocks acquired for this point
    generation: Generation,

    /// Current block
    block: Option<BlockId>,

    /// Next free byte
    cursor: usize,

    /// End of the committed region
    committed: usize,

    /// End of the current block
    limit: usize,

    /// Number of allocations committed through this point
    allocations: usize,
}

impl AllocPoint {
    /// Create an empty allocation point
    pub fn new(pool: PoolKind, generation: Generation) -> Self {
        Self {
            pool,
            generation,
            block: None,
            cursor: 0,
            committed: 0,
            limit: 0,
            allocations: 0,
        }
    }

    /// Pool served by this point
    #[inline]
    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    /// Block currently being filled
    #[inline]
    pub fn block(&self) -> Option<BlockId> {
        self.block
    }

    /// Number of committed allocations
    #[inline]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Bump within the current block without touching the block table.
    /// Returns `None` if the block is full or there is none.
    #[inline]
    pub fn try_reserve(&mut self, size: usize) -> Option<usize> {
        if self.block.is_none() || self.limit - self.cursor < size {
            return None;
        }
        let base = self.cursor;
        self.cursor += size;
        Some(base)
    }

    /// Reserve `size` bytes, acquiring a new block if the current one is full.
    /// Returns the base address of the zeroed reservation.
    pub fn reserve(&mut self, table: &mut BlockTable, size: usize) -> GcResult<usize> {
        if let Some(base) = self.try_reserve(size) {
            return Ok(base);
        }

        if size > table.block_size() {
            // Large objects get a block of their own and leave the current one alone
            let id = table.acquire(self.pool, self.generation, size)?;
            let block = table.get_mut(id).ok_or_else(|| lost_block(id))?;
            block.used = size;
            let base = block.start();
            let end = block.start() + block.size();
            if end - (base + size) >= HEADER_SIZE {
                // SAFETY: the tail lies inside the freshly mapped block
                unsafe { self.pool.format().pad((base + size) as *mut u8, end - (base + size)) };
                block.used = block.size();
            }
            self.allocations += 1;
            return Ok(base);
        }

        self.retire(table);
        let id = table.acquire(self.pool, self.generation, size)?;
        let block = table.get(id).ok_or_else(|| lost_block(id))?;
        self.block = Some(id);
        self.cursor = block.start();
        self.committed = block.start();
        self.limit = block.start() + block.size();
        self.try_reserve(size)
            .ok_or_else(|| GcError::HeapCorrupted(format!("fresh block cannot hold {size} bytes")))
    }

    /// Commit the reservation at `base`
    ///
    /// Large-object reservations are committed by [`AllocPoint::reserve`]
    /// itself and must not be passed here.
    #[inline]
    pub fn commit(&mut self, base: usize, size: usize) {
        if base == self.committed && self.block.is_some() {
            self.committed = base + size;
            self.allocations += 1;
        }
    }

    /// Hand the current block back to its pool, padding the unused tail so
    /// the whole block stays walkable
    pub fn retire(&mut self, table: &mut BlockTable) {
        let Some(id) = self.block.take() else {
            return;
        };
        let format: &dyn ObjectFormat = self.pool.format();
        if let Some(block) = table.get_mut(id) {
            let gap = self.limit - self.committed;
            if gap >= HEADER_SIZE {
                // SAFETY: the gap lies inside the block and was never handed out
                unsafe { format.pad(self.committed as *mut u8, gap) };
                block.used = block.size();
            } else {
                block.used = self.committed - block.start();
            }
        }
        self.cursor = 0;
        self.committed = 0;
        self.limit = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::WORD;
    use crate::gc::format::{fixed_size, walk, DataFormat};
    use crate::gc::header;
    use crate::types::{TypeDescriptor, TypeKind};
    use std::ptr;

    fn table() -> BlockTable {
        BlockTable::new(64 * 1024, 16 * 1024 * 1024, false)
    }

    #[test]
    fn test_bump_is_contiguous() {
        let mut table = table();
        let mut ap = AllocPoint::new(PoolKind::Data, Generation::Young);
        let size = fixed_size(2 * WORD);
        let a = ap.reserve(&mut table, size).unwrap();
        ap.commit(a, size);
        let b = ap.reserve(&mut table, size).unwrap();
        ap.commit(b, size);
        assert_eq!(b, a + size);
        assert_eq!(ap.allocations(), 2);
    }

    #[test]
    fn test_retired_block_walks_to_end() {
        let desc = TypeDescriptor::new(TypeKind::Fixed, ptr::null(), 3 * WORD, vec![], None).unwrap();
        let mut table = table();
        let mut ap = AllocPoint::new(PoolKind::Data, Generation::Young);
        let size = fixed_size(3 * WORD);
        for _ in 0..10 {
            let base = ap.reserve(&mut table, size).unwrap();
            unsafe { header::write_object(base as *mut u8, &desc) };
            ap.commit(base, size);
        }
        let id = ap.block().unwrap();
        ap.retire(&mut table);

        let block = table.get(id).unwrap();
        assert_eq!(block.used, block.size());
        let count = unsafe { walk(&DataFormat, block.start(), block.limit(), |_, _| {}) }.unwrap();
        // Ten objects and one padding marker for the tail
        assert_eq!(count, 11);
    }

    #[test]
    fn test_full_block_moves_on() {
        let mut table = BlockTable::new(64 * 1024, 16 * 1024 * 1024, false);
        let mut ap = AllocPoint::new(PoolKind::Data, Generation::Young);
        let size = table.block_size() / 2;
        let first = ap.reserve(&mut table, size).unwrap();
        ap.commit(first, size);
        let second = ap.reserve(&mut table, size).unwrap();
        ap.commit(second, size);
        let first_block = ap.block();
        let third = ap.reserve(&mut table, size).unwrap();
        ap.commit(third, size);
        assert_ne!(ap.block(), first_block);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_large_object_gets_own_block() {
        let mut table = table();
        let mut ap = AllocPoint::new(PoolKind::Data, Generation::Young);
        let small = ap.reserve(&mut table, 64).unwrap();
        ap.commit(small, 64);
        let current = ap.block();
        let big = ap.reserve(&mut table, 200 * 1024).unwrap();
        assert_eq!(ap.block(), current);
        let id = table.find(big).unwrap();
        assert_eq!(table.get(id).unwrap().start(), big);
        assert_eq!(table.len(), 2);
    }
}
