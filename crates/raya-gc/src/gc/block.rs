//! Blocks and pools
//!
//! Every pool owns a set of blocks, each backed by one [`Chunk`]. Blocks are
//! filled front to back by allocation points; `used` marks how far the block
//! holds a walkable sequence of allocations and markers.
//!
//! ```text
//! Block
//! ┌───────────────────────────────┬──────────────────┐
//! │ allocations / markers         │ never handed out │
//! └───────────────────────────────┴──────────────────┘
//! start                           start + used       start + size
//! ```

use super::code::CodeFormat;
use super::format::{DataFormat, ObjectFormat};
use super::memory::{Chunk, Protection};
use crate::{GcError, GcResult};
use std::collections::BTreeMap;

/// Pool an allocation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Ordinary objects and arrays: moving, generational
    Data,
    /// Objects that must not move, including runtime type objects
    Static,
    /// Weak arrays: non-moving
    Weak,
    /// Machine code: moving, separate format
    Code,
}

static DATA_FORMAT: DataFormat = DataFormat;
static CODE_FORMAT: CodeFormat = CodeFormat;

impl PoolKind {
    /// All pools
    pub const ALL: [PoolKind; 4] = [PoolKind::Data, PoolKind::Static, PoolKind::Weak, PoolKind::Code];

    /// Format used to interpret the pool's memory
    #[inline]
    pub fn format(self) -> &'static dyn ObjectFormat {
        match self {
            PoolKind::Code => &CODE_FORMAT,
            _ => &DATA_FORMAT,
        }
    }

    /// Whether the collector relocates survivors
    #[inline]
    pub fn is_moving(self) -> bool {
        matches!(self, PoolKind::Data | PoolKind::Code)
    }
}

/// Generation of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Freshly allocated data, collected by minor collections
    Young,
    /// Survivors and all non-data pools, collected by full collections
    Old,
}

/// Index of a block in the [`BlockTable`]
pub type BlockId = usize;

/// One block of a pool
#[derive(Debug)]
pub struct Block {
    chunk: Chunk,
    /// Owning pool
    pub pool: PoolKind,
    /// Generation
    pub generation: Generation,
    /// Bytes from the start that hold allocations or markers
    pub used: usize,
    /// Part of the current collection's condemned set
    pub condemned: bool,
    /// Holds an object that an ambiguous reference pinned in place
    pub pinned: bool,
}

impl Block {
    /// First byte
    #[inline]
    pub fn start(&self) -> usize {
        self.chunk.start()
    }

    /// Capacity in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.chunk.size()
    }

    /// End of the walkable region
    #[inline]
    pub fn limit(&self) -> usize {
        self.chunk.start() + self.used
    }

    /// Check whether `addr` lies in the walkable region
    #[inline]
    pub fn holds(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.limit()
    }
}

/// Byte totals per pool and generation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockUsage {
    /// Bytes in young data blocks
    pub young: usize,
    /// Bytes in old blocks of every pool
    pub old: usize,
}

/// All blocks of one arena
pub struct BlockTable {
    blocks: Vec<Option<Block>>,
    free_ids: Vec<BlockId>,
    by_addr: BTreeMap<usize, BlockId>,
    spare: Vec<Chunk>,
    block_size: usize,
    limit: usize,
    mapped: usize,
    executable_code: bool,
    usage: BlockUsage,
}

impl BlockTable {
    /// Create an empty table
    pub fn new(block_size: usize, limit: usize, executable_code: bool) -> Self {
        Self {
            blocks: Vec::new(),
            free_ids: Vec::new(),
            by_addr: BTreeMap::new(),
            spare: Vec::new(),
            block_size: super::memory::page_round(block_size),
            limit,
            mapped: 0,
            executable_code,
            usage: BlockUsage::default(),
        }
    }

    /// Standard block size
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes currently mapped, including spare chunks
    #[inline]
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    /// Byte totals per generation
    #[inline]
    pub fn usage(&self) -> BlockUsage {
        self.usage
    }

    fn protection(&self, pool: PoolKind) -> Protection {
        if pool == PoolKind::Code && self.executable_code {
            Protection::ReadWriteExecute
        } else {
            Protection::ReadWrite
        }
    }

    fn account(&mut self, block: &Block, add: bool) {
        let slot = match block.generation {
            Generation::Young => &mut self.usage.young,
            Generation::Old => &mut self.usage.old,
        };
        if add {
            *slot += block.size();
        } else {
            *slot -= block.size();
        }
    }

    fn obtain_chunk(&mut self, size: usize, protection: Protection) -> GcResult<Chunk> {
        if size == self.block_size {
            if let Some(index) = self.spare.iter().position(|c| c.protection() == protection) {
                let mut chunk = self.spare.swap_remove(index);
                chunk.clear();
                return Ok(chunk);
            }
        }
        // Give spare chunks back before declaring the arena exhausted
        while self.mapped + size > self.limit {
            match self.spare.pop() {
                Some(chunk) => self.mapped -= chunk.size(),
                None => {
                    return Err(GcError::OutOfMemory {
                        requested: size,
                        limit: self.limit,
                    })
                }
            }
        }
        let chunk = Chunk::map(size, protection)?;
        self.mapped += chunk.size();
        Ok(chunk)
    }

    /// Add a block of at least `min_size` bytes to `pool`
    pub fn acquire(&mut self, pool: PoolKind, generation: Generation, min_size: usize) -> GcResult<BlockId> {
        let size = if min_size <= self.block_size {
            self.block_size
        } else {
            super::memory::page_round(min_size)
        };
        let chunk = self.obtain_chunk(size, self.protection(pool))?;
        let block = Block {
            chunk,
            pool,
            generation,
            used: 0,
            condemned: false,
            pinned: false,
        };
        self.account(&block, true);
        let start = block.start();
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.blocks[id] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                self.blocks.len() - 1
            }
        };
        self.by_addr.insert(start, id);
        tracing::trace!(id, ?pool, ?generation, size, "acquired block");
        Ok(id)
    }

    /// Return a block's memory. Standard-size chunks are kept for reuse.
    pub fn release(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id).and_then(Option::take) else {
            return;
        };
        self.account(&block, false);
        self.by_addr.remove(&block.start());
        self.free_ids.push(id);
        tracing::trace!(id, pool = ?block.pool, "released block");
        if block.size() == self.block_size {
            self.spare.push(block.chunk);
        } else {
            self.mapped -= block.chunk.size();
        }
    }

    /// Move a block to another generation
    pub fn set_generation(&mut self, id: BlockId, generation: Generation) {
        let Some(block) = self.blocks.get(id).and_then(Option::as_ref) else {
            return;
        };
        if block.generation == generation {
            return;
        }
        let size = block.size();
        match generation {
            Generation::Young => {
                self.usage.old -= size;
                self.usage.young += size;
            }
            Generation::Old => {
                self.usage.young -= size;
                self.usage.old += size;
            }
        }
        if let Some(block) = self.blocks[id].as_mut() {
            block.generation = generation;
        }
    }

    /// Block by id
    #[inline]
    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id).and_then(Option::as_ref)
    }

    /// Mutable block by id
    #[inline]
    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id).and_then(Option::as_mut)
    }

    /// Block whose memory contains `addr`
    pub fn find(&self, addr: usize) -> Option<BlockId> {
        let (_, &id) = self.by_addr.range(..=addr).next_back()?;
        let block = self.get(id)?;
        (addr < block.start() + block.size()).then_some(id)
    }

    /// Ids of all blocks, in address order
    pub fn ids(&self) -> Vec<BlockId> {
        self.by_addr.values().copied().collect()
    }

    /// Ids of the blocks of one pool, in address order
    pub fn ids_of(&self, pool: PoolKind) -> Vec<BlockId> {
        self.by_addr
            .values()
            .copied()
            .filter(|&id| self.get(id).is_some_and(|b| b.pool == pool))
            .collect()
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Check whether the table holds no blocks
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Release every block and spare chunk
    pub fn clear(&mut self) {
        for id in self.ids() {
            self.release(id);
        }
        for chunk in self.spare.drain(..) {
            self.mapped -= chunk.size();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::memory::PAGE_SIZE;

    fn table() -> BlockTable {
        BlockTable::new(64 * 1024, 1024 * 1024, false)
    }

    #[test]
    fn test_acquire_and_find() {
        let mut table = table();
        let a = table.acquire(PoolKind::Data, Generation::Young, 16).unwrap();
        let b = table.acquire(PoolKind::Code, Generation::Old, 16).unwrap();
        let block_a = table.get(a).unwrap();
        let start = block_a.start();
        assert_eq!(table.find(start), Some(a));
        assert_eq!(table.find(start + block_a.size() - 1), Some(a));
        assert_eq!(table.find(start.wrapping_sub(1)).filter(|&id| id == a), None);
        assert_eq!(table.ids_of(PoolKind::Code), vec![b]);
        assert_eq!(table.usage(), BlockUsage { young: 64 * 1024, old: 64 * 1024 });
    }

    #[test]
    fn test_large_blocks_are_page_rounded() {
        let mut table = table();
        let id = table.acquire(PoolKind::Data, Generation::Young, 100 * 1024 + 1).unwrap();
        let size = table.get(id).unwrap().size();
        assert!(size > 100 * 1024);
        assert_eq!(size % *PAGE_SIZE, 0);
    }

    #[test]
    fn test_release_recycles_chunks() {
        let mut table = table();
        let a = table.acquire(PoolKind::Data, Generation::Young, 16).unwrap();
        let mapped = table.mapped();
        table.release(a);
        assert_eq!(table.mapped(), mapped);
        assert!(table.is_empty());
        let b = table.acquire(PoolKind::Data, Generation::Young, 16).unwrap();
        assert_eq!(table.mapped(), mapped);
        assert_eq!(a, b);
    }

    #[test]
    fn test_limit_is_fatal() {
        let mut table = BlockTable::new(64 * 1024, 128 * 1024, false);
        table.acquire(PoolKind::Data, Generation::Young, 16).unwrap();
        table.acquire(PoolKind::Data, Generation::Young, 16).unwrap();
        let err = table.acquire(PoolKind::Data, Generation::Young, 16).unwrap_err();
        assert!(err.is_fatal_allocation());
    }

    #[test]
    fn test_promotion_moves_usage() {
        let mut table = table();
        let id = table.acquire(PoolKind::Data, Generation::Young, 16).unwrap();
        table.set_generation(id, Generation::Old);
        assert_eq!(table.usage(), BlockUsage { young: 0, old: 64 * 1024 });
        assert_eq!(table.get(id).unwrap().generation, Generation::Old);
    }
}
