//! Heap state shared by allocation and collection
//!
//! Everything here lives behind the arena's heap mutex. Allocation points
//! only take it when they need a new block; the collector holds it for a
//! whole collection.

use super::block::{BlockTable, Generation, PoolKind};
use super::collector::GcStats;
use crate::config::GcConfig;
use serde::Serialize;

/// Mutable heap state of one arena
pub struct Heap {
    /// Blocks of every pool
    pub blocks: BlockTable,

    /// Client addresses of live objects whose descriptor has a finalizer
    pub finalizable: Vec<usize>,

    /// Collection statistics
    pub stats: GcStats,

    /// Young bytes that trigger a minor collection
    pub nursery_limit: usize,

    /// Old bytes that trigger a full collection. Adjusted after every full
    /// collection, never below the configured value.
    pub old_threshold: usize,

    /// Configured floor of `old_threshold`
    pub base_old_threshold: usize,
}

impl Heap {
    /// Create an empty heap
    pub fn new(config: &GcConfig) -> Self {
        Self {
            blocks: BlockTable::new(config.block_size, config.arena_limit, config.executable_code),
            finalizable: Vec::new(),
            stats: GcStats::default(),
            nursery_limit: config.nursery_limit,
            old_threshold: config.old_threshold,
            base_old_threshold: config.old_threshold,
        }
    }

    /// Check whether the nursery is over its limit
    pub fn needs_minor(&self) -> bool {
        self.blocks.usage().young > self.nursery_limit
    }

    /// Check whether the old generation is over its threshold
    pub fn needs_full(&self) -> bool {
        self.blocks.usage().old > self.old_threshold
    }

    /// Check whether any young block exists
    pub fn has_young(&self) -> bool {
        self.blocks.usage().young > 0
    }

    /// Per-pool memory usage
    pub fn summary(&self) -> MemorySummary {
        let mut summary = MemorySummary {
            mapped: self.blocks.mapped(),
            ..MemorySummary::default()
        };
        for id in self.blocks.ids() {
            let Some(block) = self.blocks.get(id) else {
                continue;
            };
            let pool = match block.pool {
                PoolKind::Data => &mut summary.data,
                PoolKind::Static => &mut summary.static_objects,
                PoolKind::Weak => &mut summary.weak,
                PoolKind::Code => &mut summary.code,
            };
            pool.blocks += 1;
            pool.capacity += block.size();
            pool.used += block.used;
            match block.generation {
                Generation::Young => summary.young += block.size(),
                Generation::Old => summary.old += block.size(),
            }
        }
        summary
    }
}

/// Usage of one pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    /// Number of blocks
    pub blocks: usize,
    /// Bytes in those blocks
    pub capacity: usize,
    /// Bytes holding allocations or markers
    pub used: usize,
}

impl PoolSummary {
    /// Bytes never handed out
    pub fn free(&self) -> usize {
        self.capacity - self.used
    }
}

/// Memory usage of an arena
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySummary {
    /// Bytes mapped, including chunks kept for reuse
    pub mapped: usize,
    /// Bytes in young blocks
    pub young: usize,
    /// Bytes in old blocks
    pub old: usize,
    /// Data pool
    pub data: PoolSummary,
    /// Static pool
    pub static_objects: PoolSummary,
    /// Weak pool
    pub weak: PoolSummary,
    /// Code pool
    pub code: PoolSummary,
}

impl MemorySummary {
    /// Bytes in blocks of every pool
    pub fn capacity(&self) -> usize {
        self.data.capacity + self.static_objects.capacity + self.weak.capacity + self.code.capacity
    }
}
