//! Collector
//!
//! A collection runs with the world stopped and every allocation point
//! retired. It condemns a set of blocks (the young data blocks for a minor
//! collection, every block for a full one) and traces from the roots in
//! this order:
//!
//! 1. Ambiguous roots: thread stacks, ambiguous root ranges and the object
//!    whose finalizer is running. Any condemned object one of them points
//!    into is pinned where it is. This happens before anything moves.
//! 2. Exact roots: the root table and the finalization queue.
//! 3. For minor collections, every object outside the condemned set.
//! 4. Transitive closure. Reachable objects of moving pools are copied to
//!    old blocks and leave a forwarding marker; objects of non-moving pools
//!    and pinned objects are marked in place.
//! 5. Finalization: registered objects that were not reached are revived
//!    for one more cycle and queued.
//! 6. Weak arrays: slots whose referent was not reached are splatted.
//! 7. Sweep: unpinned moving blocks are released whole; pinned and
//!    non-moving blocks keep their live objects and have the dead ones
//!    turned into padding.

use super::alloc_point::AllocPoint;
use super::block::{BlockId, BlockTable, Generation, PoolKind};
use super::finalizer::FinalizationQueue;
use super::format::{walk, Fixer};
use super::header::Header;
use super::heap::Heap;
use super::roots::RootTable;
use crate::defaults::{HEADER_SIZE, PENDING_FREE_THRESHOLD, WORD};
use crate::thread::ThreadDescriptor;
use crate::types::{TypeDescriptor, TypeTable};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Kind of collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionKind {
    /// Young data blocks only
    Minor,
    /// Every block of every pool
    Full,
}

/// Collection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Minor collections
    pub minor_collections: usize,

    /// Full collections
    pub full_collections: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Maximum pause time
    pub max_pause_time: Duration,

    /// Objects copied, all collections
    pub objects_moved: usize,

    /// Bytes copied, all collections
    pub bytes_moved: usize,

    /// Objects pinned by ambiguous references, all collections
    pub objects_pinned: usize,

    /// Condemned bytes that did not survive, all collections
    pub bytes_reclaimed: usize,

    /// Weak slots cleared, all collections
    pub weak_splatted: usize,

    /// Objects queued for finalization, all collections
    pub finalizers_queued: usize,

    /// Descriptors released after a reclamation walk
    pub descriptors_reclaimed: usize,

    /// Green-thread stacks skipped because a switch was in flight
    pub stacks_skipped: usize,

    /// Native stacks left out because no green stack was running
    pub native_stacks_skipped: usize,

    /// Bytes that survived the last collection
    pub last_survived_bytes: usize,
}

impl GcStats {
    fn update(&mut self, kind: CollectionKind, pause_time: Duration, cycle: &CycleStats) {
        self.collections += 1;
        match kind {
            CollectionKind::Minor => self.minor_collections += 1,
            CollectionKind::Full => self.full_collections += 1,
        }
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;
        if pause_time > self.max_pause_time {
            self.max_pause_time = pause_time;
        }

        self.objects_moved += cycle.moved;
        self.bytes_moved += cycle.bytes_moved;
        self.objects_pinned += cycle.pinned;
        self.bytes_reclaimed += cycle.reclaimed;
        self.weak_splatted += cycle.splatted;
        self.finalizers_queued += cycle.queued;
        self.stacks_skipped += cycle.stacks_skipped;
        self.native_stacks_skipped += cycle.native_stacks_skipped;
        self.last_survived_bytes = cycle.bytes_moved + cycle.retained;
    }

    /// Average pause time
    pub fn avg_pause_time(&self) -> Duration {
        if self.collections == 0 {
            return Duration::ZERO;
        }
        self.total_pause_time / self.collections as u32
    }
}

#[derive(Debug, Default)]
struct CycleStats {
    moved: usize,
    bytes_moved: usize,
    pinned: usize,
    retained: usize,
    reclaimed: usize,
    splatted: usize,
    queued: usize,
    stacks_skipped: usize,
    native_stacks_skipped: usize,
}

/// Everything a collection reads or rewrites besides the blocks
pub struct Collection<'a> {
    /// Heap state, locked for the whole collection
    pub heap: &'a mut Heap,
    /// Registered roots
    pub roots: &'a RootTable,
    /// Objects awaiting finalization
    pub queue: &'a FinalizationQueue,
    /// Descriptor table, for deferred frees
    pub types: &'a TypeTable,
    /// Every attached thread
    pub threads: &'a [Arc<ThreadDescriptor>],
    /// Whether native stacks are scanned
    pub scan_native_stacks: bool,
}

impl Collection<'_> {
    /// Run one collection
    ///
    /// # Safety
    ///
    /// The world must be stopped and every allocation point retired.
    pub unsafe fn run(self, kind: CollectionKind) {
        let start = Instant::now();
        let Collection {
            heap,
            roots,
            queue,
            types,
            threads,
            scan_native_stacks,
        } = self;

        let Heap {
            blocks, finalizable, ..
        } = &mut *heap;

        let (condemned, others) = condemn(blocks, kind);
        let condemned_bytes: usize = condemned
            .iter()
            .filter_map(|&id| blocks.get(id))
            .map(|b| b.used)
            .sum();
        tracing::debug!(?kind, blocks = condemned.len(), bytes = condemned_bytes, "collection started");

        let mut tracer = Tracer::new(blocks);

        // Ambiguous roots first: nothing may move before every pin is known
        for thread in threads {
            let native = if scan_native_stacks {
                thread.native_range()
            } else {
                None
            };
            let report = thread.scan(native);
            tracer.cycle.stacks_skipped += report.skipped;
            if report.native_skipped {
                tracing::warn!(thread = ?thread.id(), "native stack not scanned, no stack running");
                tracer.cycle.native_stacks_skipped += 1;
            }
            for (low, high) in report.ranges {
                tracer.scan_ambiguous(low, high);
            }
        }
        for (low, high) in roots.ambiguous_ranges() {
            tracer.scan_ambiguous(low, high);
        }
        let in_flight = queue.in_flight();
        if in_flight != 0 {
            tracer.pin(in_flight);
        }

        roots.scan_exact(&mut tracer);
        queue.fix_entries(|slot| tracer.fix(slot));

        if kind == CollectionKind::Minor {
            for &id in &others {
                tracer.scan_block(id);
            }
        }
        tracer.drain();

        // Finalization: unreached registrants get one more cycle
        let mut survivors = Vec::with_capacity(finalizable.len());
        let mut doomed = Vec::new();
        for client in finalizable.drain(..) {
            match tracer.survivor(client) {
                Some(now) => survivors.push(now),
                None => doomed.push(client),
            }
        }
        for mut client in doomed {
            tracer.fix(&mut client);
            queue.push(client);
            tracer.cycle.queued += 1;
        }
        tracer.drain();
        *finalizable = survivors;

        tracer.weak_pass(kind);

        let mut cycle = tracer.finish(&condemned);
        cycle.reclaimed = condemned_bytes.saturating_sub(cycle.retained + cycle.bytes_moved);

        if kind == CollectionKind::Full {
            heap.old_threshold = (heap.blocks.usage().old * 2).max(heap.base_old_threshold);
        }

        let pending = types.pending_len();
        if pending > 0 && (kind == CollectionKind::Full || pending > PENDING_FREE_THRESHOLD) {
            let in_use = descriptors_in_use(&heap.blocks);
            let released = types.reclaim(&in_use);
            heap.stats.descriptors_reclaimed += released;
            tracing::debug!(released, pending, "reclaimed descriptors");
        }

        let pause = start.elapsed();
        heap.stats.update(kind, pause, &cycle);
        tracing::debug!(
            ?kind,
            pause_us = pause.as_micros() as u64,
            moved = cycle.moved,
            pinned = cycle.pinned,
            reclaimed = cycle.reclaimed,
            splatted = cycle.splatted,
            queued = cycle.queued,
            "collection finished"
        );
    }
}

/// Flag the condemned set. Returns (condemned, others), each in address order.
fn condemn(blocks: &mut BlockTable, kind: CollectionKind) -> (Vec<BlockId>, Vec<BlockId>) {
    let mut condemned = Vec::new();
    let mut others = Vec::new();
    for id in blocks.ids() {
        let Some(block) = blocks.get_mut(id) else {
            continue;
        };
        block.pinned = false;
        block.condemned = match kind {
            CollectionKind::Full => true,
            CollectionKind::Minor => block.pool == PoolKind::Data && block.generation == Generation::Young,
        };
        if block.condemned {
            condemned.push(id);
        } else {
            others.push(id);
        }
    }
    (condemned, others)
}

/// Addresses of every descriptor some allocation still refers to
pub(crate) unsafe fn descriptors_in_use(blocks: &BlockTable) -> FxHashSet<usize> {
    struct Collect(FxHashSet<usize>);

    impl Fixer for Collect {
        fn fix(&mut self, _slot: &mut usize) {}

        fn fix_descriptor(&mut self, descriptor: *const TypeDescriptor) {
            self.0.insert(descriptor as usize);
        }
    }

    let mut collect = Collect(FxHashSet::default());
    for id in blocks.ids() {
        let Some(block) = blocks.get(id) else {
            continue;
        };
        if block.pool == PoolKind::Code {
            continue;
        }
        let format = block.pool.format();
        let mut bases = Vec::new();
        if let Err(e) = walk(format, block.start(), block.limit(), |base, header| {
            if header.is_allocation() {
                bases.push(base);
            }
        }) {
            panic!("descriptor walk failed: {e}");
        }
        for base in bases {
            format.scan(base, &mut collect);
        }
    }
    collect.0
}

/// Tracing state of one collection
struct Tracer<'a> {
    blocks: &'a mut BlockTable,

    /// Bases of objects kept in place: pinned, or in a non-moving pool
    marked: FxHashSet<usize>,

    /// Objects whose references have not been fixed yet
    gray: Vec<(usize, PoolKind)>,

    /// To-space for data
    copy_data: AllocPoint,

    /// To-space for code
    copy_code: AllocPoint,

    /// Sorted allocation starts of condemned blocks, built on first use
    starts: FxHashMap<BlockId, Vec<usize>>,

    /// Splat unreached weak referents
    weak: bool,

    cycle: CycleStats,
}

impl<'a> Tracer<'a> {
    fn new(blocks: &'a mut BlockTable) -> Self {
        Self {
            blocks,
            marked: FxHashSet::default(),
            gray: Vec::new(),
            copy_data: AllocPoint::new(PoolKind::Data, Generation::Old),
            copy_code: AllocPoint::new(PoolKind::Code, Generation::Old),
            starts: FxHashMap::default(),
            weak: false,
            cycle: CycleStats::default(),
        }
    }

    /// Condemned block whose walkable region holds `addr`
    fn condemned_block(&self, addr: usize) -> Option<(BlockId, PoolKind)> {
        let id = self.blocks.find(addr)?;
        let block = self.blocks.get(id)?;
        (block.condemned && block.holds(addr)).then_some((id, block.pool))
    }

    /// Start of the allocation containing `addr` in block `id`
    unsafe fn containing(&mut self, id: BlockId, addr: usize) -> Option<usize> {
        if !self.starts.contains_key(&id) {
            let block = self.blocks.get(id)?;
            let mut starts = Vec::new();
            if let Err(e) = walk(block.pool.format(), block.start(), block.limit(), |base, _| {
                starts.push(base as usize)
            }) {
                panic!("walk of condemned block {id} failed: {e}");
            }
            self.starts.insert(id, starts);
        }
        let starts = self.starts.get(&id)?;
        let index = starts.partition_point(|&start| start <= addr);
        (index > 0).then(|| starts[index - 1])
    }

    /// Conservatively scan the words of `[low, high)`
    unsafe fn scan_ambiguous(&mut self, low: usize, high: usize) {
        let mut at = (low + WORD - 1) & !(WORD - 1);
        while at + WORD <= high {
            let word = std::ptr::read_volatile(at as *const usize);
            self.pin(word);
            at += WORD;
        }
    }

    /// Pin the condemned allocation containing `addr`, if any
    unsafe fn pin(&mut self, addr: usize) {
        let Some((id, pool)) = self.condemned_block(addr) else {
            return;
        };
        let Some(base) = self.containing(id, addr) else {
            return;
        };
        if !Header::read(base as *const u8).is_allocation() {
            return;
        }
        if self.marked.insert(base) {
            if pool.is_moving() {
                if let Some(block) = self.blocks.get_mut(id) {
                    block.pinned = true;
                }
                self.cycle.pinned += 1;
                tracing::trace!(addr, base, block = id, "ambiguous reference pins block");
            }
            self.gray.push((base, pool));
        }
    }

    /// Scan every allocation of a block that is not condemned
    unsafe fn scan_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(id) else {
            return;
        };
        let format = block.pool.format();
        let mut bases = Vec::new();
        if let Err(e) = walk(format, block.start(), block.limit(), |base, header| {
            if header.is_allocation() {
                bases.push(base);
            }
        }) {
            panic!("walk of block {id} failed: {e}");
        }
        for base in bases {
            format.scan(base, &mut *self);
        }
    }

    /// Fix the references of every gray object until none are left
    unsafe fn drain(&mut self) {
        while let Some((base, pool)) = self.gray.pop() {
            pool.format().scan(base as *mut u8, &mut *self);
        }
    }

    /// Copy a reachable object out of its condemned block
    unsafe fn evacuate(&mut self, base: usize, id: BlockId, pool: PoolKind) -> usize {
        let format = pool.format();
        let size = format.size(base as *const u8);
        let ap = match pool {
            PoolKind::Code => &mut self.copy_code,
            _ => &mut self.copy_data,
        };
        let to = match ap.reserve(self.blocks, size) {
            Ok(to) => to,
            Err(e) => {
                // Out of to-space: keep the object where it is
                tracing::warn!(error = %e, base, "evacuation failed, pinning in place");
                self.marked.insert(base);
                if let Some(block) = self.blocks.get_mut(id) {
                    block.pinned = true;
                }
                self.cycle.pinned += 1;
                self.gray.push((base, pool));
                return base;
            }
        };
        std::ptr::copy_nonoverlapping(base as *const u8, to as *mut u8, size);
        ap.commit(to, size);
        format.forward(base as *mut u8, to as *mut u8);
        self.cycle.moved += 1;
        self.cycle.bytes_moved += size;
        self.gray.push((to, pool));
        to
    }

    /// Current client address of a registrant if it was reached
    unsafe fn survivor(&self, client: usize) -> Option<usize> {
        let base = client - HEADER_SIZE;
        if self.condemned_block(base).is_none() {
            return Some(client);
        }
        if let Some(to) = Header::read(base as *const u8).forwarded_to() {
            return Some(to + HEADER_SIZE);
        }
        self.marked.contains(&base).then_some(client)
    }

    /// Splat weak slots whose referents were not reached
    unsafe fn weak_pass(&mut self, kind: CollectionKind) {
        self.weak = true;
        for id in self.blocks.ids_of(PoolKind::Weak) {
            let Some(block) = self.blocks.get(id) else {
                continue;
            };
            let condemned = block.condemned;
            let format = block.pool.format();
            let mut bases = Vec::new();
            if let Err(e) = walk(format, block.start(), block.limit(), |base, header| {
                if header.is_allocation() {
                    bases.push(base);
                }
            }) {
                panic!("walk of weak block {id} failed: {e}");
            }
            for base in bases {
                // Dead weak arrays are swept; scanning them would only waste time
                if kind == CollectionKind::Full && condemned && !self.marked.contains(&(base as usize)) {
                    continue;
                }
                format.scan(base, &mut *self);
            }
        }
        self.weak = false;
    }

    /// Retire the to-space and sweep the condemned blocks
    unsafe fn finish(mut self, condemned: &[BlockId]) -> CycleStats {
        self.copy_data.retire(self.blocks);
        self.copy_code.retire(self.blocks);

        for &id in condemned {
            let Some(block) = self.blocks.get(id) else {
                continue;
            };
            let pool = block.pool;
            let pinned = block.pinned;
            if pool.is_moving() && !pinned {
                self.blocks.release(id);
                continue;
            }

            let format = pool.format();
            let (start, limit) = (block.start(), block.limit());
            let mut dead = Vec::new();
            let mut live = 0;
            if let Err(e) = walk(format, start, limit, |base, header| {
                if !header.is_allocation() {
                    return;
                }
                let size = format.size(base);
                if self.marked.contains(&(base as usize)) {
                    live += size;
                } else {
                    dead.push((base, size));
                }
            }) {
                panic!("sweep of block {id} failed: {e}");
            }

            if live == 0 && !pinned {
                self.blocks.release(id);
                continue;
            }

            for (base, size) in dead {
                format.pad(base, size);
            }
            if let Err(e) = walk(format, start, limit, |_, _| {}) {
                panic!("block {id} unwalkable after sweep: {e}");
            }
            self.cycle.retained += live;
            if let Some(block) = self.blocks.get_mut(id) {
                block.condemned = false;
                block.pinned = false;
            }
            self.blocks.set_generation(id, Generation::Old);
        }
        self.cycle
    }
}

impl Fixer for Tracer<'_> {
    fn fix(&mut self, slot: &mut usize) {
        let client = *slot;
        if client % WORD != 0 || client < HEADER_SIZE {
            return;
        }
        let base = client - HEADER_SIZE;
        let Some((id, pool)) = self.condemned_block(base) else {
            return;
        };
        // SAFETY: exact references point at client pointers of allocations,
        // and `base` lies in the walkable region of a condemned block
        unsafe {
            let header = Header::read(base as *const u8);
            if let Some(to) = header.forwarded_to() {
                *slot = to + HEADER_SIZE;
                return;
            }
            if !header.is_allocation() {
                panic!("reference {client:#x} points into reclaimed memory");
            }
            if self.marked.contains(&base) {
                return;
            }
            if pool.is_moving() {
                *slot = self.evacuate(base, id, pool) + HEADER_SIZE;
            } else {
                self.marked.insert(base);
                self.gray.push((base, pool));
            }
        }
    }

    fn fix_weak(&mut self, slot: &mut usize) -> bool {
        if !self.weak {
            return false;
        }
        let client = *slot;
        if client % WORD != 0 || client < HEADER_SIZE {
            return false;
        }
        let base = client - HEADER_SIZE;
        if self.condemned_block(base).is_none() {
            return false;
        }
        // SAFETY: as for `fix`
        let header = unsafe { Header::read(base as *const u8) };
        if let Some(to) = header.forwarded_to() {
            *slot = to + HEADER_SIZE;
            return false;
        }
        if self.marked.contains(&base) {
            return false;
        }
        self.cycle.splatted += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_update() {
        let mut stats = GcStats::default();
        let cycle = CycleStats {
            moved: 3,
            bytes_moved: 96,
            pinned: 1,
            retained: 32,
            reclaimed: 1000,
            splatted: 2,
            queued: 1,
            stacks_skipped: 1,
            native_stacks_skipped: 1,
        };
        stats.update(CollectionKind::Minor, Duration::from_micros(50), &cycle);
        stats.update(CollectionKind::Full, Duration::from_micros(150), &cycle);

        assert_eq!(stats.collections, 2);
        assert_eq!(stats.minor_collections, 1);
        assert_eq!(stats.full_collections, 1);
        assert_eq!(stats.objects_moved, 6);
        assert_eq!(stats.weak_splatted, 4);
        assert_eq!(stats.max_pause_time, Duration::from_micros(150));
        assert_eq!(stats.avg_pause_time(), Duration::from_micros(100));
        assert_eq!(stats.last_survived_bytes, 128);
        assert_eq!(stats.stacks_skipped, 2);
        assert_eq!(stats.native_stacks_skipped, 2);
    }

    #[test]
    fn test_condemned_sets() {
        let mut blocks = BlockTable::new(64 * 1024, 1 << 24, false);
        let young = blocks.acquire(PoolKind::Data, Generation::Young, 64).unwrap();
        let old = blocks.acquire(PoolKind::Data, Generation::Old, 64).unwrap();
        let weak = blocks.acquire(PoolKind::Weak, Generation::Old, 64).unwrap();

        let (condemned, others) = condemn(&mut blocks, CollectionKind::Minor);
        assert_eq!(condemned, vec![young]);
        assert_eq!(others.len(), 2);
        assert!(others.contains(&old) && others.contains(&weak));

        let (condemned, others) = condemn(&mut blocks, CollectionKind::Full);
        assert_eq!(condemned.len(), 3);
        assert!(others.is_empty());
    }
}
