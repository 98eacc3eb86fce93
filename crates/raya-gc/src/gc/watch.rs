//! Staleness oracle for cached addresses
//!
//! Code that holds a raw address across a possible collection point adds it
//! to a [`Watch`] and asks afterwards whether it may have moved. Answers are
//! conservative: "moved" can be a false positive, "not moved" never lies.
//!
//! Young data moves in every collection; old data and code only in full
//! collections; the static and weak pools never move.

use rustc_hash::FxHashMap;
use std::sync::Arc;

/// How an address can move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mobility {
    /// Never relocated
    Fixed,
    /// Relocated by any collection
    Young,
    /// Relocated by full collections
    Old,
}

/// Collection counters a watch compares against
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Epochs {
    /// Collections of any kind
    pub any: u64,
    /// Full collections
    pub full: u64,
}

/// Heap side of a watch
pub trait WatchSource: Send + Sync {
    /// Mobility of the allocation holding `addr`; `Fixed` for foreign memory
    fn mobility(&self, addr: usize) -> Mobility;

    /// Current collection counters
    fn epochs(&self) -> Epochs;
}

/// Set of watched addresses
#[derive(Clone)]
pub struct Watch {
    source: Arc<dyn WatchSource>,
    entries: FxHashMap<usize, (Mobility, Epochs)>,
}

impl Watch {
    pub(crate) fn new(source: Arc<dyn WatchSource>) -> Self {
        Self {
            source,
            entries: FxHashMap::default(),
        }
    }

    /// Start watching `addr`. Re-adding resets its history.
    pub fn add(&mut self, addr: usize) {
        let mobility = self.source.mobility(addr);
        self.entries.insert(addr, (mobility, self.source.epochs()));
    }

    /// Stop watching `addr`
    pub fn remove(&mut self, addr: usize) {
        self.entries.remove(&addr);
    }

    /// Stop watching everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of watched addresses
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is watched
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any watched address may have moved
    pub fn moved(&self) -> bool {
        let now = self.source.epochs();
        self.entries.values().any(|&(mobility, then)| stale(mobility, then, now))
    }

    /// Whether `addr` may have moved. Unwatched addresses always may have.
    pub fn moved_addr(&self, addr: usize) -> bool {
        match self.entries.get(&addr) {
            Some(&(mobility, then)) => stale(mobility, then, self.source.epochs()),
            None => true,
        }
    }
}

fn stale(mobility: Mobility, then: Epochs, now: Epochs) -> bool {
    match mobility {
        Mobility::Fixed => false,
        Mobility::Young => now.any != then.any,
        Mobility::Old => now.full != then.full,
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch").field("entries", &self.entries.len()).finish()
    }
}
