//! Heap configuration
//!
//! `GcConfig` collects every tunable of an arena. Values come from
//! [`GcConfig::default`], the builder methods, serde, or the environment:
//!
//! | Variable                        | Field                   |
//! |---------------------------------|-------------------------|
//! | `RAYA_GC_ARENA_LIMIT`           | `arena_limit`           |
//! | `RAYA_GC_BLOCK_SIZE`            | `block_size`            |
//! | `RAYA_GC_NURSERY_LIMIT`         | `nursery_limit`         |
//! | `RAYA_GC_OLD_THRESHOLD`         | `old_threshold`         |
//! | `RAYA_GC_FINALIZATION_INTERVAL` | `finalization_interval` |
//! | `RAYA_GC_CHECK_INTERVAL`        | `check_interval`        |
//! | `RAYA_GC_SCAN_NATIVE_STACKS`    | `scan_native_stacks`    |

use crate::defaults::{
    DEFAULT_ARENA_LIMIT, DEFAULT_BLOCK_SIZE, DEFAULT_CHECK_INTERVAL,
    DEFAULT_FINALIZATION_INTERVAL, DEFAULT_NURSERY_LIMIT, DEFAULT_OLD_THRESHOLD,
};
use serde::{Deserialize, Serialize};

/// Arena configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Maximum number of bytes the arena may map. Exceeding it is fatal.
    pub arena_limit: usize,

    /// Size of one pool block in bytes
    pub block_size: usize,

    /// Young bytes that trigger a minor collection
    pub nursery_limit: usize,

    /// Old bytes that trigger a full collection
    pub old_threshold: usize,

    /// Allocations per thread between inline finalizer drains
    pub finalization_interval: usize,

    /// Allocations per thread between inline consistency checks
    /// (`check-memory` builds only)
    pub check_interval: usize,

    /// Conservatively scan the native stacks of attached OS threads
    pub scan_native_stacks: bool,

    /// Map code blocks as executable
    pub executable_code: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            arena_limit: DEFAULT_ARENA_LIMIT,
            block_size: DEFAULT_BLOCK_SIZE,
            nursery_limit: DEFAULT_NURSERY_LIMIT,
            old_threshold: DEFAULT_OLD_THRESHOLD,
            finalization_interval: DEFAULT_FINALIZATION_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            scan_native_stacks: true,
            executable_code: true,
        }
    }
}

impl GcConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the defaults and apply any `RAYA_GC_*` environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();
        read_env("RAYA_GC_ARENA_LIMIT", &mut config.arena_limit);
        read_env("RAYA_GC_BLOCK_SIZE", &mut config.block_size);
        read_env("RAYA_GC_NURSERY_LIMIT", &mut config.nursery_limit);
        read_env("RAYA_GC_OLD_THRESHOLD", &mut config.old_threshold);
        read_env("RAYA_GC_FINALIZATION_INTERVAL", &mut config.finalization_interval);
        read_env("RAYA_GC_CHECK_INTERVAL", &mut config.check_interval);
        read_env("RAYA_GC_SCAN_NATIVE_STACKS", &mut config.scan_native_stacks);
        config
    }

    /// Set the arena limit
    pub fn with_arena_limit(mut self, bytes: usize) -> Self {
        self.arena_limit = bytes;
        self
    }

    /// Set the block size
    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Set the nursery limit
    pub fn with_nursery_limit(mut self, bytes: usize) -> Self {
        self.nursery_limit = bytes;
        self
    }

    /// Set the old generation threshold
    pub fn with_old_threshold(mut self, bytes: usize) -> Self {
        self.old_threshold = bytes;
        self
    }

    /// Set the finalization interval
    pub fn with_finalization_interval(mut self, allocations: usize) -> Self {
        self.finalization_interval = allocations.max(1);
        self
    }

    /// Set the consistency check interval
    pub fn with_check_interval(mut self, allocations: usize) -> Self {
        self.check_interval = allocations.max(1);
        self
    }

    /// Enable or disable conservative native stack scanning
    pub fn with_native_stack_scanning(mut self, enabled: bool) -> Self {
        self.scan_native_stacks = enabled;
        self
    }

    /// Enable or disable executable code blocks
    pub fn with_executable_code(mut self, enabled: bool) -> Self {
        self.executable_code = enabled;
        self
    }
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(variable = name, value = %raw, "ignoring unparsable GC setting"),
        }
    }
}
