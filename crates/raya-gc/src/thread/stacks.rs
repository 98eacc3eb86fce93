//! Green-thread stacks
//!
//! Many lightweight threads run cooperatively on one OS thread. The
//! scheduler reports every switch through [`LightweightStack`]:
//!
//! ```text
//!            suspend(low, high)
//!   Running ───────────────────▶ Suspended { low, high }
//!      ▲                                │
//!      │ resume()                       │ begin_switch()
//!      │                                ▼
//!      └──────────────────────────  Switching
//! ```
//!
//! A suspended stack is scanned over its saved range. The running stack
//! is covered by the native scan of the OS thread. A stack caught in the
//! middle of a switch is skipped for this cycle and picked up by the next
//! one: its registers are not in a consistent saved state yet.
//!
//! A stack counts as caught mid-switch when it is `Switching`, when the
//! OS thread is still executing inside a range it has already reported as
//! suspended, or when nothing is running and its range ends where the
//! native range ends. A suspended stack with another stack running is
//! always scanned, however its bounds relate to the native stack.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(1);

/// State of one lightweight stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// Executing on the OS thread
    Running,
    /// Parked; `[low, high)` holds its frames and saved registers
    Suspended {
        /// Lowest live address (the saved stack pointer)
        low: usize,
        /// Highest address of the stack
        high: usize,
    },
    /// A switch into or out of this stack is in flight
    Switching,
}

/// One green-thread stack
#[derive(Debug)]
pub struct LightweightStack {
    id: u64,
    /// Highest address of the stack's memory
    limit: usize,
    state: Mutex<StackState>,
}

impl LightweightStack {
    /// Create a stack whose memory ends at `limit`, initially running
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
            limit,
            state: Mutex::new(StackState::Running),
        })
    }

    /// Unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Highest address of the stack's memory
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Current state
    pub fn state(&self) -> StackState {
        *self.state.lock()
    }

    /// Record that the stack stopped running with live frames in `[low, high)`
    pub fn suspend(&self, low: usize, high: usize) {
        debug_assert!(low <= high);
        *self.state.lock() = StackState::Suspended { low, high };
    }

    /// Record that a switch involving this stack has started
    pub fn begin_switch(&self) {
        *self.state.lock() = StackState::Switching;
    }

    /// Record that the stack is executing again
    pub fn resume(&self) {
        *self.state.lock() = StackState::Running;
    }
}

/// What to scan for one OS thread
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StackScanReport {
    /// Ranges to scan conservatively, `[start, end)`
    pub ranges: Vec<(usize, usize)>,
    /// Stacks skipped because a switch was in flight
    pub skipped: usize,
    /// Whether the native stack was left out because no stack was running
    pub native_skipped: bool,
}

/// Root callback of one attached thread
///
/// `native` is `(sp, top)`: the stack pointer the OS thread last stopped
/// at and the top of its native stack, or `None` when native stacks are
/// not scanned. `sp` may lie outside the native stack while a green
/// stack is running, so the scanner decides which bound applies.
pub trait StackScanner: Send + Sync {
    /// Decide which memory holds this thread's roots
    fn scan(&self, native: Option<(usize, usize)>) -> StackScanReport;
}

/// The lightweight stacks currently multiplexed on one OS thread
#[derive(Debug, Default)]
pub struct StackSet {
    stacks: Mutex<Vec<Arc<LightweightStack>>>,
}

impl StackSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack
    pub fn add(&self, stack: Arc<LightweightStack>) {
        self.stacks.lock().push(stack);
    }

    /// Remove a stack by id. Returns whether it was present.
    pub fn remove(&self, id: u64) -> bool {
        let mut stacks = self.stacks.lock();
        let before = stacks.len();
        stacks.retain(|s| s.id() != id);
        stacks.len() != before
    }

    /// Number of stacks
    pub fn len(&self) -> usize {
        self.stacks.lock().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.stacks.lock().is_empty()
    }
}

impl StackScanner for StackSet {
    fn scan(&self, native: Option<(usize, usize)>) -> StackScanReport {
        let stacks = self.stacks.lock();
        let mut report = StackScanReport::default();
        let states: Vec<StackState> = stacks.iter().map(|s| s.state()).collect();
        let running_at = states.iter().position(|&state| state == StackState::Running);
        let running = running_at.map(|i| &*stacks[i]);

        for (i, (stack, state)) in stacks.iter().zip(&states).enumerate() {
            if Some(i) == running_at {
                continue;
            }
            match *state {
                StackState::Suspended { low, high } => {
                    let mid_switch = native.is_some_and(|(sp, top)| {
                        (low..high).contains(&sp) || (running.is_none() && top == high)
                    });
                    if mid_switch {
                        tracing::warn!(stack = stack.id(), "skipping stack caught mid-switch");
                        report.skipped += 1;
                    } else if low < high {
                        tracing::trace!(stack = stack.id(), low, high, "scanning suspended stack");
                        report.ranges.push((low, high));
                    }
                }
                StackState::Running | StackState::Switching => {
                    tracing::warn!(stack = stack.id(), "skipping stack caught mid-switch");
                    report.skipped += 1;
                }
            }
        }

        if let Some((sp, top)) = native {
            let range = match running {
                // The OS thread is executing on the running stack's memory
                Some(stack) if sp < stack.limit() => Some((sp, stack.limit())),
                Some(_) => (sp < top).then_some((sp, top)),
                None if stacks.is_empty() => (sp < top).then_some((sp, top)),
                None => None,
            };
            match range {
                Some(range) => report.ranges.push(range),
                None => report.native_skipped = true,
            }
        }

        report
    }
}
