//! Safepoint coordination for stop-the-world pauses
//!
//! Attached threads are either *running* (they may touch the heap) or in
//! *native* state (parked at a safepoint, blocked in foreign code, or
//! detaching). A collection may only start once no thread is running.
//!
//! ## Poll locations
//!
//! - Every allocation entry point polls before touching its allocation point
//! - [`crate::Arena::safepoint`] polls explicitly, for long loops that do not allocate
//! - [`crate::Arena::enter_native`] leaves the running set for the lifetime
//!   of the returned guard
//!
//! A poll with no pause pending is a single atomic load.

use super::native::with_registers_spilled;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Statistics tracking for safepoint operations
#[derive(Debug, Default)]
pub struct SafepointStats {
    /// Total number of pauses
    total_pauses: AtomicUsize,
    /// Total time the world was stopped (microseconds)
    total_pause_time_us: AtomicUsize,
    /// Maximum pause time (microseconds)
    max_pause_time_us: AtomicUsize,
    /// Number of times a thread parked at a poll
    parks: AtomicUsize,
}

impl SafepointStats {
    fn record_pause(&self, elapsed: usize) {
        self.total_pause_time_us.fetch_add(elapsed, Ordering::Relaxed);
        self.total_pauses.fetch_add(1, Ordering::Relaxed);

        let mut max = self.max_pause_time_us.load(Ordering::Relaxed);
        while elapsed > max {
            match self.max_pause_time_us.compare_exchange_weak(
                max,
                elapsed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }

    /// Total number of pauses
    pub fn total_pauses(&self) -> usize {
        self.total_pauses.load(Ordering::Relaxed)
    }

    /// Total stopped time in microseconds
    pub fn total_pause_time_us(&self) -> usize {
        self.total_pause_time_us.load(Ordering::Relaxed)
    }

    /// Longest pause in microseconds
    pub fn max_pause_time_us(&self) -> usize {
        self.max_pause_time_us.load(Ordering::Relaxed)
    }

    /// Number of parks at polls
    pub fn parks(&self) -> usize {
        self.parks.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct PauseState {
    /// Threads currently allowed to touch the heap
    running: usize,
    /// A pause has been requested or is in progress
    stopping: bool,
}

/// Coordinates stop-the-world pauses across attached threads
#[derive(Debug, Default)]
pub struct SafepointCoordinator {
    /// Mirror of `state.stopping` for the lock-free poll
    pending: AtomicBool,
    state: Mutex<PauseState>,
    changed: Condvar,
    /// Statistics
    pub stats: SafepointStats,
}

impl SafepointCoordinator {
    /// Create a coordinator with no running threads
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast inline check, called from every allocation
    #[inline(always)]
    pub fn poll(&self, saved_sp: &AtomicUsize) {
        if self.pending.load(Ordering::Acquire) {
            self.park(saved_sp);
        }
    }

    /// Slow path: wait out a pause
    #[cold]
    #[inline(never)]
    fn park(&self, saved_sp: &AtomicUsize) {
        // The wait happens inside the closure so the spilled registers stay
        // on the stack while the collector scans it
        with_registers_spilled(|sp| {
            saved_sp.store(sp, Ordering::Release);
            let mut state = self.state.lock();
            if !state.stopping {
                return;
            }
            self.stats.parks.fetch_add(1, Ordering::Relaxed);
            state.running -= 1;
            self.changed.notify_all();
            while state.stopping {
                self.changed.wait(&mut state);
            }
            state.running += 1;
        })
    }

    /// Check if a pause is currently pending
    #[inline]
    pub fn is_pause_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Number of threads in running state
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Leave running state. The caller's stack is scanned from its current
    /// frame up, so it must not hold references in frames it returns from
    /// before calling [`SafepointCoordinator::leave_native`].
    pub fn enter_native(&self, saved_sp: &AtomicUsize) {
        with_registers_spilled(|sp| saved_sp.store(sp, Ordering::Release));
        let mut state = self.state.lock();
        state.running -= 1;
        self.changed.notify_all();
    }

    /// Return to running state, waiting out any pause in progress
    pub fn leave_native(&self) {
        let mut state = self.state.lock();
        while state.stopping {
            self.changed.wait(&mut state);
        }
        state.running += 1;
    }

    /// Stop every running thread
    ///
    /// `caller_running` says whether the calling thread is itself counted as
    /// running. Returns `None` if another thread's pause was already in
    /// progress; the caller has then waited it out and should re-check
    /// whatever made it want to stop the world.
    pub fn stop_the_world(&self, caller_running: bool) -> Option<StopGuard<'_>> {
        let mut state = self.state.lock();
        if caller_running {
            state.running -= 1;
            self.changed.notify_all();
        }

        if state.stopping {
            while state.stopping {
                self.changed.wait(&mut state);
            }
            if caller_running {
                state.running += 1;
            }
            return None;
        }

        state.stopping = true;
        self.pending.store(true, Ordering::Release);
        let start = Instant::now();
        while state.running > 0 {
            self.changed.wait(&mut state);
        }
        tracing::trace!(waited_us = start.elapsed().as_micros() as u64, "world stopped");

        Some(StopGuard {
            coordinator: self,
            caller_running,
            start,
        })
    }
}

/// Restarts the world when dropped
#[must_use = "the world restarts as soon as the guard is dropped"]
pub struct StopGuard<'a> {
    coordinator: &'a SafepointCoordinator,
    caller_running: bool,
    start: Instant,
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        let coordinator = self.coordinator;
        let mut state = coordinator.state.lock();
        state.stopping = false;
        coordinator.pending.store(false, Ordering::Release);
        if self.caller_running {
            state.running += 1;
        }
        coordinator.changed.notify_all();
        drop(state);
        coordinator
            .stats
            .record_pause(self.start.elapsed().as_micros() as usize);
    }
}
