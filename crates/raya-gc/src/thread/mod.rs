//! Threads and root scanning
//!
//! Only attached OS threads may allocate. Each attached thread owns an
//! allocation point and a set of green-thread stacks that the scheduler
//! keeps up to date. A stop-the-world pause is coordinated cooperatively:
//! threads park at their next allocation or explicit safepoint poll.

pub mod native;
pub mod registry;
pub mod safepoint;
pub mod stacks;

pub use registry::{ThreadDescriptor, ThreadRegistry};
pub use safepoint::{SafepointCoordinator, StopGuard};
pub use stacks::{LightweightStack, StackScanReport, StackScanner, StackSet, StackState};
