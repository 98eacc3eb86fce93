//! Garbage collector
//!
//! Memory is organized in four pools of blocks:
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────────────────┐
//! │ Pool     │ Moves    │ Holds                                   │
//! ├──────────┼──────────┼─────────────────────────────────────────┤
//! │ Data     │ yes      │ objects and arrays, young then old      │
//! │ Static   │ no       │ non-moving objects, runtime type objects│
//! │ Weak     │ no       │ weak arrays                             │
//! │ Code     │ yes      │ machine code with reference tables      │
//! └──────────┴──────────┴─────────────────────────────────────────┘
//! ```
//!
//! Every allocation is a hidden header followed by the client payload:
//!
//! ```text
//! base                 client (returned to the runtime)
//! │                    │
//! ▼                    ▼
//! ┌────────────────────┬──────────────────────────────┬──────────┐
//! │ header             │ payload                      │ footer   │
//! └────────────────────┴──────────────────────────────┴──────────┘
//!                                                (check-memory only)
//! ```

pub mod alloc_point;
pub mod array;
pub mod block;
pub mod check;
pub mod code;
pub mod collector;
pub mod finalizer;
pub mod format;
pub mod header;
pub mod heap;
pub mod memory;
pub mod roots;
pub mod watch;

pub use alloc_point::AllocPoint;
pub use block::{BlockTable, Generation, PoolKind};
pub use collector::{CollectionKind, GcStats};
pub use format::{Fixer, ObjectFormat};
pub use heap::{Heap, MemorySummary, PoolSummary};
