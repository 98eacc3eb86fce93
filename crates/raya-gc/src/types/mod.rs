//! Type descriptors
//!
//! A [`TypeDescriptor`] describes the shape of one kind of allocation: how
//! large it is, where its pointers live, and what to call when it dies.
//! Descriptors are owned by a [`TypeTable`] and never move.

pub mod descriptor;
pub mod table;

pub use descriptor::{DescriptorRef, Finalizer, TypeDescriptor, TypeKind};
pub use table::TypeTable;
