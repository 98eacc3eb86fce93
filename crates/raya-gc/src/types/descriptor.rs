//! Allocation shape descriptors
//!
//! The layout below is part of the binary contract with compiled code:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ TypeDescriptor (repr C)                  │
//! │  - kind: TypeKind (usize, 0..=4)         │
//! │  - runtime_type: *const c_void           │
//! │  - finalizer: Option<Finalizer>          │
//! │  - stride: usize                         │
//! │  - offsets: Box<[usize]>                 │
//! └──────────────────────────────────────────┘
//! ```

use crate::defaults::WORD;
use crate::{GcError, GcResult};
use std::ffi::c_void;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

/// Finalizer invoked with the client pointer of an unreachable object
pub type Finalizer = unsafe extern "C" fn(object: *mut u8);

/// Allocation kind
///
/// The discriminants are fixed and shared with compiled code.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Fixed-size object, references at the listed offsets
    Fixed = 0,
    /// Fixed-size object with an interior dispatch-table pointer at offset 0
    FixedWithVTable = 1,
    /// Runtime type object: dispatch table at offset 0, descriptor
    /// reference at `offsets[0]`, ordinary references at the rest
    TypeDescriptorItself = 2,
    /// Element count, filled count, then `count` elements of `stride` bytes
    Array = 3,
    /// Array of pointer-sized weak references
    WeakArray = 4,
}

impl TypeKind {
    /// Decode a raw kind value
    pub fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(TypeKind::Fixed),
            1 => Some(TypeKind::FixedWithVTable),
            2 => Some(TypeKind::TypeDescriptorItself),
            3 => Some(TypeKind::Array),
            4 => Some(TypeKind::WeakArray),
            _ => None,
        }
    }

    /// Short name used in error messages
    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Fixed => "Fixed",
            TypeKind::FixedWithVTable => "FixedWithVTable",
            TypeKind::TypeDescriptorItself => "TypeDescriptorItself",
            TypeKind::Array => "Array",
            TypeKind::WeakArray => "WeakArray",
        }
    }

    /// Whether allocations of this kind carry an element count
    pub fn is_array(self) -> bool {
        matches!(self, TypeKind::Array | TypeKind::WeakArray)
    }

    /// Whether offset 0 holds an interior dispatch-table pointer
    pub fn has_vtable(self) -> bool {
        matches!(self, TypeKind::FixedWithVTable | TypeKind::TypeDescriptorItself)
    }
}

/// Description of one allocation shape
#[repr(C)]
pub struct TypeDescriptor {
    kind: TypeKind,
    runtime_type: *const c_void,
    finalizer: Option<Finalizer>,
    stride: usize,
    offsets: Box<[usize]>,
}

// SAFETY: descriptors are immutable after construction. `runtime_type` is an
// opaque back-link that is never dereferenced by the heap.
unsafe impl Send for TypeDescriptor {}
unsafe impl Sync for TypeDescriptor {}

impl TypeDescriptor {
    /// Create and validate a descriptor
    ///
    /// Offsets must be word aligned and lie in `[0, stride)`. Kinds with a
    /// dispatch table reserve offset 0 for it, and weak arrays hold exactly
    /// one pointer per element.
    pub fn new(
        kind: TypeKind,
        runtime_type: *const c_void,
        stride: usize,
        offsets: Vec<usize>,
        finalizer: Option<Finalizer>,
    ) -> GcResult<Self> {
        for &offset in &offsets {
            if offset % WORD != 0 || offset + WORD > stride {
                return Err(GcError::StrideMismatch(format!(
                    "offset {offset} does not fit a {} of stride {stride}",
                    kind.name()
                )));
            }
            if kind.has_vtable() && offset == 0 {
                return Err(GcError::StrideMismatch(format!(
                    "offset 0 of a {} is its dispatch table",
                    kind.name()
                )));
            }
        }

        match kind {
            TypeKind::FixedWithVTable if stride < WORD => {
                return Err(GcError::StrideMismatch(format!(
                    "FixedWithVTable needs room for a dispatch table, stride is {stride}"
                )));
            }
            TypeKind::TypeDescriptorItself if offsets.is_empty() => {
                return Err(GcError::StrideMismatch(
                    "TypeDescriptorItself needs its descriptor field at offsets[0]".to_string(),
                ));
            }
            TypeKind::Array if stride == 0 => {
                return Err(GcError::StrideMismatch("Array elements cannot be empty".to_string()));
            }
            TypeKind::WeakArray if stride != WORD || offsets != [0] => {
                return Err(GcError::StrideMismatch(format!(
                    "WeakArray elements are single pointers, got stride {stride} offsets {offsets:?}"
                )));
            }
            _ => {}
        }

        Ok(Self {
            kind,
            runtime_type,
            finalizer,
            stride,
            offsets: offsets.into_boxed_slice(),
        })
    }

    /// Descriptor used for every weak array
    pub(crate) fn weak_array() -> Self {
        Self {
            kind: TypeKind::WeakArray,
            runtime_type: std::ptr::null(),
            finalizer: None,
            stride: WORD,
            offsets: vec![0].into_boxed_slice(),
        }
    }

    /// Allocation kind
    #[inline]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Bytes per object (fixed kinds) or per element (array kinds)
    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Byte offsets of references within one object or element
    #[inline]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Finalizer, if any
    #[inline]
    pub fn finalizer(&self) -> Option<Finalizer> {
        self.finalizer
    }

    /// Back-link to the runtime's type object
    #[inline]
    pub fn runtime_type(&self) -> *const c_void {
        self.runtime_type
    }

    /// Whether `other` may replace this descriptor in a live object header
    pub fn is_layout_compatible(&self, other: &TypeDescriptor) -> bool {
        self.kind == other.kind && self.stride == other.stride
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("kind", &self.kind)
            .field("stride", &self.stride)
            .field("offsets", &self.offsets)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Handle to a descriptor owned by a [`TypeTable`](super::TypeTable)
///
/// The handle stays valid until the descriptor is freed with
/// `free_type` and the deferred reclamation has run.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef(NonNull<TypeDescriptor>);

// SAFETY: the pointee is Sync and never moves while the table owns it.
unsafe impl Send for DescriptorRef {}
unsafe impl Sync for DescriptorRef {}

impl DescriptorRef {
    /// Wrap a raw descriptor pointer
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live descriptor owned by a type table.
    #[inline]
    pub unsafe fn from_raw(ptr: *const TypeDescriptor) -> Option<Self> {
        NonNull::new(ptr as *mut TypeDescriptor).map(DescriptorRef)
    }

    #[inline]
    pub(crate) fn from_ref(descriptor: &TypeDescriptor) -> Self {
        DescriptorRef(NonNull::from(descriptor))
    }

    /// Raw pointer, as stored in object headers
    #[inline]
    pub fn as_ptr(self) -> *const TypeDescriptor {
        self.0.as_ptr()
    }

    /// Address of the descriptor
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl Deref for DescriptorRef {
    type Target = TypeDescriptor;

    #[inline]
    fn deref(&self) -> &TypeDescriptor {
        // SAFETY: handles only come from a table that keeps the box alive.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{:#x}", **self, self.addr())
    }
}
