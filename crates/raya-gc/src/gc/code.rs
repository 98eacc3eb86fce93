//! Code pool format
//!
//! Code blocks carry no descriptor. The header records the byte size of the
//! machine code and a reference table follows the code:
//!
//! ```text
//! client
//! ┌──────────────────────────────┐
//! │ machine code (size bytes)    │
//! │ padding to a word boundary   │
//! ├──────────────────────────────┤
//! │ ref count                    │
//! │ anchor (address the relative │
//! │ operands were encoded for)   │
//! │ (offset << 8) | flags  × N   │
//! └──────────────────────────────┘
//! ```
//!
//! An absolute entry stores a pointer-sized operand at `offset`. A relative
//! entry stores a 32-bit displacement measured from the end of the 4-byte
//! field, as used by `call rel32`. Scanning fixes every operand and then
//! re-encodes the relative ones for wherever the block now lives.
//!
//! An entry only becomes a reference once `write_target` has stored its
//! operand. Until then the collector leaves it alone, since the bytes at
//! its offset are still whatever the caller has not filled in yet.

use super::format::{marker_size, Fixer, ObjectFormat};
use super::header::Header;
use crate::defaults::{align_up, ALIGNMENT, FOOTER_SIZE, HEADER_SIZE, WORD};
use crate::{GcError, GcResult};
use std::ptr::NonNull;

const KIND_BITS: usize = 8;
const WRITTEN: usize = 1 << (KIND_BITS - 1);
const KIND_MASK: usize = WRITTEN - 1;
const RELATIVE_WIDTH: usize = 4;

/// How an operand is embedded in the instruction stream
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeRefKind {
    /// Pointer-sized absolute address
    Absolute = 1,
    /// 32-bit displacement from the end of the operand
    Relative = 2,
}

/// One entry of a code block's reference table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRef {
    /// Byte offset of the operand within the code
    pub offset: usize,
    /// Encoding of the operand
    pub kind: CodeRefKind,
}

impl CodeRef {
    /// Absolute operand at `offset`
    pub fn absolute(offset: usize) -> Self {
        Self { offset, kind: CodeRefKind::Absolute }
    }

    /// Relative operand at `offset`
    pub fn relative(offset: usize) -> Self {
        Self { offset, kind: CodeRefKind::Relative }
    }

    fn width(&self) -> usize {
        match self.kind {
            CodeRefKind::Absolute => WORD,
            CodeRefKind::Relative => RELATIVE_WIDTH,
        }
    }

    fn encode(&self) -> usize {
        (self.offset << KIND_BITS) | self.kind as usize
    }

    /// Entry and whether its operand has been written
    fn decode(raw: usize) -> Option<(Self, bool)> {
        let kind = match raw & KIND_MASK {
            1 => CodeRefKind::Absolute,
            2 => CodeRefKind::Relative,
            _ => return None,
        };
        Some((Self { offset: raw >> KIND_BITS, kind }, raw & WRITTEN != 0))
    }
}

#[inline]
fn word_round(size: usize) -> usize {
    (size + WORD - 1) & !(WORD - 1)
}

/// Total size of a code block with `size` code bytes and `refs` table entries
pub fn code_size(size: usize, refs: usize) -> Option<usize> {
    let code = size.checked_add(WORD - 1)? & !(WORD - 1);
    let table = refs.checked_add(2)?.checked_mul(WORD)?;
    let raw = code.checked_add(table)?.checked_add(HEADER_SIZE + FOOTER_SIZE)?;
    let padded = raw.checked_add(ALIGNMENT - 1)?;
    Some(padded & !(ALIGNMENT - 1))
}

/// Decode the target of a relative operand encoded for `anchor`
#[inline]
fn relative_target(anchor: usize, offset: usize, displacement: i32) -> usize {
    (anchor + offset + RELATIVE_WIDTH).wrapping_add(displacement as isize as usize)
}

/// Encode `target` as a displacement for an operand at `anchor + offset`
#[inline]
fn relative_displacement(anchor: usize, offset: usize, target: usize) -> Option<i32> {
    let from = anchor + offset + RELATIVE_WIDTH;
    let delta = (target as isize).wrapping_sub(from as isize);
    i32::try_from(delta).ok()
}

/// View of a code block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBlock {
    ptr: NonNull<u8>,
}

impl CodeBlock {
    /// Wrap a client pointer
    ///
    /// # Safety
    ///
    /// `ptr` must be the client pointer of a code allocation.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<u8>) -> Self {
        Self { ptr }
    }

    /// Initialize the table of a fresh, zeroed block
    ///
    /// # Safety
    ///
    /// `client` must be a zeroed code payload with room for `refs` entries.
    pub(crate) unsafe fn init(client: *mut u8, size: usize, refs: usize) {
        let table = client.add(word_round(size)) as *mut usize;
        *table = refs;
        *table.add(1) = client as usize;
    }

    /// Client pointer, where the machine code starts
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Byte size of the machine code
    #[inline]
    pub fn size(&self) -> usize {
        // SAFETY: guaranteed by `from_raw`
        match unsafe { Header::read(self.ptr.as_ptr().sub(HEADER_SIZE)) } {
            Header::Code { size } => size,
            other => panic!("not a code block: {other:?}"),
        }
    }

    #[inline]
    fn table(&self) -> *mut usize {
        // SAFETY: the table follows the code inside the allocation
        unsafe { self.ptr.as_ptr().add(word_round(self.size())) as *mut usize }
    }

    /// Number of reference table entries
    #[inline]
    pub fn ref_count(&self) -> usize {
        // SAFETY: see `table`
        unsafe { *self.table() }
    }

    /// Address the relative operands are currently encoded against
    #[inline]
    fn anchor(&self) -> usize {
        // SAFETY: see `table`
        unsafe { *self.table().add(1) }
    }

    /// The machine code as a mutable byte slice
    ///
    /// # Safety
    ///
    /// The caller must not hold the slice across a collection point.
    pub unsafe fn code_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size())
    }

    /// Read table entry `index`
    pub fn get_ref(&self, index: usize) -> Option<CodeRef> {
        self.entry(index).map(|(code_ref, _)| code_ref)
    }

    fn entry(&self, index: usize) -> Option<(CodeRef, bool)> {
        assert!(index < self.ref_count(), "ref {index} out of bounds");
        // SAFETY: bounds checked above
        CodeRef::decode(unsafe { *self.table().add(2 + index) })
    }

    /// Whether entry `index` has had its operand written
    pub fn is_written(&self, index: usize) -> bool {
        matches!(self.entry(index), Some((_, true)))
    }

    /// Write table entry `index`
    pub fn set_ref(&self, index: usize, code_ref: CodeRef) -> GcResult<()> {
        if index >= self.ref_count() {
            return Err(GcError::HeapCorrupted(format!(
                "code ref {index} out of bounds ({} entries)",
                self.ref_count()
            )));
        }
        if code_ref.offset + code_ref.width() > self.size() {
            return Err(GcError::HeapCorrupted(format!(
                "code ref at offset {} overruns {} bytes of code",
                code_ref.offset,
                self.size()
            )));
        }
        // A new entry starts unwritten, whatever the slot held before
        // SAFETY: bounds checked above
        unsafe { *self.table().add(2 + index) = code_ref.encode() };
        Ok(())
    }

    /// Current target of entry `index`, once it has been written
    pub fn read_target(&self, index: usize) -> Option<usize> {
        let (code_ref, true) = self.entry(index)? else {
            return None;
        };
        // SAFETY: `set_ref` validated the operand lies inside the code
        unsafe { Some(read_operand(self.as_ptr(), self.anchor(), code_ref)) }
    }

    /// Point entry `index` at `target`
    pub fn write_target(&self, index: usize, target: usize) -> GcResult<()> {
        let code_ref = self.get_ref(index).ok_or_else(|| {
            GcError::HeapCorrupted(format!("code ref {index} has not been set"))
        })?;
        // Encode against the current address so the anchor stays accurate
        self.rebase();
        // SAFETY: `set_ref` validated the operand lies inside the code
        unsafe { write_operand(self.as_ptr(), self.as_ptr() as usize, code_ref, target)? };
        // SAFETY: `get_ref` checked the bounds
        unsafe { *self.table().add(2 + index) = code_ref.encode() | WRITTEN };
        Ok(())
    }

    /// Re-encode relative operands after the block was copied by someone
    /// other than the collector
    fn rebase(&self) {
        let anchor = self.anchor();
        let here = self.as_ptr() as usize;
        if anchor == here {
            return;
        }
        let mut pending = Vec::new();
        for index in 0..self.ref_count() {
            if let Some((code_ref, true)) = self.entry(index) {
                if code_ref.kind == CodeRefKind::Relative {
                    // SAFETY: entries are validated by `set_ref`
                    let target = unsafe { read_operand(self.as_ptr(), anchor, code_ref) };
                    pending.push((code_ref.offset, target));
                }
            }
        }
        // SAFETY: same entries as above
        unsafe { patch(self.as_ptr(), &pending) };
    }
}

unsafe fn read_operand(client: *mut u8, anchor: usize, code_ref: CodeRef) -> usize {
    let at = client.add(code_ref.offset);
    match code_ref.kind {
        CodeRefKind::Absolute => (at as *const usize).read_unaligned(),
        CodeRefKind::Relative => {
            relative_target(anchor, code_ref.offset, (at as *const i32).read_unaligned())
        }
    }
}

unsafe fn write_operand(client: *mut u8, anchor: usize, code_ref: CodeRef, target: usize) -> GcResult<()> {
    let at = client.add(code_ref.offset);
    match code_ref.kind {
        CodeRefKind::Absolute => (at as *mut usize).write_unaligned(target),
        CodeRefKind::Relative => {
            let displacement = relative_displacement(anchor, code_ref.offset, target).ok_or(
                GcError::RelativeOutOfRange { offset: code_ref.offset, target },
            )?;
            (at as *mut i32).write_unaligned(displacement);
        }
    }
    Ok(())
}

/// Re-encode relative operands for the block's current address and update
/// its anchor. `pending` holds `(offset, target)` pairs.
///
/// # Safety
///
/// `client` must be a code block and every offset one of its relative entries.
pub(crate) unsafe fn patch(client: *mut u8, pending: &[(usize, usize)]) {
    let here = client as usize;
    for &(offset, target) in pending {
        let displacement = relative_displacement(here, offset, target)
            .unwrap_or_else(|| panic!("relative operand at {offset} cannot reach {target:#x} from {here:#x}"));
        (client.add(offset) as *mut i32).write_unaligned(displacement);
    }
    let block = CodeBlock::from_raw(NonNull::new_unchecked(client));
    *block.table().add(1) = here;
}

/// Format of the code pool
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeFormat;

impl ObjectFormat for CodeFormat {
    fn name(&self) -> &'static str {
        "code"
    }

    unsafe fn size(&self, base: *const u8) -> usize {
        let header = Header::read(base);
        if let Some(size) = marker_size(header) {
            return size;
        }
        match header {
            Header::Code { size } => {
                let client = base.add(HEADER_SIZE);
                let refs = *(client.add(word_round(size)) as *const usize);
                align_up(HEADER_SIZE + word_round(size) + (2 + refs) * WORD + FOOTER_SIZE)
            }
            _ => panic!("typed object at {:p} in the code pool", base),
        }
    }

    unsafe fn scan(&self, base: *mut u8, fixer: &mut dyn Fixer) {
        match Header::read(base) {
            Header::Code { .. } => {}
            Header::Object { .. } => panic!("typed object at {:p} in the code pool", base),
            _ => return,
        }

        let client = base.add(HEADER_SIZE);
        let block = CodeBlock::from_raw(NonNull::new_unchecked(client));
        let anchor = block.anchor();
        // Where the block lived when its operands were last encoded
        let previous = anchor - HEADER_SIZE..anchor - HEADER_SIZE + self.size(base);
        let here = client as usize;
        let mut relative = Vec::new();

        for index in 0..block.ref_count() {
            let Some((code_ref, true)) = block.entry(index) else {
                continue;
            };
            let mut target = read_operand(client, anchor, code_ref);
            if previous.contains(&target) {
                // Points into this block, so it moves with it
                target = target.wrapping_sub(anchor).wrapping_add(here);
                match code_ref.kind {
                    CodeRefKind::Absolute => {
                        (client.add(code_ref.offset) as *mut usize).write_unaligned(target)
                    }
                    CodeRefKind::Relative => relative.push((code_ref.offset, target)),
                }
                continue;
            }
            match code_ref.kind {
                CodeRefKind::Absolute => {
                    if target != 0 {
                        fixer.fix(&mut target);
                        (client.add(code_ref.offset) as *mut usize).write_unaligned(target);
                    }
                }
                CodeRefKind::Relative => {
                    fixer.fix(&mut target);
                    relative.push((code_ref.offset, target));
                }
            }
        }

        patch(client, &relative);
    }
}
