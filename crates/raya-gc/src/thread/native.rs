//! Native stack bounds
//!
//! Stacks grow down on every supported platform: the live part of a
//! thread's stack is `[current stack pointer, stack top)`.

/// Approximate stack pointer of the caller
#[inline(never)]
pub fn approximate_sp() -> usize {
    let marker = 0usize;
    std::hint::black_box(&marker) as *const usize as usize
}

/// Run `f` with the callee-saved registers spilled to the stack
///
/// `f` receives a stack pointer below the spill area, so a conservative scan
/// of `[sp, top)` started while `f` runs also sees references that only live
/// in registers.
#[inline(never)]
pub fn with_registers_spilled<R>(f: impl FnOnce(usize) -> R) -> R {
    let mut registers = [0usize; 12];
    spill(&mut registers);
    let result = f(approximate_sp());
    std::hint::black_box(&registers);
    result
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn spill(registers: &mut [usize; 12]) {
    // SAFETY: stores six registers into the caller's array
    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn spill(registers: &mut [usize; 12]) {
    // SAFETY: stores eleven registers into the caller's array
    unsafe {
        std::arch::asm!(
            "stp x19, x20, [{0}]",
            "stp x21, x22, [{0}, #16]",
            "stp x23, x24, [{0}, #32]",
            "stp x25, x26, [{0}, #48]",
            "stp x27, x28, [{0}, #64]",
            "str x29, [{0}, #80]",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
}

// Elsewhere the calls leading here are relied on to have saved live registers
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn spill(_registers: &mut [usize; 12]) {}

/// Highest address of the calling thread's stack
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn stack_top() -> usize {
    // SAFETY: querying the attributes of the calling thread
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return fallback_top();
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let status = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if status != 0 || addr.is_null() {
            return fallback_top();
        }
        addr as usize + size
    }
}

/// Highest address of the calling thread's stack
#[cfg(target_os = "macos")]
pub fn stack_top() -> usize {
    // SAFETY: querying the calling thread
    unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) as usize }
}

/// Highest address of the calling thread's stack
///
/// Without a platform query the frame of the caller is the best bound
/// available; frames above it are not scanned.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
pub fn stack_top() -> usize {
    fallback_top()
}

#[allow(dead_code)]
fn fallback_top() -> usize {
    tracing::warn!("native stack bounds unavailable, scanning from the attach frame only");
    approximate_sp()
}
