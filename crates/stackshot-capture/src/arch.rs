//! Per-architecture register access.
//!
//! The walker in [`crate::backtrace`] never names a register directly; it asks
//! an [`Architecture`] for the program counter, frame pointer and (where one
//! exists) link register of a captured context.
//!
//! Every architecture here uses the same frame record layout: the frame
//! pointer addresses a pair of words, the caller's frame pointer first and the
//! return address right after it, and frames grow toward higher addresses as
//! the walk moves from callee to caller.

use std::fmt;

pub trait Architecture {
    /// Register snapshot taken when the thread was stopped.
    type Context: Copy + fmt::Debug;

    const NAME: &'static str;

    /// Required alignment of a frame record address.
    const FRAME_ALIGNMENT: usize = std::mem::size_of::<usize>();

    fn program_counter(context: &Self::Context) -> usize;

    fn frame_pointer(context: &Self::Context) -> usize;

    /// `None` on architectures without a dedicated link register.
    fn link_register(context: &Self::Context) -> Option<usize>;

    /// Maps a return address back into the call instruction that produced it.
    fn previous_instruction_address(address: usize) -> usize {
        address.wrapping_sub(1)
    }

    /// Frame address of the function that calls this, on the calling thread.
    fn current_frame_address() -> usize;

    /// Registers of the calling thread, or `None` when this architecture is
    /// not the one the code is running on.
    fn current_context() -> Option<Self::Context>;
}

pub type ContextOf<A> = <A as Architecture>::Context;

#[derive(Debug, Clone, Copy)]
pub struct X86_64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86_64Context {
    pub rip: usize,
    pub rsp: usize,
    pub rbp: usize,
}

impl Architecture for X86_64 {
    type Context = X86_64Context;

    const NAME: &'static str = "x86_64";

    fn program_counter(context: &Self::Context) -> usize {
        context.rip
    }

    fn frame_pointer(context: &Self::Context) -> usize {
        context.rbp
    }

    fn link_register(_context: &Self::Context) -> Option<usize> {
        None
    }

    #[inline(always)]
    fn current_frame_address() -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            let frame_ptr: usize;
            unsafe {
                core::arch::asm!(
                    "mov {}, rbp",
                    out(reg) frame_ptr,
                    options(nomem, nostack, preserves_flags)
                );
            }
            frame_ptr
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            0
        }
    }

    #[inline(always)]
    fn current_context() -> Option<Self::Context> {
        #[cfg(target_arch = "x86_64")]
        {
            let (rip, rsp, rbp): (usize, usize, usize);
            unsafe {
                core::arch::asm!(
                    "lea {0}, [rip]",
                    "mov {1}, rsp",
                    "mov {2}, rbp",
                    out(reg) rip,
                    out(reg) rsp,
                    out(reg) rbp,
                    options(nomem, nostack, preserves_flags)
                );
            }
            Some(X86_64Context { rip, rsp, rbp })
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Aarch64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aarch64Context {
    pub pc: usize,
    pub sp: usize,
    /// x29
    pub fp: usize,
    /// x30
    pub lr: usize,
}

impl Architecture for Aarch64 {
    type Context = Aarch64Context;

    const NAME: &'static str = "aarch64";

    fn program_counter(context: &Self::Context) -> usize {
        context.pc
    }

    fn frame_pointer(context: &Self::Context) -> usize {
        context.fp
    }

    fn link_register(context: &Self::Context) -> Option<usize> {
        Some(context.lr)
    }

    // Instructions are 4-byte aligned; drop the low bits before stepping back.
    fn previous_instruction_address(address: usize) -> usize {
        (address & !0b11).wrapping_sub(1)
    }

    #[inline(always)]
    fn current_frame_address() -> usize {
        #[cfg(target_arch = "aarch64")]
        {
            let frame_ptr: usize;
            unsafe {
                core::arch::asm!(
                    "mov {}, x29",
                    out(reg) frame_ptr,
                    options(nomem, nostack, preserves_flags)
                );
            }
            frame_ptr
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            0
        }
    }

    #[inline(always)]
    fn current_context() -> Option<Self::Context> {
        #[cfg(target_arch = "aarch64")]
        {
            let (pc, sp, fp, lr): (usize, usize, usize, usize);
            unsafe {
                core::arch::asm!(
                    "adr {0}, .",
                    "mov {1}, sp",
                    "mov {2}, x29",
                    "mov {3}, x30",
                    out(reg) pc,
                    out(reg) sp,
                    out(reg) fp,
                    out(reg) lr,
                    options(nomem, nostack, preserves_flags)
                );
            }
            Some(Aarch64Context { pc, sp, fp, lr })
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            None
        }
    }
}

/// Placeholder for targets without a frame-pointer policy. Every capture on
/// such a target is degenerate.
#[derive(Debug, Clone, Copy)]
pub struct Unsupported;

impl Architecture for Unsupported {
    type Context = ();

    const NAME: &'static str = "unsupported";

    fn program_counter(_context: &Self::Context) -> usize {
        0
    }

    fn frame_pointer(_context: &Self::Context) -> usize {
        0
    }

    fn link_register(_context: &Self::Context) -> Option<usize> {
        None
    }

    fn current_frame_address() -> usize {
        0
    }

    fn current_context() -> Option<Self::Context> {
        None
    }
}

#[cfg(target_arch = "x86_64")]
pub type NativeArch = X86_64;

#[cfg(target_arch = "aarch64")]
pub type NativeArch = Aarch64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type NativeArch = Unsupported;
