//! Suspend/resume by parking the target inside a `SIGPROF` handler.
//!
//! The sampler publishes the target in [`SLOT`] and signals it with `tgkill`.
//! The handler copies the interrupted registers out of its `ucontext`, marks
//! the slot parked and spins until the sampler releases it. Only one thread
//! is ever parked at a time. The handler touches nothing but atomics.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use stackshot_capture::{ContextError, ContextOf, NativeArch, SuspendError};

use crate::InstallError;

const IDLE: u8 = 0;
const REQUESTED: u8 = 1;
const CAPTURING: u8 = 2;
const PARKED: u8 = 3;
const RELEASED: u8 = 4;

struct SuspendSlot {
    state: AtomicU8,
    target: AtomicUsize,
    context_valid: AtomicBool,
    pc: AtomicUsize,
    sp: AtomicUsize,
    fp: AtomicUsize,
    lr: AtomicUsize,
}

static SLOT: SuspendSlot = SuspendSlot {
    state: AtomicU8::new(IDLE),
    target: AtomicUsize::new(0),
    context_valid: AtomicBool::new(false),
    pc: AtomicUsize::new(0),
    sp: AtomicUsize::new(0),
    fp: AtomicUsize::new(0),
    lr: AtomicUsize::new(0),
};

static INSTALLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn install_sigprof_handler() -> Result<(), InstallError> {
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let rc = unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigprof_handler as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGPROF, &sa, std::ptr::null_mut())
    };
    if rc != 0 {
        return Err(InstallError::Sigaction(last_errno()));
    }

    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

extern "C" fn sigprof_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let self_id = unsafe { libc::pthread_self() } as usize;

    if SLOT.target.load(Ordering::Acquire) == self_id
        && SLOT
            .state
            .compare_exchange(REQUESTED, CAPTURING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        let valid = unsafe { store_registers(ucontext) };
        SLOT.context_valid.store(valid, Ordering::Relaxed);
        SLOT.state.store(PARKED, Ordering::Release);

        while SLOT.state.load(Ordering::Acquire) != RELEASED {
            std::hint::spin_loop();
            unsafe { libc::sched_yield() };
        }
        SLOT.state.store(IDLE, Ordering::Release);
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

#[cfg(target_arch = "x86_64")]
unsafe fn store_registers(ucontext: *mut libc::c_void) -> bool {
    let uc = ucontext as *const libc::ucontext_t;
    if uc.is_null() {
        return false;
    }
    let gregs = unsafe { &(*uc).uc_mcontext.gregs };
    SLOT.pc
        .store(gregs[libc::REG_RIP as usize] as usize, Ordering::Relaxed);
    SLOT.sp
        .store(gregs[libc::REG_RSP as usize] as usize, Ordering::Relaxed);
    SLOT.fp
        .store(gregs[libc::REG_RBP as usize] as usize, Ordering::Relaxed);
    SLOT.lr.store(0, Ordering::Relaxed);
    true
}

#[cfg(target_arch = "aarch64")]
unsafe fn store_registers(ucontext: *mut libc::c_void) -> bool {
    let uc = ucontext as *const libc::ucontext_t;
    if uc.is_null() {
        return false;
    }
    let mcontext = unsafe { &(*uc).uc_mcontext };
    SLOT.pc.store(mcontext.pc as usize, Ordering::Relaxed);
    SLOT.sp.store(mcontext.sp as usize, Ordering::Relaxed);
    SLOT.fp.store(mcontext.regs[29] as usize, Ordering::Relaxed);
    SLOT.lr.store(mcontext.regs[30] as usize, Ordering::Relaxed);
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn store_registers(_ucontext: *mut libc::c_void) -> bool {
    false
}

/// Stops `pthread_id` (kernel id `tid`) and waits until it is parked.
pub(crate) fn suspend(
    pthread_id: libc::pthread_t,
    tid: libc::pid_t,
    timeout: Duration,
) -> Result<(), SuspendError> {
    if !INSTALLED.load(Ordering::Acquire) {
        return Err(SuspendError::NotInstalled);
    }

    if SLOT
        .state
        .compare_exchange(IDLE, REQUESTED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(SuspendError::Busy);
    }
    // The target is zero whenever the slot is idle, so a late signal from an
    // abandoned request can never match.
    SLOT.target.store(pthread_id as usize, Ordering::Release);

    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, libc::SIGPROF) };
    if rc != 0 {
        let errno = last_errno();
        SLOT.target.store(0, Ordering::Release);
        SLOT.state.store(IDLE, Ordering::Release);
        return Err(if errno == libc::ESRCH {
            SuspendError::ThreadExited
        } else {
            SuspendError::Os(errno)
        });
    }

    let deadline = Instant::now() + timeout;
    loop {
        match SLOT.state.load(Ordering::Acquire) {
            PARKED => return Ok(()),
            // Withdraw the request unless the handler has already claimed it,
            // in which case it is about to park and we keep waiting.
            REQUESTED if Instant::now() >= deadline => {
                SLOT.target.store(0, Ordering::Release);
                if SLOT
                    .state
                    .compare_exchange(REQUESTED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Err(SuspendError::Timeout);
                }
            }
            _ => {}
        }
        std::thread::yield_now();
    }
}

/// Releases the parked thread and waits for it to leave the handler.
pub(crate) fn resume() {
    if SLOT
        .state
        .compare_exchange(PARKED, RELEASED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    while SLOT.state.load(Ordering::Acquire) == RELEASED {
        std::thread::yield_now();
    }
    SLOT.target.store(0, Ordering::Release);
}

pub(crate) fn parked_context() -> Result<ContextOf<NativeArch>, ContextError> {
    if SLOT.state.load(Ordering::Acquire) != PARKED {
        return Err(ContextError::NotSuspended);
    }
    if !SLOT.context_valid.load(Ordering::Relaxed) {
        return Err(ContextError::Unavailable);
    }
    Ok(native_context(
        SLOT.pc.load(Ordering::Relaxed),
        SLOT.sp.load(Ordering::Relaxed),
        SLOT.fp.load(Ordering::Relaxed),
        SLOT.lr.load(Ordering::Relaxed),
    ))
}

#[cfg(target_arch = "x86_64")]
fn native_context(pc: usize, sp: usize, fp: usize, _lr: usize) -> ContextOf<NativeArch> {
    stackshot_capture::X86_64Context {
        rip: pc,
        rsp: sp,
        rbp: fp,
    }
}

#[cfg(target_arch = "aarch64")]
fn native_context(pc: usize, sp: usize, fp: usize, lr: usize) -> ContextOf<NativeArch> {
    stackshot_capture::Aarch64Context { pc, sp, fp, lr }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn native_context(_pc: usize, _sp: usize, _fp: usize, _lr: usize) -> ContextOf<NativeArch> {}
