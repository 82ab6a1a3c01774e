use std::error::Error;
use std::fmt;
use std::marker::PhantomData;

use stackshot_types::{MAX_BACKTRACE_DEPTH, NativeThreadId};

use crate::arch::{Architecture, ContextOf, NativeArch};
use crate::backtrace::{Capture, CaptureStatus, backtrace};
use crate::bounds::StackBounds;
use crate::config::CaptureOptions;
use crate::frame::{StackMemory, WORD_SIZE};
use crate::thread::{ContextError, FrozenView};

/// The calling thread viewed as a capture target. It is running, not
/// stopped, so only the part of its stack above the walker is read.
pub struct CurrentThread<A: Architecture = NativeArch> {
    id: NativeThreadId,
    bounds: StackBounds,
    context: Option<ContextOf<A>>,
    _arch: PhantomData<A>,
}

impl<A: Architecture> CurrentThread<A> {
    #[inline(always)]
    pub fn new(id: NativeThreadId, bounds: StackBounds) -> Self {
        Self {
            id,
            bounds,
            context: A::current_context(),
            _arch: PhantomData,
        }
    }
}

impl<A: Architecture> StackMemory for CurrentThread<A> {
    fn read_word(&self, address: usize) -> Option<usize> {
        if address % WORD_SIZE != 0 || !self.bounds.contains_range(address, WORD_SIZE) {
            return None;
        }
        // SAFETY: the word lies inside this thread's own mapped stack.
        Some(unsafe { std::ptr::read_volatile(address as *const usize) })
    }
}

impl<A: Architecture> FrozenView for CurrentThread<A> {
    type Arch = A;

    fn native_id(&self) -> NativeThreadId {
        self.id
    }

    fn machine_context(&self) -> Result<ContextOf<A>, ContextError> {
        self.context.ok_or(ContextError::Unavailable)
    }
}

/// Backtrace of the calling thread, starting at the caller's frame.
#[inline(never)]
pub fn capture_current_thread(
    id: NativeThreadId,
    bounds: StackBounds,
    options: CaptureOptions,
) -> (Capture, Vec<u64>) {
    let view = CurrentThread::<NativeArch>::new(id, bounds);
    let mut addresses = [0usize; MAX_BACKTRACE_DEPTH];
    let capture = backtrace(
        &view,
        id,
        &mut addresses,
        bounds,
        options.max_depth,
        options.skip,
    );
    let addresses = addresses[..capture.depth]
        .iter()
        .map(|&address| address as u64)
        .collect();
    (capture, addresses)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePointerError {
    UnsupportedArchitecture,
    InvalidBounds,
    BrokenChain(CaptureStatus),
    TooShallow { depth: usize, min_depth: usize },
}

impl fmt::Display for FramePointerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedArchitecture => write!(
                f,
                "no frame-pointer policy for {}",
                std::env::consts::ARCH
            ),
            Self::InvalidBounds => write!(f, "stack bounds of the current thread are unknown"),
            Self::BrokenChain(status) => {
                write!(f, "frame pointer chain did not reach the stack base: {status:?}")
            }
            Self::TooShallow { depth, min_depth } => write!(
                f,
                "frame pointer chain too shallow: got {depth}, need at least {min_depth}"
            ),
        }
    }
}

impl Error for FramePointerError {}

/// Checks that the calling thread's frame pointer chain is intact and at
/// least `min_depth` frames deep. Returns the depth observed.
pub fn validate_frame_pointers(
    id: NativeThreadId,
    bounds: StackBounds,
    min_depth: usize,
) -> Result<usize, FramePointerError> {
    if NativeArch::NAME == crate::arch::Unsupported::NAME {
        return Err(FramePointerError::UnsupportedArchitecture);
    }
    if !bounds.is_valid() {
        return Err(FramePointerError::InvalidBounds);
    }

    #[inline(never)]
    fn layer0(id: NativeThreadId, bounds: StackBounds) -> Capture {
        layer1(id, bounds)
    }
    #[inline(never)]
    fn layer1(id: NativeThreadId, bounds: StackBounds) -> Capture {
        layer2(id, bounds)
    }
    #[inline(never)]
    fn layer2(id: NativeThreadId, bounds: StackBounds) -> Capture {
        layer3(id, bounds)
    }
    #[inline(never)]
    fn layer3(id: NativeThreadId, bounds: StackBounds) -> Capture {
        capture_current_thread(id, bounds, CaptureOptions::default()).0
    }

    let capture = layer0(id, bounds);
    if !capture.reached_end_of_stack {
        return Err(FramePointerError::BrokenChain(capture.status));
    }
    if capture.depth < min_depth {
        return Err(FramePointerError::TooShallow {
            depth: capture.depth,
            min_depth,
        });
    }
    Ok(capture.depth)
}
