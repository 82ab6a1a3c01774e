//! Frame-pointer walk over a stopped thread.
//!
//! Runs entirely inside the suspend window: no allocation, no locks, no
//! logging. Everything the caller needs to report afterwards travels out in
//! the returned [`Capture`].

use stackshot_types::{MAX_BACKTRACE_DEPTH, NativeThreadId};

use crate::arch::Architecture;
use crate::bounds::StackBounds;
use crate::frame::{is_valid_frame, read_frame};
use crate::thread::{ContextError, FrozenView};

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// No further valid frame: the walk saw the whole stack.
    EndOfStack,
    /// `max_depth` addresses were recorded before the chain ended.
    DepthLimit,
    /// Zero depth requested, or the stack bounds are unknown.
    Degenerate,
    ContextUnavailable(ContextError),
    /// The first frame address was outside the stack or misaligned.
    InvalidStartingFrame { address: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    /// Number of addresses written to the output buffer.
    pub depth: usize,
    pub reached_end_of_stack: bool,
    pub status: CaptureStatus,
}

impl Capture {
    fn empty(status: CaptureStatus) -> Self {
        Self {
            depth: 0,
            reached_end_of_stack: false,
            status,
        }
    }
}

struct Recorder<'a> {
    addresses: &'a mut [usize],
    depth: usize,
    skip: usize,
}

impl Recorder<'_> {
    fn push(&mut self, address: usize) {
        if self.skip > 0 {
            self.skip -= 1;
        } else {
            self.addresses[self.depth] = address;
            self.depth += 1;
        }
    }
}

/// Walks the frame chain of `target` and writes return addresses into
/// `addresses`.
///
/// `max_depth` is clamped to the buffer length and to
/// [`MAX_BACKTRACE_DEPTH`]. The first `skip` otherwise recorded addresses are
/// dropped. When `target` is the calling thread the walk starts at this
/// function's own frame instead of the saved frame pointer.
#[inline(never)]
pub fn backtrace<V: FrozenView>(
    target: &V,
    calling: NativeThreadId,
    addresses: &mut [usize],
    bounds: StackBounds,
    max_depth: usize,
    skip: usize,
) -> Capture {
    let max_depth = max_depth.min(addresses.len()).min(MAX_BACKTRACE_DEPTH);
    if max_depth == 0 || !bounds.is_valid() {
        return Capture::empty(CaptureStatus::Degenerate);
    }

    let context = match target.machine_context() {
        Ok(context) => context,
        Err(err) => return Capture::empty(CaptureStatus::ContextUnavailable(err)),
    };

    let mut out = Recorder {
        addresses,
        depth: 0,
        skip,
    };

    out.push(V::Arch::previous_instruction_address(
        V::Arch::program_counter(&context),
    ));

    if out.depth < max_depth {
        if let Some(lr) = V::Arch::link_register(&context) {
            if is_valid_frame::<V::Arch>(lr, bounds) {
                out.push(V::Arch::previous_instruction_address(lr));
            }
        }
    }

    let mut current = if target.native_id() == calling {
        V::Arch::current_frame_address()
    } else {
        V::Arch::frame_pointer(&context)
    };

    // A bad base taints everything after it, so nothing is kept.
    if !is_valid_frame::<V::Arch>(current, bounds) {
        return Capture::empty(CaptureStatus::InvalidStartingFrame { address: current });
    }

    let mut reached_end_of_stack = false;
    while out.depth < max_depth {
        let Some(frame) = read_frame(target, current) else {
            reached_end_of_stack = true;
            break;
        };
        out.push(V::Arch::previous_instruction_address(frame.return_address));

        // Frames must move strictly toward the stack base; this also rules out cycles.
        if frame.next > current && is_valid_frame::<V::Arch>(frame.next, bounds) {
            current = frame.next;
        } else {
            reached_end_of_stack = true;
            break;
        }
    }

    Capture {
        depth: out.depth,
        reached_end_of_stack,
        status: if reached_end_of_stack {
            CaptureStatus::EndOfStack
        } else {
            CaptureStatus::DepthLimit
        },
    }
}
