//! Frame-pointer stack capture for every thread of the running process.
//!
//! The platform supplies threads through [`ThreadSource`] and [`ThreadHandle`];
//! [`enumerate_backtraces_for_all_threads`] stops each one in turn, walks its
//! frame chain with [`backtrace`], and hands complete stacks to a callback.
//! Anything that may allocate or lock happens before a thread is frozen or
//! after it is resumed; the frozen window only reads registers and stack words.

pub(crate) mod arch;
pub(crate) mod backtrace;
pub(crate) mod bounds;
pub(crate) mod config;
pub(crate) mod current;
pub(crate) mod enumerate;
pub(crate) mod frame;
pub(crate) mod metadata;
pub(crate) mod thread;

#[cfg(test)]
pub(crate) mod testing;

pub use self::arch::{
    Aarch64, Aarch64Context, Architecture, ContextOf, NativeArch, Unsupported, X86_64,
    X86_64Context,
};
pub use self::backtrace::{Capture, CaptureStatus, backtrace};
pub use self::bounds::StackBounds;
pub use self::config::*;
pub use self::current::{
    CurrentThread, FramePointerError, capture_current_thread, validate_frame_pointers,
};
pub use self::enumerate::{PassSummary, enumerate_backtraces_for_all_threads};
pub use self::frame::{FrameRecord, StackMemory, WORD_SIZE, is_aligned, is_valid_frame, read_frame};
pub use self::metadata::{MetadataResolver, ThreadMetadataCache};
pub use self::thread::{
    ContextError, FrozenThread, FrozenView, PreparedSample, SuspendError, ThreadHandle,
    ThreadList, ThreadSource,
};

pub use stackshot_types::{Backtrace, MAX_BACKTRACE_DEPTH, NativeThreadId, ThreadMetadata};
