use std::error::Error;
use std::fmt;

use stackshot_types::{Backtrace, InvariantError, NativeThreadId, ThreadMetadata};

use crate::arch::{Architecture, ContextOf};
use crate::bounds::StackBounds;
use crate::frame::{StackMemory, WORD_SIZE};
use crate::metadata::{MetadataResolver, ThreadMetadataCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendError {
    /// The thread exited before it could be stopped.
    ThreadExited,
    /// The thread did not stop within the configured timeout.
    Timeout,
    /// Another suspension is still in progress.
    Busy,
    /// The platform suspension mechanism has not been set up.
    NotInstalled,
    Os(i32),
}

impl fmt::Display for SuspendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThreadExited => write!(f, "thread exited before it could be suspended"),
            Self::Timeout => write!(f, "thread did not stop before the suspend timeout"),
            Self::Busy => write!(f, "another thread is still suspended"),
            Self::NotInstalled => write!(f, "thread suspension is not installed"),
            Self::Os(errno) => write!(f, "suspend failed with os error {errno}"),
        }
    }
}

impl Error for SuspendError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// The register snapshot could not be read.
    Unavailable,
    /// The thread is not stopped, so its registers are meaningless.
    NotSuspended,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "machine context unavailable"),
            Self::NotSuspended => write!(f, "machine context requested for a running thread"),
        }
    }
}

impl Error for ContextError {}

/// One OS thread, as seen by the sampler.
///
/// `stack_bounds` and everything reachable from metadata resolution may
/// allocate or take locks, so they are only ever called before `suspend`.
/// `suspend`, `resume`, `machine_context` and `read_stack_word` are driven
/// through [`FrozenThread`], which pairs every successful suspend with
/// exactly one resume.
pub trait ThreadHandle {
    type Arch: Architecture;

    fn native_id(&self) -> NativeThreadId;

    /// Parked threads with nothing worth sampling.
    fn is_idle(&self) -> bool;

    /// [`StackBounds::INVALID`] when the stack range is unknown.
    fn stack_bounds(&self) -> StackBounds;

    fn suspend(&mut self) -> Result<(), SuspendError>;

    fn resume(&mut self);

    fn machine_context(&self) -> Result<ContextOf<Self::Arch>, ContextError>;

    /// # Safety
    ///
    /// The thread must be suspended and `address` must be word-aligned with
    /// the whole word inside the bounds this thread reported.
    unsafe fn read_stack_word(&self, address: usize) -> usize;
}

/// Threads of the current process, minus the one asking.
pub struct ThreadList<T> {
    pub threads: Vec<T>,
    pub current: NativeThreadId,
}

/// Platform facility for enumerating threads and reading the clock.
pub trait ThreadSource {
    type Thread: ThreadHandle;

    fn all_excluding_current(&self) -> ThreadList<Self::Thread>;

    /// Monotonic nanoseconds.
    fn absolute_time(&self) -> u64;
}

/// What a capture may touch while its target is stopped: the register
/// snapshot and bounds-checked stack words, nothing else.
pub trait FrozenView: StackMemory {
    type Arch: Architecture;

    fn native_id(&self) -> NativeThreadId;

    fn machine_context(&self) -> Result<ContextOf<Self::Arch>, ContextError>;
}

/// Everything about a thread that has to be known before it is stopped.
#[derive(Debug, Clone)]
pub struct PreparedSample {
    thread: NativeThreadId,
    metadata: ThreadMetadata,
    bounds: StackBounds,
    timestamp: u64,
}

impl PreparedSample {
    /// Resolves metadata, stack bounds and the timestamp, in that order.
    /// `None` when the thread's metadata does not resolve.
    pub fn gather<S, R>(
        source: &S,
        thread: &S::Thread,
        cache: &mut ThreadMetadataCache<R>,
    ) -> Option<Self>
    where
        S: ThreadSource,
        R: MetadataResolver,
    {
        let metadata = cache.metadata_for_thread(thread);
        if !metadata.is_resolved() {
            return None;
        }
        let bounds = thread.stack_bounds();
        let timestamp = source.absolute_time();
        Some(Self {
            thread: thread.native_id(),
            metadata,
            bounds,
            timestamp,
        })
    }

    pub fn thread(&self) -> NativeThreadId {
        self.thread
    }

    pub fn metadata(&self) -> &ThreadMetadata {
        &self.metadata
    }

    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn into_backtrace(self, addresses: &[usize]) -> Result<Backtrace, InvariantError> {
        Backtrace::new(
            self.metadata,
            self.timestamp,
            addresses.iter().map(|&address| address as u64).collect(),
        )
    }
}

/// A suspended thread. Resumes it on drop.
///
/// Holds the handle exclusively, so nothing else about the thread can be
/// queried while it is stopped.
pub struct FrozenThread<'a, T: ThreadHandle> {
    thread: &'a mut T,
    bounds: StackBounds,
}

impl<'a, T: ThreadHandle> FrozenThread<'a, T> {
    pub fn freeze(thread: &'a mut T, prepared: &PreparedSample) -> Result<Self, SuspendError> {
        debug_assert_eq!(thread.native_id(), prepared.thread);
        thread.suspend()?;
        Ok(Self {
            thread,
            bounds: prepared.bounds,
        })
    }

    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }
}

impl<T: ThreadHandle> StackMemory for FrozenThread<'_, T> {
    fn read_word(&self, address: usize) -> Option<usize> {
        if address % WORD_SIZE != 0 || !self.bounds.contains_range(address, WORD_SIZE) {
            return None;
        }
        // SAFETY: the thread is suspended for as long as `self` lives, and the
        // word is aligned and inside the bounds the thread reported.
        Some(unsafe { self.thread.read_stack_word(address) })
    }
}

impl<T: ThreadHandle> FrozenView for FrozenThread<'_, T> {
    type Arch = T::Arch;

    fn native_id(&self) -> NativeThreadId {
        self.thread.native_id()
    }

    fn machine_context(&self) -> Result<ContextOf<Self::Arch>, ContextError> {
        self.thread.machine_context()
    }
}

impl<T: ThreadHandle> Drop for FrozenThread<'_, T> {
    fn drop(&mut self) {
        self.thread.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, EventLog, FakeSource, FakeThread, resolver};

    #[test]
    fn gather_resolves_metadata_then_bounds_then_time() {
        let log = EventLog::default();
        let source = FakeSource::new(&log, vec![FakeThread::walkable(&log, 11)]);
        let mut cache = ThreadMetadataCache::new(resolver(&log));
        let thread = source.template(0);

        let prepared = PreparedSample::gather(&source, &thread, &mut cache).unwrap();

        assert_eq!(prepared.thread(), NativeThreadId::from_raw(11));
        assert_eq!(prepared.metadata().thread_id, 11);
        assert!(prepared.bounds().is_valid());
        assert_eq!(
            log.events(),
            vec![Event::Resolve(11), Event::Bounds(11), Event::Clock]
        );
    }

    #[test]
    fn gather_skips_unresolved_threads_before_touching_bounds() {
        let log = EventLog::default();
        let source = FakeSource::new(&log, vec![FakeThread::walkable(&log, 0)]);
        let mut cache = ThreadMetadataCache::new(resolver(&log));
        let thread = source.template(0);

        assert!(PreparedSample::gather(&source, &thread, &mut cache).is_none());
        assert_eq!(log.events(), vec![Event::Resolve(0)]);
    }

    #[test]
    fn frozen_thread_resumes_exactly_once_on_drop() {
        let log = EventLog::default();
        let source = FakeSource::new(&log, vec![FakeThread::walkable(&log, 5)]);
        let mut cache = ThreadMetadataCache::new(resolver(&log));
        let mut thread = source.template(0);
        let prepared = PreparedSample::gather(&source, &thread, &mut cache).unwrap();
        log.clear();

        {
            let frozen = FrozenThread::freeze(&mut thread, &prepared).unwrap();
            assert_eq!(frozen.native_id(), NativeThreadId::from_raw(5));
        }

        assert_eq!(log.events(), vec![Event::Suspend(5), Event::Resume(5)]);
    }

    #[test]
    fn failed_freeze_never_resumes() {
        let log = EventLog::default();
        let source = FakeSource::new(&log, vec![FakeThread::walkable(&log, 5).exited()]);
        let mut cache = ThreadMetadataCache::new(resolver(&log));
        let mut thread = source.template(0);
        let prepared = PreparedSample::gather(&source, &thread, &mut cache).unwrap();
        log.clear();

        let err = FrozenThread::freeze(&mut thread, &prepared).err();

        assert_eq!(err, Some(SuspendError::ThreadExited));
        assert_eq!(log.events(), vec![Event::Suspend(5)]);
    }

    #[test]
    fn frozen_reads_are_confined_to_the_prepared_bounds() {
        let log = EventLog::default();
        let source = FakeSource::new(&log, vec![FakeThread::walkable(&log, 5)]);
        let mut cache = ThreadMetadataCache::new(resolver(&log));
        let mut thread = source.template(0);
        let prepared = PreparedSample::gather(&source, &thread, &mut cache).unwrap();
        let bounds = prepared.bounds();

        let frozen = FrozenThread::freeze(&mut thread, &prepared).unwrap();
        assert!(frozen.read_word(bounds.low()).is_some());
        assert_eq!(frozen.read_word(bounds.high()), None);
        assert_eq!(frozen.read_word(bounds.low() + 1), None);
        assert_eq!(frozen.read_word(bounds.low() - WORD_SIZE), None);
    }
}
