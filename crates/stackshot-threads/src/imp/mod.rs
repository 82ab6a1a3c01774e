use std::sync::atomic::Ordering;
use std::time::Duration;

use stackshot_capture::{
    Backtrace, ContextError, ContextOf, MetadataResolver, NativeArch, NativeThreadId,
    PassSummary, SamplerConfig, StackBounds, SuspendError, ThreadHandle, ThreadList,
    ThreadMetadata, ThreadMetadataCache, ThreadSource, enumerate_backtraces_for_all_threads,
};

pub(crate) mod procfs;
pub(crate) mod registry;
pub(crate) mod signal;

use self::registry::ThreadEntry;
use crate::InstallError;

pub(crate) fn install_sampler() -> Result<(), InstallError> {
    signal::install_sigprof_handler()
}

pub(crate) fn current_thread_id() -> NativeThreadId {
    NativeThreadId::from_raw(registry::gettid() as u64)
}

/// A registered thread of this process.
pub struct LinuxThread {
    entry: ThreadEntry,
    suspend_timeout: Duration,
    suspended: bool,
}

impl LinuxThread {
    pub fn name(&self) -> &str {
        &self.entry.name
    }
}

impl ThreadHandle for LinuxThread {
    type Arch = NativeArch;

    fn native_id(&self) -> NativeThreadId {
        NativeThreadId::from_raw(self.entry.tid as u64)
    }

    fn is_idle(&self) -> bool {
        self.entry.idle.load(Ordering::Relaxed)
    }

    fn stack_bounds(&self) -> StackBounds {
        if procfs::task_exists(self.entry.tid) {
            self.entry.stack
        } else {
            StackBounds::INVALID
        }
    }

    fn suspend(&mut self) -> Result<(), SuspendError> {
        signal::suspend(self.entry.pthread_id, self.entry.tid, self.suspend_timeout)?;
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) {
        if std::mem::take(&mut self.suspended) {
            signal::resume();
        }
    }

    fn machine_context(&self) -> Result<ContextOf<NativeArch>, ContextError> {
        if !self.suspended {
            return Err(ContextError::NotSuspended);
        }
        signal::parked_context()
    }

    unsafe fn read_stack_word(&self, address: usize) -> usize {
        // SAFETY: the caller guarantees the target is parked and the word is
        // inside the stack it registered.
        unsafe { std::ptr::read_volatile(address as *const usize) }
    }
}

/// Registered threads that are still alive, as a [`ThreadSource`].
#[derive(Debug, Clone, Copy)]
pub struct LinuxThreads {
    suspend_timeout: Duration,
}

impl LinuxThreads {
    pub fn new(suspend_timeout: Duration) -> Self {
        Self { suspend_timeout }
    }
}

impl ThreadSource for LinuxThreads {
    type Thread = LinuxThread;

    fn all_excluding_current(&self) -> ThreadList<LinuxThread> {
        let me = registry::gettid();
        let live = procfs::task_ids();
        let threads = registry::snapshot()
            .into_iter()
            .filter(|entry| entry.tid != me && live.binary_search(&entry.tid).is_ok())
            .map(|entry| LinuxThread {
                entry,
                suspend_timeout: self.suspend_timeout,
                suspended: false,
            })
            .collect();
        ThreadList {
            threads,
            current: NativeThreadId::from_raw(me as u64),
        }
    }

    fn absolute_time(&self) -> u64 {
        monotonic_nanos()
    }
}

pub(crate) fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Thread identity from the registry and procfs.
///
/// The registered name wins over `comm`, which the kernel truncates to 15
/// bytes. Threads that have exited resolve to [`ThreadMetadata::unresolved`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMetadataResolver;

impl MetadataResolver for ProcMetadataResolver {
    fn resolve(&self, thread: NativeThreadId) -> ThreadMetadata {
        let Ok(tid) = libc::pid_t::try_from(thread.get()) else {
            return ThreadMetadata::unresolved();
        };
        if tid <= 0 {
            return ThreadMetadata::unresolved();
        }
        let Some(priority) = procfs::task_priority(tid) else {
            return ThreadMetadata::unresolved();
        };
        let name = registry::registered_name(tid)
            .or_else(|| procfs::task_name(tid))
            .unwrap_or_default();
        ThreadMetadata::new(thread.get(), name, priority)
    }
}

pub(crate) fn sample_all_threads<R, F>(
    config: &SamplerConfig,
    cache: &mut ThreadMetadataCache<R>,
    callback: F,
) -> PassSummary
where
    R: MetadataResolver,
    F: FnMut(Backtrace),
{
    let source = LinuxThreads::new(config.suspend_timeout);
    enumerate_backtraces_for_all_threads(&source, cache, config.capture, callback)
}

pub(crate) use self::registry::{
    current_stack_bounds, deregister_thread, register_thread, set_current_thread_idle,
};
