//! Whole-process stack sampling on Linux.
//!
//! Threads opt in with [`register_thread`] (or [`register_thread_guard`]).
//! After [`install_sampler`] has run, [`sample_all_threads`] parks each
//! registered thread in turn inside a `SIGPROF` handler, walks its frame
//! pointers, releases it, and hands complete backtraces to a callback.
//!
//! On other platforms every function is a no-op and sampling yields nothing.

use std::error::Error;
use std::fmt;

use stackshot_capture::{
    Backtrace, Capture, CaptureOptions, FramePointerError, MetadataResolver, NativeThreadId,
    PassSummary, SamplerConfig, StackBounds, ThreadMetadataCache,
};
use tracing::{debug, warn};

pub use stackshot_capture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallError {
    Sigaction(i32),
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sigaction(errno) => write!(f, "sigaction(SIGPROF) failed: errno {errno}"),
        }
    }
}

impl Error for InstallError {}

/// RAII guard that deregisters the thread on drop.
pub struct ThreadGuard(());

impl ThreadGuard {
    /// Marks the owning thread idle (skipped by the sampler) or busy.
    pub fn set_idle(&self, idle: bool) {
        set_current_thread_idle(idle);
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        deregister_thread();
    }
}

// ── No-op backend ────────────────────────────────────────────────

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct ProcMetadataResolver;

    impl MetadataResolver for ProcMetadataResolver {
        fn resolve(&self, _thread: NativeThreadId) -> stackshot_capture::ThreadMetadata {
            stackshot_capture::ThreadMetadata::unresolved()
        }
    }

    #[inline(always)]
    pub fn install_sampler() -> Result<(), InstallError> {
        Ok(())
    }

    #[inline(always)]
    pub fn register_thread(_name: &str) {}

    #[inline(always)]
    pub fn deregister_thread() {}

    #[inline(always)]
    pub fn set_current_thread_idle(_idle: bool) {}

    #[inline(always)]
    pub fn current_thread_id() -> NativeThreadId {
        NativeThreadId::from_raw(0)
    }

    #[inline(always)]
    pub fn current_stack_bounds() -> StackBounds {
        StackBounds::INVALID
    }

    #[inline(always)]
    pub fn sample_all_threads<R, F>(
        _config: &SamplerConfig,
        _cache: &mut ThreadMetadataCache<R>,
        _callback: F,
    ) -> PassSummary
    where
        R: MetadataResolver,
        F: FnMut(Backtrace),
    {
        PassSummary::default()
    }
}

// ── Linux backend ────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod imp;

#[cfg(target_os = "linux")]
pub use imp::{LinuxThread, LinuxThreads};

pub use imp::ProcMetadataResolver;

// ── Public API (delegates to imp) ────────────────────────────────

/// Install the `SIGPROF` handler that parks threads for sampling. Idempotent.
pub fn install_sampler() -> Result<(), InstallError> {
    match imp::install_sampler() {
        Ok(()) => {
            debug!("stack sampler installed");
            Ok(())
        }
        Err(err) => {
            warn!(%err, "failed to install stack sampler");
            Err(err)
        }
    }
}

/// Register the calling thread for sampling under `name`.
pub fn register_thread(name: &str) {
    imp::register_thread(name);
}

/// Deregister the calling thread.
pub fn deregister_thread() {
    imp::deregister_thread();
}

/// Register the calling thread and return a guard that deregisters on drop.
pub fn register_thread_guard(name: &str) -> ThreadGuard {
    imp::register_thread(name);
    ThreadGuard(())
}

/// Idle threads are skipped without being suspended.
pub fn set_current_thread_idle(idle: bool) {
    imp::set_current_thread_idle(idle);
}

/// Kernel id of the calling thread.
pub fn current_thread_id() -> NativeThreadId {
    imp::current_thread_id()
}

pub fn current_stack_bounds() -> StackBounds {
    imp::current_stack_bounds()
}

/// Backtrace of the calling thread without suspending anything.
#[inline(never)]
pub fn capture_current_thread(options: CaptureOptions) -> (Capture, Vec<u64>) {
    stackshot_capture::capture_current_thread(current_thread_id(), current_stack_bounds(), options)
}

/// Checks that this binary keeps frame pointers, by walking the caller's own stack.
pub fn validate_frame_pointers(min_depth: usize) -> Result<usize, FramePointerError> {
    stackshot_capture::validate_frame_pointers(
        current_thread_id(),
        current_stack_bounds(),
        min_depth,
    )
}

/// A metadata cache backed by [`ProcMetadataResolver`], configured from `config`.
pub fn metadata_cache(config: &SamplerConfig) -> ThreadMetadataCache<ProcMetadataResolver> {
    ThreadMetadataCache::from_config(ProcMetadataResolver, config)
}

/// One sampling pass over every registered thread except the caller.
pub fn sample_all_threads<R, F>(
    config: &SamplerConfig,
    cache: &mut ThreadMetadataCache<R>,
    callback: F,
) -> PassSummary
where
    R: MetadataResolver,
    F: FnMut(Backtrace),
{
    imp::sample_all_threads(config, cache, callback)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use stackshot_capture::{ThreadHandle, ThreadSource};
    use std::sync::mpsc;

    fn spawn_registered(name: &'static str) -> (mpsc::Sender<()>, std::thread::JoinHandle<NativeThreadId>) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _guard = register_thread_guard(name);
                ready_tx.send(()).unwrap();
                let _ = stop_rx.recv();
                current_thread_id()
            })
            .unwrap();
        ready_rx.recv().unwrap();
        (stop_tx, handle)
    }

    #[test]
    fn current_thread_id_is_the_kernel_tid() {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u64;
        assert_eq!(current_thread_id().get(), tid);
    }

    #[test]
    fn current_stack_bounds_contain_a_local() {
        let local = 0u8;
        let bounds = current_stack_bounds();
        assert!(bounds.is_valid());
        assert!(bounds.contains(&local as *const u8 as usize));
    }

    #[test]
    fn frame_pointer_check_has_usable_bounds() {
        let result = validate_frame_pointers(1);
        assert!(!matches!(result, Err(FramePointerError::InvalidBounds)));
    }

    #[test]
    fn registered_threads_are_enumerated_until_their_guard_drops() {
        let (stop, handle) = spawn_registered("enum-probe");
        let source = LinuxThreads::new(std::time::Duration::from_millis(100));

        let list = source.all_excluding_current();
        assert_eq!(list.current, current_thread_id());
        let names: Vec<String> = list.threads.iter().map(|t| t.name().to_string()).collect();
        assert!(names.iter().any(|n| n == "enum-probe"));
        assert!(list.threads.iter().all(|t| t.native_id() != current_thread_id()));

        stop.send(()).unwrap();
        let id = handle.join().unwrap();
        let list = source.all_excluding_current();
        assert!(list.threads.iter().all(|t| t.native_id() != id));
    }

    #[test]
    fn idle_flag_follows_the_owning_thread() {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<NativeThreadId>();
        let handle = std::thread::spawn(move || {
            let guard = register_thread_guard("idle-probe");
            guard.set_idle(true);
            ready_tx.send(current_thread_id()).unwrap();
            let _ = stop_rx.recv();
        });
        let id = ready_rx.recv().unwrap();

        let source = LinuxThreads::new(std::time::Duration::from_millis(100));
        let list = source.all_excluding_current();
        let probe = list.threads.iter().find(|t| t.native_id() == id).unwrap();
        assert!(probe.is_idle());

        stop_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn resolver_prefers_the_registered_name() {
        let (stop, handle) = spawn_registered("a-registered-name-longer-than-comm");
        let source = LinuxThreads::new(std::time::Duration::from_millis(100));
        let list = source.all_excluding_current();
        let probe = list
            .threads
            .iter()
            .find(|t| t.name() == "a-registered-name-longer-than-comm")
            .unwrap();
        let metadata = ProcMetadataResolver.resolve(probe.native_id());
        assert_eq!(metadata.thread_id, probe.native_id().get());
        assert_eq!(metadata.name, "a-registered-name-longer-than-comm");

        stop.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn ids_outside_the_pid_range_do_not_resolve() {
        assert!(!ProcMetadataResolver.resolve(NativeThreadId::from_raw(0)).is_resolved());
        assert!(!ProcMetadataResolver.resolve(NativeThreadId::from_raw(u64::MAX)).is_resolved());
    }

    #[test]
    fn monotonic_clock_advances() {
        let source = LinuxThreads::new(std::time::Duration::from_millis(100));
        let a = source.absolute_time();
        let b = source.absolute_time();
        assert!(a > 0);
        assert!(b >= a);
    }
}
