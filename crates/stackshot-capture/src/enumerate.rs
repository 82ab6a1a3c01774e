use stackshot_types::{Backtrace, MAX_BACKTRACE_DEPTH, NativeThreadId};
use tracing::{debug, warn};

use crate::backtrace::{CaptureStatus, backtrace};
use crate::config::CaptureOptions;
use crate::metadata::{MetadataResolver, ThreadMetadataCache};
use crate::thread::{FrozenThread, PreparedSample, ThreadHandle, ThreadList, ThreadSource};

/// What happened to each thread during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub threads: usize,
    pub idle: usize,
    pub unresolved: usize,
    pub suspend_failed: usize,
    pub context_failed: usize,
    /// Captured but not delivered: truncated, empty, or without a usable start frame.
    pub dropped: usize,
    pub delivered: usize,
}

/// Samples every thread except the caller, one at a time.
///
/// For each thread: skip if idle, resolve metadata (skip if unresolved), read
/// its stack bounds, take a timestamp, then suspend, walk, and resume. Only
/// walks that reached the end of the stack are handed to `callback`, on this
/// thread and after the target has been resumed, in enumeration order.
pub fn enumerate_backtraces_for_all_threads<S, R, F>(
    source: &S,
    cache: &mut ThreadMetadataCache<R>,
    options: CaptureOptions,
    mut callback: F,
) -> PassSummary
where
    S: ThreadSource,
    R: MetadataResolver,
    F: FnMut(Backtrace),
{
    let ThreadList { threads, current } = source.all_excluding_current();
    let live: Vec<NativeThreadId> = threads.iter().map(|t| t.native_id()).collect();
    cache.retain_threads(&live);

    let mut summary = PassSummary {
        threads: threads.len(),
        ..PassSummary::default()
    };
    let mut addresses = [0usize; MAX_BACKTRACE_DEPTH];

    for mut thread in threads {
        let id = thread.native_id();
        if thread.is_idle() {
            summary.idle += 1;
            continue;
        }

        let Some(prepared) = PreparedSample::gather(source, &thread, cache) else {
            summary.unresolved += 1;
            debug!(thread = %id, "skipping thread with unresolved metadata");
            continue;
        };

        // Nothing between freeze and the end of this block may allocate, lock or log.
        let capture = {
            let frozen = match FrozenThread::freeze(&mut thread, &prepared) {
                Ok(frozen) => frozen,
                Err(err) => {
                    summary.suspend_failed += 1;
                    debug!(thread = %id, %err, "skipping thread that could not be suspended");
                    continue;
                }
            };
            backtrace(
                &frozen,
                current,
                &mut addresses,
                prepared.bounds(),
                options.max_depth,
                options.skip,
            )
        };

        if let CaptureStatus::ContextUnavailable(err) = capture.status {
            summary.context_failed += 1;
            warn!(thread = %id, %err, "failed to read thread state");
        }

        if !capture.reached_end_of_stack || capture.depth == 0 {
            summary.dropped += 1;
            continue;
        }

        match prepared.into_backtrace(&addresses[..capture.depth]) {
            Ok(bt) => {
                summary.delivered += 1;
                callback(bt);
            }
            Err(err) => {
                summary.dropped += 1;
                debug!(thread = %id, %err, "discarding malformed backtrace");
            }
        }
    }

    debug!(
        threads = summary.threads,
        idle = summary.idle,
        unresolved = summary.unresolved,
        suspend_failed = summary.suspend_failed,
        context_failed = summary.context_failed,
        dropped = summary.dropped,
        delivered = summary.delivered,
        "sampling pass complete"
    );
    summary
}
