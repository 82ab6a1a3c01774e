pub mod contention;
pub mod recursion;
pub mod spin;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Shared stop flag for every workload thread.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Spawns a named OS thread that is registered with the sampler for its
/// whole lifetime.
pub fn spawn_registered<F>(name: String, stop: StopFlag, body: F) -> Result<JoinHandle<()>, String>
where
    F: FnOnce(&stackshot_threads::ThreadGuard, StopFlag) + Send + 'static,
{
    let thread_name = name.clone();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let guard = stackshot_threads::register_thread_guard(&thread_name);
            body(&guard, stop);
        })
        .map_err(|e| format!("failed to spawn {name}: {e}"))
}
