use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use super::{StopFlag, spawn_registered};

/// Workers fight over one lock. Whoever is waiting marks itself idle, so the
/// sampler only ever stops the holder.
pub fn run(workers: usize, stop: &StopFlag) -> Result<Vec<JoinHandle<()>>, String> {
    let shared = Arc::new(Mutex::new(0u64));
    (0..workers)
        .map(|i| {
            let shared = Arc::clone(&shared);
            spawn_registered(format!("contend-{i}"), stop.clone(), move |guard, stop| {
                while !stop.is_stopped() {
                    guard.set_idle(true);
                    let mut value = shared.lock();
                    guard.set_idle(false);
                    hold(&mut value);
                    drop(value);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect()
}

#[inline(never)]
fn hold(value: &mut u64) {
    let until = std::time::Instant::now() + Duration::from_millis(2);
    while std::time::Instant::now() < until {
        *value = std::hint::black_box(value.wrapping_add(1));
    }
}
