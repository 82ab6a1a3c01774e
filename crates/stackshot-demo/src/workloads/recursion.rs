use std::hint::black_box;
use std::thread::JoinHandle;

use super::{StopFlag, spawn_registered};

/// Recurses `depth` frames, then spins at the bottom until stopped. Deep
/// enough settings push the stack past the capture cap, and those samples
/// are dropped.
#[inline(never)]
fn descend(depth: usize, stop: &StopFlag) -> u64 {
    if depth == 0 {
        let mut n = 0u64;
        while !stop.is_stopped() {
            n = black_box(n.wrapping_add(1));
        }
        return n;
    }
    black_box(descend(depth - 1, stop)).wrapping_add(1)
}

pub fn run(workers: usize, depth: usize, stop: &StopFlag) -> Result<Vec<JoinHandle<()>>, String> {
    (0..workers)
        .map(|i| {
            // Stagger depths so some workers land under the cap and some over it.
            let depth = depth + i * 8;
            spawn_registered(format!("recurse-{depth}"), stop.clone(), move |_, stop| {
                black_box(descend(depth, &stop));
            })
        })
        .collect()
}
