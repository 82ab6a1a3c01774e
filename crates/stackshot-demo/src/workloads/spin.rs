use std::hint::black_box;
use std::thread::JoinHandle;

use super::{StopFlag, spawn_registered};

#[inline(never)]
fn checksum(seed: u64) -> u64 {
    (0..4_096u64).fold(seed, |acc, x| black_box(acc.rotate_left(5) ^ x))
}

#[inline(never)]
fn crunch(seed: u64) -> u64 {
    checksum(seed).wrapping_add(checksum(seed ^ 0x9e37_79b9))
}

pub fn run(workers: usize, stop: &StopFlag) -> Result<Vec<JoinHandle<()>>, String> {
    (0..workers)
        .map(|i| {
            spawn_registered(format!("spin-{i}"), stop.clone(), move |_, stop| {
                let mut seed = i as u64;
                while !stop.is_stopped() {
                    seed = crunch(seed);
                }
                black_box(seed);
            })
        })
        .collect()
}
