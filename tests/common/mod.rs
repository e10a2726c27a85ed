#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runmerge::{Compare, MergeSorter, NoProgress, Record, Resources};

pub fn test_dir() -> PathBuf {
    test_dir_with_name("test_runs")
}

pub fn test_dir_with_name(name: &str) -> PathBuf {
    let dir = PathBuf::from(format!("./{}", name));
    std::fs::create_dir_all(&dir).expect("Failed to create test directory");
    dir
}

pub fn random_values(n: usize, seed: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.random::<u64>()).collect()
}

/// Sorter over `u64` with fixed parameters writing runs under `test_dir()`.
pub fn explicit_sorter(
    resources: Arc<Resources>,
    run_length: usize,
    fanout: usize,
) -> MergeSorter<u64> {
    let mut sorter = MergeSorter::natural(resources);
    sorter.set_temp_dir(test_dir()).unwrap();
    sorter.set_block_size(4096).unwrap();
    sorter.set_parameters(run_length, fanout).unwrap();
    sorter
}

pub fn push_all<T: Record, C: Compare<T>>(sorter: &mut MergeSorter<T, C>, items: Vec<T>) {
    sorter.begin().unwrap();
    for item in items {
        sorter.push(item).unwrap();
    }
    sorter.end().unwrap();
}

pub fn drain<T: Record, C: Compare<T>>(sorter: &mut MergeSorter<T, C>) -> Vec<T> {
    let mut out = Vec::new();
    while sorter.can_pull().unwrap() {
        out.push(sorter.pull().unwrap());
    }
    out
}

/// Runs all three phases and returns the output.
pub fn sort_with<T: Record, C: Compare<T>>(sorter: &mut MergeSorter<T, C>, items: Vec<T>) -> Vec<T> {
    push_all(sorter, items);
    sorter.calc(&mut NoProgress).unwrap();
    drain(sorter)
}

pub fn sorted(mut items: Vec<u64>) -> Vec<u64> {
    items.sort_unstable();
    items
}
