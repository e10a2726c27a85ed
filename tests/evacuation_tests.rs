mod common;
use common::{drain, explicit_sorter, push_all, random_values, sort_with, sorted, test_dir};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runmerge::{ByKey, MergeSorter, NoProgress, Resources, SorterState};

fn internal_sorter() -> MergeSorter<u64> {
    let mut sorter = MergeSorter::natural(Resources::unlimited());
    sorter.set_temp_dir(test_dir()).unwrap();
    sorter.set_block_size(4096).unwrap();
    sorter
}

#[test]
fn test_evacuate_after_end_matches_control() {
    let data = random_values(1_000, 21);
    let mut control = explicit_sorter(Resources::unlimited(), 50, 4);
    let expected = sort_with(&mut control, data.clone());

    let mut sorter = explicit_sorter(Resources::unlimited(), 50, 4);
    push_all(&mut sorter, data);
    sorter.evacuate().unwrap();
    sorter.calc(&mut NoProgress).unwrap();
    assert_eq!(drain(&mut sorter), expected);
}

#[test]
fn test_evacuate_internal_after_end() {
    let data = random_values(300, 22);
    let mut sorter = internal_sorter();
    push_all(&mut sorter, data.clone());
    assert_eq!(sorter.temp_storage_usage(), 0);

    sorter.evacuate().unwrap();
    assert_eq!(sorter.state(), SorterState::Evacuated);
    assert_eq!(sorter.resident_memory(), sorter.evacuated_memory_usage());
    assert_eq!(sorter.temp_storage_usage(), 300 * 8);

    sorter.calc(&mut NoProgress).unwrap();
    assert_eq!(sorter.state(), SorterState::Built);
    assert_eq!(drain(&mut sorter), sorted(data));
}

#[test]
fn test_evacuate_mid_drain_external() {
    let data = random_values(5_000, 23);
    let mut sorter = explicit_sorter(Resources::unlimited(), 64, 4);
    push_all(&mut sorter, data.clone());
    sorter.calc(&mut NoProgress).unwrap();

    let mut out = Vec::new();
    for _ in 0..1_234 {
        out.push(sorter.pull().unwrap());
    }
    let resident = sorter.resident_memory();
    let temp = sorter.temp_storage_usage();

    sorter.evacuate().unwrap();
    assert_eq!(sorter.state(), SorterState::Evacuated);
    assert_eq!(sorter.resident_memory(), sorter.evacuated_memory_usage());
    assert!(sorter.resident_memory() < resident);
    assert!(sorter.temp_storage_usage() >= temp);

    out.extend(drain(&mut sorter));
    assert_eq!(out, sorted(data));
}

#[test]
fn test_evacuate_mid_drain_internal() {
    let data = random_values(500, 24);
    let mut sorter = internal_sorter();
    push_all(&mut sorter, data.clone());
    sorter.calc(&mut NoProgress).unwrap();

    let mut out = Vec::new();
    for _ in 0..100 {
        out.push(sorter.pull().unwrap());
    }
    let resident = sorter.resident_memory();
    sorter.evacuate().unwrap();
    assert!(sorter.resident_memory() < resident);
    // Only the undrained items were written out.
    assert_eq!(sorter.temp_storage_usage(), 400 * 8);

    assert!(sorter.can_pull().unwrap());
    assert_eq!(sorter.state(), SorterState::Draining);
    out.extend(drain(&mut sorter));
    assert_eq!(out, sorted(data));
}

#[test]
fn test_evacuate_built_before_first_pull() {
    let data = random_values(2_000, 25);
    let mut sorter = explicit_sorter(Resources::unlimited(), 100, 3);
    push_all(&mut sorter, data.clone());
    sorter.calc(&mut NoProgress).unwrap();
    sorter.evacuate().unwrap();
    // A second evacuation has nothing left to release.
    sorter.evacuate().unwrap();
    assert_eq!(sorter.resident_memory(), sorter.evacuated_memory_usage());
    assert_eq!(drain(&mut sorter), sorted(data));

    // Closed sorters ignore evacuation.
    sorter.evacuate().unwrap();
    assert_eq!(sorter.state(), SorterState::Closed);
}

#[test]
fn test_repeated_evacuation_keeps_tie_order() {
    // Many equal keys; the payload shows which input an item came from.
    let mut rng = StdRng::seed_from_u64(26);
    let data: Vec<(u64, u64)> = (0..3_000).map(|i| (rng.random_range(0..20), i)).collect();
    let by_key = |pair: &(u64, u64)| pair.0;

    let mut control = MergeSorter::new(ByKey(by_key), Resources::unlimited());
    control.set_temp_dir(test_dir()).unwrap();
    control.set_parameters(70, 4).unwrap();
    let expected = sort_with(&mut control, data.clone());

    let mut sorter = MergeSorter::new(ByKey(by_key), Resources::unlimited());
    sorter.set_temp_dir(test_dir()).unwrap();
    sorter.set_parameters(70, 4).unwrap();
    push_all(&mut sorter, data);
    sorter.calc(&mut NoProgress).unwrap();
    let mut out = Vec::new();
    while sorter.can_pull().unwrap() {
        out.push(sorter.pull().unwrap());
        if out.len() % 250 == 0 {
            sorter.evacuate().unwrap();
        }
    }
    assert_eq!(out, expected);
}

#[test]
fn test_evacuate_empty_sorter() {
    let mut sorter = internal_sorter();
    push_all(&mut sorter, vec![]);
    sorter.evacuate().unwrap();
    assert_eq!(sorter.temp_storage_usage(), 0);
    assert!(!sorter.can_pull().unwrap());
    assert_eq!(sorter.state(), SorterState::Closed);
}

#[test]
fn test_evacuate_before_merging_only_before_calc() {
    let data = random_values(300, 27);
    let mut sorter = internal_sorter();
    push_all(&mut sorter, data.clone());
    sorter.evacuate_before_merging().unwrap();
    assert_eq!(sorter.state(), SorterState::Evacuated);
    assert_eq!(sorter.temp_storage_usage(), 300 * 8);

    sorter.calc(&mut NoProgress).unwrap();
    sorter.evacuate_before_merging().unwrap();
    assert_eq!(sorter.state(), SorterState::Built);
    assert_eq!(drain(&mut sorter), sorted(data));
}

#[test]
fn test_evacuate_before_reporting_skips_merge_phase() {
    let data = random_values(300, 28);
    let mut sorter = internal_sorter();
    push_all(&mut sorter, data.clone());
    sorter.evacuate_before_reporting().unwrap();
    assert_eq!(sorter.state(), SorterState::Ready);
    assert_eq!(sorter.temp_storage_usage(), 0);

    sorter.calc(&mut NoProgress).unwrap();
    sorter.evacuate_before_reporting().unwrap();
    assert_eq!(sorter.state(), SorterState::Evacuated);
    assert_eq!(sorter.resident_memory(), sorter.evacuated_memory_usage());
    assert_eq!(drain(&mut sorter), sorted(data));
}

#[test]
fn test_evacuate_before_reporting_leaves_internal_drain_resident() {
    let data = random_values(300, 29);
    let mut sorter = internal_sorter();
    push_all(&mut sorter, data.clone());
    sorter.calc(&mut NoProgress).unwrap();
    let mut out = vec![sorter.pull().unwrap()];
    let resident = sorter.resident_memory();

    sorter.evacuate_before_reporting().unwrap();
    assert_eq!(sorter.state(), SorterState::Draining);
    assert_eq!(sorter.resident_memory(), resident);
    assert_eq!(sorter.temp_storage_usage(), 0);
    out.extend(drain(&mut sorter));
    assert_eq!(out, sorted(data));
}

#[test]
fn test_evacuate_before_reporting_mid_external_drain() {
    let data = random_values(5_000, 30);
    let mut sorter = explicit_sorter(Resources::unlimited(), 64, 4);
    push_all(&mut sorter, data.clone());
    sorter.calc(&mut NoProgress).unwrap();
    let mut out = Vec::new();
    for _ in 0..100 {
        out.push(sorter.pull().unwrap());
    }

    sorter.evacuate_before_reporting().unwrap();
    assert_eq!(sorter.state(), SorterState::Evacuated);
    out.extend(drain(&mut sorter));
    assert_eq!(out, sorted(data));
}
