//! Whole-allocator end-to-end concurrency scenarios. These assemble the
//! full facade (unlike the per-layer unit tests colocated with their
//! modules) and drive it from real, pinned-if-possible OS threads
//! synchronised on a [`spin::Barrier`], so contention is real rather than
//! serialised away by scheduling luck.

use std::collections::HashSet;
use std::sync::Mutex;

use frametree_alloc::consts::{CHILD_SIZE, HUGE_ORDER, MAX_ORDER, TREE_SIZE};
use frametree_alloc::thread::{parallel, pin};
use frametree_alloc::util::{black_box, logging, WyRand};
use frametree_alloc::{Allocator, InitMode};

#[test]
fn concurrent_small_gets_never_collide() {
    logging();
    const CORES: usize = 4;
    const PER_CORE: usize = 256;
    let alloc = Allocator::init(CORES, 0, CORES * TREE_SIZE, InitMode::Free).unwrap();

    let barrier = spin::Barrier::new(CORES);
    let seen: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());

    parallel(CORES, |cpu| {
        pin(cpu);
        barrier.wait();
        let mut mine = Vec::with_capacity(PER_CORE);
        for _ in 0..PER_CORE {
            mine.push(alloc.get(cpu, 0).unwrap());
        }
        let mut seen = seen.lock().unwrap();
        for f in mine {
            assert!(seen.insert(f), "frame {f} handed out twice");
        }
    });

    assert_eq!(seen.lock().unwrap().len(), CORES * PER_CORE);
}

#[test]
fn concurrent_alloc_free_churn_preserves_total() {
    logging();
    const CORES: usize = 4;
    let alloc = Allocator::init(CORES, 0, CORES * TREE_SIZE, InitMode::Free).unwrap();
    let before = alloc.free_frames();

    let barrier = spin::Barrier::new(CORES);
    parallel(CORES, |cpu| {
        pin(cpu);
        let mut rng = WyRand::new(0x1234_5678 + cpu as u64);
        barrier.wait();
        let mut held = Vec::new();
        for _ in 0..2000 {
            if held.is_empty() || rng.range(2) == 0 {
                if let Ok(f) = alloc.get(cpu, 0) {
                    held.push(f);
                }
            } else {
                let idx = rng.range(held.len());
                let f = black_box(held.swap_remove(idx));
                alloc.put(cpu, f, 0).unwrap();
            }
        }
        rng.shuffle(&mut held);
        for f in held {
            alloc.put(cpu, f, 0).unwrap();
        }
        alloc.drain(cpu).unwrap();
    });

    assert_eq!(alloc.free_frames(), before);
}

#[test]
fn huge_and_small_allocations_coexist_across_cores() {
    logging();
    const CORES: usize = 4;
    let alloc = Allocator::init(CORES, 0, CORES * TREE_SIZE, InitMode::Free).unwrap();

    let barrier = spin::Barrier::new(2);
    parallel(2, |cpu| {
        pin(cpu);
        barrier.wait();
        if cpu == 0 {
            for _ in 0..16 {
                let f = alloc.get(0, HUGE_ORDER).unwrap();
                assert!(!alloc.is_free(f, HUGE_ORDER));
                alloc.put(0, f, HUGE_ORDER).unwrap();
            }
        } else {
            for _ in 0..512 {
                let f = alloc.get(1, 0).unwrap();
                alloc.put(1, f, 0).unwrap();
            }
        }
    });

    assert_eq!(alloc.free_frames(), alloc.frames());
}

#[test]
fn drain_then_reserve_round_trips_under_contention() {
    logging();
    const CORES: usize = 4;
    let alloc = Allocator::init(CORES, 0, CORES * TREE_SIZE, InitMode::Free).unwrap();
    let barrier = spin::Barrier::new(CORES);

    parallel(CORES, |cpu| {
        pin(cpu);
        barrier.wait();
        for _ in 0..64 {
            let f = alloc.get(cpu, 2).unwrap();
            alloc.drain(cpu).unwrap();
            alloc.put(cpu, f, 2).unwrap();
        }
    });

    assert_eq!(alloc.free_frames(), alloc.frames());
}

#[test]
fn max_order_spans_two_children_atomically() {
    logging();
    let alloc = Allocator::init(1, 0, TREE_SIZE, InitMode::Free).unwrap();
    let f = alloc.get(0, MAX_ORDER).unwrap();
    assert!(!alloc.is_free(f, HUGE_ORDER));
    assert!(!alloc.is_free(f + CHILD_SIZE, HUGE_ORDER));
    alloc.put(0, f, MAX_ORDER).unwrap();
    assert!(alloc.is_free(f, MAX_ORDER));
}
