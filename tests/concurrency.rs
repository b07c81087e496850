//! Multi-threaded stress scenarios, grounded in the donor crate's
//! `tests/integration.rs` (`Arc<Barrier>` thread coordination) and
//! `src/local.rs`'s inline concurrency tests.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use assert_matches::assert_matches;
use relaxed_pq::config::ConfigBuilder;
use relaxed_pq::{MergeResult, PriorityQueue};

#[test]
fn single_threaded_insert_and_drain() {
    let pq: PriorityQueue<i32> = PriorityQueue::with_config(0, ConfigBuilder::new().bag_width(1).build());
    pq.insert(3);
    pq.insert(1);
    pq.insert(2);

    let mut got = vec![pq.remove_any(), pq.remove_any(), pq.remove_any()];
    got.sort();
    assert_eq!(got, vec![1, 2, 3]);

    let pq = pq.with_empty_enabled();
    assert!(pq.empty());
}

#[test]
fn many_threads_insert_and_drain_same_bag() {
    const THREADS: i32 = 4;
    const PER_THREAD: i32 = 100;

    let pq: Arc<PriorityQueue<i32>> =
        Arc::new(PriorityQueue::with_config(0, ConfigBuilder::new().bag_width(4).build()));

    let inserters: Vec<_> = (0..THREADS)
        .map(|t| {
            let pq = Arc::clone(&pq);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    pq.insert(t * PER_THREAD + i);
                }
            })
        })
        .collect();
    for h in inserters {
        h.join().unwrap();
    }

    let total = THREADS * PER_THREAD;
    let removed = Arc::new(std::sync::Mutex::new(Vec::with_capacity(total as usize)));
    let removers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pq = Arc::clone(&pq);
            let removed = Arc::clone(&removed);
            thread::spawn(move || loop {
                let mut guard = removed.lock().unwrap();
                if guard.len() as i32 >= total {
                    return;
                }
                drop(guard);
                if let Some(v) = pq.try_remove_any(4) {
                    removed.lock().unwrap().push(v);
                }
            })
        })
        .collect();
    for h in removers {
        h.join().unwrap();
    }

    let got: HashSet<i32> = removed.lock().unwrap().iter().copied().collect();
    let expected: HashSet<i32> = (0..total).collect();
    assert_eq!(got, expected);
}

#[test]
fn merge_across_two_queues_yields_union() {
    let a: PriorityQueue<i32> = PriorityQueue::with_config(0, ConfigBuilder::new().bag_width(4).build());
    let b: PriorityQueue<i32> = PriorityQueue::with_config(1, ConfigBuilder::new().bag_width(4).build());

    for i in 0..100 {
        a.insert(i);
    }
    for i in 100..200 {
        b.insert(i);
    }

    assert_matches!(a.merge(&b), MergeResult::Success);

    let mut got: Vec<i32> = (0..200).map(|_| a.remove_any()).collect();
    got.sort();
    assert_eq!(got, (0..200).collect::<Vec<_>>());
}

#[test]
fn merge_rejects_incompatible_widths() {
    let a: PriorityQueue<i32> = PriorityQueue::with_config(0, ConfigBuilder::new().bag_width(2).build());
    let b: PriorityQueue<i32> = PriorityQueue::with_config(1, ConfigBuilder::new().bag_width(3).build());
    assert_matches!(a.merge(&b), MergeResult::Incompatible);
    // both queues remain independently usable
    a.insert(1);
    b.insert(2);
    assert_eq!(a.remove_any(), 1);
    assert_eq!(b.remove_any(), 2);
}

#[test]
fn merge_rejects_id_clash_between_live_roots() {
    let a: PriorityQueue<i32> = PriorityQueue::with_config(5, ConfigBuilder::new().bag_width(2).build());
    let b: PriorityQueue<i32> = PriorityQueue::with_config(5, ConfigBuilder::new().bag_width(2).build());
    assert_matches!(a.merge(&b), MergeResult::IdClash);
}

#[test]
fn interleaved_insert_remove_and_merge_stress() {
    // insert, try_remove_any, and merge all racing against each other: two
    // queues are concurrently filled from both sides, drained from the
    // higher-id side while the merge is in flight, and merged into one by a
    // third thread. Every element must end up either collected by a remover
    // or recoverable from the surviving queue afterwards — none lost, none
    // duplicated.
    const PER_INSERTER: i32 = 250;

    let a: Arc<PriorityQueue<i32>> =
        Arc::new(PriorityQueue::with_config(0, ConfigBuilder::new().bag_width(4).build()));
    let b: Arc<PriorityQueue<i32>> =
        Arc::new(PriorityQueue::with_config(1, ConfigBuilder::new().bag_width(4).build()));

    // 4 inserters + 2 removers + 1 merger
    let barrier = Arc::new(Barrier::new(7));
    let removed = Arc::new(std::sync::Mutex::new(Vec::new()));

    let ranges = [(0, PER_INSERTER), (PER_INSERTER, 2 * PER_INSERTER)];
    let mut inserters = Vec::new();
    for &(lo, hi) in &ranges {
        let a = Arc::clone(&a);
        let barrier = Arc::clone(&barrier);
        inserters.push(thread::spawn(move || {
            barrier.wait();
            for i in lo..hi {
                a.insert(i);
            }
        }));
    }
    for &(lo, hi) in &ranges {
        let b = Arc::clone(&b);
        let barrier = Arc::clone(&barrier);
        inserters.push(thread::spawn(move || {
            barrier.wait();
            for i in (2 * PER_INSERTER + lo)..(2 * PER_INSERTER + hi) {
                b.insert(i);
            }
        }));
    }

    // removers resolve through the higher-id handle `b`, so they race
    // directly against the low-id side (`a`) draining `b`'s slots mid-merge.
    let removers: Vec<_> = (0..2)
        .map(|_| {
            let b = Arc::clone(&b);
            let removed = Arc::clone(&removed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..2000 {
                    if let Some(v) = b.try_remove_any(4) {
                        removed.lock().unwrap().push(v);
                    }
                }
            })
        })
        .collect();

    let merger = {
        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            loop {
                match a.merge(&b) {
                    MergeResult::Success | MergeResult::WereAlreadyEqual => return,
                    _ => continue,
                }
            }
        })
    };

    for h in inserters {
        h.join().unwrap();
    }
    for h in removers {
        h.join().unwrap();
    }
    merger.join().unwrap();

    let mut got: Vec<i32> = removed.lock().unwrap().drain(..).collect();
    while let Some(v) = a.try_remove_any(8) {
        got.push(v);
    }

    let got: HashSet<i32> = got.into_iter().collect();
    let expected: HashSet<i32> = (0..4 * PER_INSERTER).collect();
    assert_eq!(got, expected);
}

#[test]
fn concurrent_inserts_survive_a_racing_merge() {
    // two threads insert into `a` and `b` respectively while a third merges
    // them partway through; every element inserted before either thread
    // joins must still be recoverable from `a` afterwards.
    let a: Arc<PriorityQueue<i32>> =
        Arc::new(PriorityQueue::with_config(0, ConfigBuilder::new().bag_width(4).build()));
    let b: Arc<PriorityQueue<i32>> =
        Arc::new(PriorityQueue::with_config(1, ConfigBuilder::new().bag_width(4).build()));

    let barrier = Arc::new(Barrier::new(3));

    let t1 = {
        let a = Arc::clone(&a);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..500 {
                a.insert(i);
            }
        })
    };
    let t2 = {
        let b = Arc::clone(&b);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 500..1000 {
                b.insert(i);
            }
        })
    };
    let t3 = {
        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            loop {
                match a.merge(&b) {
                    MergeResult::Success | MergeResult::WereAlreadyEqual => return,
                    _ => continue,
                }
            }
        })
    };

    t1.join().unwrap();
    t2.join().unwrap();
    t3.join().unwrap();

    let mut got: Vec<i32> = (0..1000).map(|_| a.remove_any()).collect();
    got.sort();
    assert_eq!(got, (0..1000).collect::<Vec<_>>());
}
