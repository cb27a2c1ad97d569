//! Scenario and multi-threaded tests, run against all four set
//! implementations through the `ConcurrentSet` trait.

use conset::{
    AvlTree, CbTree, ConcurrentSet, MultiwaySearchTree, NonBlockingBst, ThreadRegistry,
};
use rand::prelude::*;
use std::sync::Barrier;
use std::thread;

const SINGLE_N: usize = 10_000;
const RANDOM_N: usize = 100_000;
/// Sequential insertion builds a spine in the unbalanced external BST,
/// so that structure gets a shorter sequential run.
const SINGLE_N_UNBALANCED: usize = 100;
const MT_THREADS: usize = 4;
const MT_PER_THREAD: i32 = 2_000;
const CHURN_ITERATIONS: usize = 2_000;

fn single_ctx(registry: &ThreadRegistry) -> conset::ThreadContext {
    registry
        .register()
        .unwrap_or_else(|e| panic!("registry misconfigured: {e}"))
}

fn empty_set_behaviour<S: ConcurrentSet<i32>>(set: S) {
    let registry = ThreadRegistry::new(1);
    let ctx = single_ctx(&registry);

    assert!(!set.contains(&ctx, 7));
    assert!(!set.remove(&ctx, 7));

    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..1_000 {
        let key = rng.gen_range(0..i32::MAX - 1);
        assert!(!set.contains(&ctx, key));
        assert!(!set.remove(&ctx, key));
    }
}

fn singleton_lifecycle<S: ConcurrentSet<i32>>(set: S) {
    let registry = ThreadRegistry::new(1);
    let ctx = single_ctx(&registry);

    assert!(set.add(&ctx, 42));
    assert!(!set.add(&ctx, 42));
    assert!(set.contains(&ctx, 42));
    assert!(set.remove(&ctx, 42));
    assert!(!set.contains(&ctx, 42));
    assert!(!set.remove(&ctx, 42));
}

fn sequential_fill_drain<S: ConcurrentSet<i32>>(set: S, count: usize) {
    let registry = ThreadRegistry::new(1);
    let ctx = single_ctx(&registry);
    let count = count as i32;

    for key in 0..count {
        assert!(!set.contains(&ctx, key));
        assert!(set.add(&ctx, key), "add {key}");
        assert!(set.contains(&ctx, key));
    }
    for key in 0..count {
        assert!(set.contains(&ctx, key));
        assert!(set.remove(&ctx, key), "remove {key}");
        assert!(!set.contains(&ctx, key));
    }
    for key in 0..count {
        assert!(!set.contains(&ctx, key));
    }
}

fn random_insert_then_shuffled_removal<S: ConcurrentSet<i32>>(set: S, count: usize) {
    let registry = ThreadRegistry::new(1);
    let ctx = single_ctx(&registry);
    let mut rng = StdRng::seed_from_u64(99);

    let mut inserted = Vec::new();
    for _ in 0..count {
        let key = rng.gen_range(0..i32::MAX - 1);
        if set.contains(&ctx, key) {
            assert!(!set.add(&ctx, key));
        } else {
            assert!(set.add(&ctx, key));
            assert!(set.contains(&ctx, key));
            inserted.push(key);
        }
    }

    // Removing absent keys must not disturb anything.
    for _ in 0..count {
        let key = rng.gen_range(0..i32::MAX - 1);
        if !set.contains(&ctx, key) {
            assert!(!set.remove(&ctx, key));
        }
    }

    inserted.shuffle(&mut rng);
    for &key in &inserted {
        assert!(set.contains(&ctx, key));
        assert!(set.remove(&ctx, key), "remove {key}");
    }
    for &key in &inserted {
        assert!(!set.contains(&ctx, key));
    }
}

fn disjoint_ranges_concurrently<S: ConcurrentSet<i32>>(set: S, per_thread: i32) {
    let registry = ThreadRegistry::new(MT_THREADS);
    let barrier = Barrier::new(MT_THREADS);

    thread::scope(|scope| {
        for tid in 0..MT_THREADS as i32 {
            let set = &set;
            let registry = &registry;
            let barrier = &barrier;
            scope.spawn(move || {
                let Ok(ctx) = registry.register() else {
                    panic!("registry exhausted");
                };
                let lo = tid * per_thread;
                let hi = (tid + 1) * per_thread;

                for key in lo..hi {
                    assert!(!set.contains(&ctx, key));
                    assert!(set.add(&ctx, key), "add {key}");
                    assert!(set.contains(&ctx, key));
                }
                for key in lo..hi {
                    assert!(set.contains(&ctx, key));
                    assert!(set.remove(&ctx, key), "remove {key}");
                    assert!(!set.contains(&ctx, key));
                }

                barrier.wait();

                // Every thread checks the whole keyspace once all have
                // drained their ranges.
                for key in 0..MT_THREADS as i32 * per_thread {
                    assert!(!set.contains(&ctx, key), "leftover {key}");
                }
            });
        }
    });
}

fn fixed_points_survive_churn<S: ConcurrentSet<i32>>(set: S) {
    let registry = ThreadRegistry::new(MT_THREADS);
    let barrier = Barrier::new(MT_THREADS);

    thread::scope(|scope| {
        for tid in 0..MT_THREADS as i32 {
            let set = &set;
            let registry = &registry;
            let barrier = &barrier;
            scope.spawn(move || {
                let Ok(ctx) = registry.register() else {
                    panic!("registry exhausted");
                };

                let fixed = 10_000_000 + tid;
                assert!(set.add(&ctx, fixed));
                barrier.wait();

                let mut rng = StdRng::seed_from_u64(1000 + tid as u64);
                let lo = tid * 100_000;
                let hi = lo + 100_000;
                let mut mine = Vec::new();

                for _ in 0..CHURN_ITERATIONS {
                    let key = rng.gen_range(lo..hi);
                    if rng.gen_range(0..100) < 33 {
                        set.remove(&ctx, key);
                    } else if set.add(&ctx, key) {
                        mine.push(key);
                    }
                    assert!(set.contains(&ctx, fixed), "fixed key {fixed} vanished");
                }

                for key in mine {
                    set.remove(&ctx, key);
                }
                assert!(set.contains(&ctx, fixed));
                assert!(set.remove(&ctx, fixed));
            });
        }
    });
}

fn alternating_writer_with_reader<S: ConcurrentSet<i32>>(set: S) {
    let registry = ThreadRegistry::new(2);

    thread::scope(|scope| {
        let writer = {
            let set = &set;
            let registry = &registry;
            scope.spawn(move || {
                let Ok(ctx) = registry.register() else {
                    panic!("registry exhausted");
                };
                for _ in 0..20_000 {
                    set.add(&ctx, 5);
                    set.remove(&ctx, 5);
                }
            })
        };

        let reader = {
            let set = &set;
            let registry = &registry;
            scope.spawn(move || {
                let Ok(ctx) = registry.register() else {
                    panic!("registry exhausted");
                };
                let mut seen_present = false;
                let mut seen_absent = false;
                for _ in 0..20_000 {
                    if set.contains(&ctx, 5) {
                        seen_present = true;
                    } else {
                        seen_absent = true;
                    }
                }
                // The writer's final remove makes absence permanent, so
                // this loop terminates.
                while !seen_absent {
                    seen_absent = !set.contains(&ctx, 5);
                }
                (seen_present, seen_absent)
            })
        };

        writer.join().unwrap_or_else(|_| panic!("writer panicked"));
        let (_, seen_absent) = reader.join().unwrap_or_else(|_| panic!("reader panicked"));
        // Every sample is a legal linearization on its own; what must
        // hold is that the reader saw the key absent at least once (the
        // writer's final state is absent).
        assert!(seen_absent);
    });

    // The writer's last operation was a remove.
    let verify_registry = ThreadRegistry::new(1);
    let ctx = single_ctx(&verify_registry);
    assert!(!set.contains(&ctx, 5));
}

macro_rules! set_suite {
    ($name:ident, $ctor:expr, $sequential_n:expr) => {
        mod $name {
            use super::*;

            #[test]
            fn empty_set() {
                empty_set_behaviour(($ctor)(1));
            }

            #[test]
            fn singleton() {
                singleton_lifecycle(($ctor)(1));
            }

            #[test]
            fn sequential() {
                sequential_fill_drain(($ctor)(1), $sequential_n);
            }

            #[test]
            fn random_churn() {
                random_insert_then_shuffled_removal(($ctor)(1), RANDOM_N);
            }

            #[test]
            fn disjoint_ranges() {
                disjoint_ranges_concurrently(($ctor)(MT_THREADS), MT_PER_THREAD);
            }

            #[test]
            fn fixed_points() {
                fixed_points_survive_churn(($ctor)(MT_THREADS));
            }

            #[test]
            fn alternation() {
                alternating_writer_with_reader(($ctor)(2));
            }
        }
    };
}

set_suite!(avltree, |threads| AvlTree::<i32>::new(threads), SINGLE_N);
set_suite!(cbtree, |threads| CbTree::<i32>::new(threads), SINGLE_N);
set_suite!(
    nbbst,
    |threads| NonBlockingBst::<i32>::new(threads),
    SINGLE_N_UNBALANCED
);
set_suite!(
    lfmst,
    |threads| MultiwaySearchTree::<i32>::new(threads),
    SINGLE_N
);
