//! Concurrency Tests
//!
//! Several threads pull and commit against one runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use ripple_core::{Adaptive, Runtime};

const THREADS: usize = 8;

/// Test that concurrent forces of one outdated cell run its derivation once.
#[test]
fn concurrent_forces_share_one_recomputation() {
    let rt = Runtime::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let input = rt.changeable(1u64);

    let counter = runs.clone();
    let source = input.clone();
    let slow = Adaptive::new(&rt, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(20));
        source.get() * 3
    });

    for round in 1..=3u64 {
        rt.transact(|tx| input.write(tx, round)).unwrap();
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let slow = slow.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    slow.force().unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), round * 3);
        }
        assert_eq!(runs.load(Ordering::SeqCst) as u64, round);
    }
}

/// Test that pulls racing with commits only ever see whole transactions.
#[test]
fn pulls_never_observe_partial_commits() {
    let rt = Runtime::new();
    let left = rt.changeable(0i64);
    let right = rt.changeable(0i64);
    let balance = Adaptive::map2(&left, &right, |l, r| l + r);

    let writer = {
        let rt = rt.clone();
        let (left, right) = (left.clone(), right.clone());
        thread::spawn(move || {
            for n in 1..=200i64 {
                rt.transact(|tx| {
                    left.write(tx, n)?;
                    right.write(tx, -n)
                })
                .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let balance = balance.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    assert_eq!(balance.force().unwrap(), 0);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!((left.get(), right.get()), (200, -200));
}

/// Test that transactions on different threads are independent.
#[test]
fn each_thread_has_its_own_transaction() {
    let rt = Runtime::new();
    let tally = rt.changeable_set(Vec::<usize>::new());
    let count = tally.len();

    let handles: Vec<_> = (0..THREADS)
        .map(|n| {
            let rt = rt.clone();
            let tally = tally.clone();
            thread::spawn(move || {
                let tx = rt.begin();
                assert!(!tx.is_nested());
                tally.insert(&tx, n).unwrap();
                tx.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(count.force().unwrap(), THREADS);
    assert_eq!(rt.revision(), THREADS as u64);
}

/// Test that readers of a derived collection on many threads agree.
#[test]
fn collection_pulls_from_many_threads() {
    let rt = Runtime::new();
    let numbers = rt.changeable_set(0..100u32);
    let evens = numbers.filter(|n| n % 2 == 0);

    rt.transact(|tx| {
        for n in 100..110u32 {
            numbers.insert(tx, n)?;
        }
        Ok(())
    })
    .unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let evens = evens.clone();
            thread::spawn(move || {
                let reader = evens.subscribe();
                reader.pull().unwrap().len()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 55);
    }
}
