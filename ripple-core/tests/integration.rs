//! Integration Tests for Scalar Cells
//!
//! These tests verify that changeable cells, adaptive cells and transactions
//! work together through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use ripple_core::{Adaptive, Error, Runtime, TxStatus};

fn close_to(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 0.01
}

/// Test the drop-time scenario: one recomputation per transaction, however
/// many producers it wrote.
#[test]
fn drop_time_recomputes_once_per_transaction() {
    let rt = Runtime::new();
    let height = rt.changeable(10.0_f64);
    let gravity = rt.changeable(9.81_f64);
    let drop_time = Adaptive::map2(&height, &gravity, |h, g| (2.0 * h / g).sqrt());

    let t = drop_time.force().unwrap();
    assert!(close_to(t, 1.428), "got {t}");
    assert_eq!(drop_time.recomputations(), 1);

    rt.transact(|tx| gravity.write(tx, 1.62)).unwrap();
    let t = drop_time.force().unwrap();
    assert!(close_to(t, 3.517), "got {t}");
    assert_eq!(drop_time.recomputations(), 2);

    rt.transact(|tx| {
        gravity.write(tx, 24.79)?;
        height.write(tx, 2000.0)
    })
    .unwrap();
    let t = drop_time.force().unwrap();
    assert!(close_to(t, 12.70), "got {t}");
    assert_eq!(drop_time.recomputations(), 3);
}

/// Test that commits never run derivations and unread cells never recompute.
#[test]
fn adaptive_cells_are_lazy() {
    let rt = Runtime::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let input = rt.changeable(1);

    let counter = runs.clone();
    let source = input.clone();
    let derived = Adaptive::new(&rt, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        source.get() + 1
    });
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    assert_eq!(derived.force().unwrap(), 2);
    for n in 0..5 {
        rt.transact(|tx| input.write(tx, n)).unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(derived.is_outdated());

    assert_eq!(derived.force().unwrap(), 5);
    assert_eq!(derived.force().unwrap(), 5);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a chain of adaptive cells only recomputes what was read.
#[test]
fn chains_recompute_on_demand() {
    let rt = Runtime::new();
    let base = rt.changeable(5);
    let doubled = Adaptive::map(&base, |n| n * 2);
    let plus_ten = Adaptive::map(&doubled, |n| n + 10);

    assert_eq!(plus_ten.force().unwrap(), 20);
    rt.transact(|tx| base.write(tx, 10)).unwrap();
    assert!(doubled.is_outdated());
    assert!(plus_ten.is_outdated());

    assert_eq!(doubled.force().unwrap(), 20);
    assert!(plus_ten.is_outdated());
    assert_eq!(plus_ten.force().unwrap(), 30);
    assert_eq!(doubled.recomputations(), 2);
}

/// Test that no reader ever sees half of a transaction.
#[test]
fn writes_in_one_transaction_land_together() {
    let rt = Runtime::new();
    let debit = rt.changeable(100);
    let credit = rt.changeable(0);
    let total = Adaptive::map2(&debit, &credit, |d, c| d + c);
    assert_eq!(total.force().unwrap(), 100);

    let tx = rt.begin();
    debit.write(&tx, 60).unwrap();
    assert_eq!(total.force().unwrap(), 100);
    assert_eq!(debit.get(), 100);
    assert_eq!(debit.read_in(&tx), 60);
    credit.write(&tx, 40).unwrap();
    tx.commit().unwrap();

    assert_eq!((debit.get(), credit.get()), (60, 40));
    assert_eq!(total.force().unwrap(), 100);
}

/// Test that a failing closure discards everything it staged.
#[test]
fn failed_transactions_apply_nothing() {
    let rt = Runtime::new();
    let a = rt.changeable("a");
    let b = rt.changeable("b");

    let result: Result<(), Error> = rt.transact(|tx| {
        a.write(tx, "changed")?;
        b.write(tx, "changed")?;
        Err(Error::message("abort"))
    });
    assert!(result.is_err());
    assert_eq!((a.get(), b.get()), ("a", "b"));
    assert!(rt.current_transaction().is_none());
}

/// Test the protocol misuse errors.
#[test]
fn misuse_fails_at_the_call_site() {
    let rt = Runtime::new();
    let cell = rt.changeable(0);
    assert!(matches!(cell.set(1), Err(Error::NoTransaction)));

    let tx = rt.begin();
    cell.set(1).unwrap();
    tx.commit().unwrap();
    assert_eq!(tx.status(), TxStatus::Committed);
    assert!(matches!(
        tx.commit(),
        Err(Error::TransactionClosed(TxStatus::Committed))
    ));
    assert!(matches!(
        cell.write(&tx, 2),
        Err(Error::TransactionClosed(TxStatus::Committed))
    ));
    assert_eq!(cell.get(), 1);

    let other = Runtime::new();
    let tx = other.begin();
    assert!(matches!(cell.write(&tx, 3), Err(Error::ForeignRuntime)));
}

/// Test that a nested begin joins the outer transaction.
#[test]
fn nested_transactions_join_the_outer_one() {
    let rt = Runtime::new();
    let cell = rt.changeable(0);

    let outer = rt.begin();
    cell.write(&outer, 1).unwrap();
    rt.transact(|inner| {
        assert!(inner.is_nested());
        cell.write(inner, 2)
    })
    .unwrap();
    assert_eq!(cell.get(), 0);

    outer.commit().unwrap();
    assert_eq!(cell.get(), 2);
}

/// Test that a failing nested scope discards the whole outer transaction,
/// including the writes staged before it.
#[test]
fn failed_nested_scope_discards_the_outer_writes() {
    let rt = Runtime::new();
    let a = rt.changeable(0);
    let b = rt.changeable(0);

    let outer = rt.begin();
    a.write(&outer, 1).unwrap();
    let result: Result<(), Error> = rt.transact(|inner| {
        b.write(inner, 2)?;
        Err(Error::message("abort"))
    });
    assert!(result.is_err());
    assert_eq!(outer.status(), TxStatus::Discarded);

    assert!(outer.commit().is_err());
    assert_eq!((a.get(), b.get()), (0, 0));
    assert_eq!(rt.revision(), 0);
}

/// Test that declared edges reject cycles.
#[test]
fn connecting_a_cycle_is_rejected() {
    let rt = Runtime::new();
    let input = rt.changeable(1);
    let first = Adaptive::map(&input, |n| n + 1);
    let second = Adaptive::map(&first, |n| n * 2);
    assert_eq!(second.force().unwrap(), 4);

    let err = rt.connect(&first, &second).unwrap_err();
    assert!(matches!(err, Error::Cycle { .. }));
    assert_eq!(first.force().unwrap(), 2);

    // A declared edge the other way round is fine and marks the consumer.
    let extra = rt.changeable(0);
    rt.connect(&second, &extra).unwrap();
    assert!(second.is_outdated());
    rt.transact(|tx| extra.write(tx, 5)).unwrap();
    assert_eq!(second.force().unwrap(), 4);
    assert!(rt.disconnect(&second, &extra).unwrap());
    assert!(!rt.disconnect(&second, &extra).unwrap());
}

/// Test that a consumer stays reachable through a declared producer its
/// derivation never reads.
#[test]
fn declared_edges_keep_marks_flowing() {
    let rt = Runtime::new();
    let input = rt.changeable(1);
    let middle = Adaptive::map(&input, |n| n * 10);
    let watcher = Adaptive::new(&rt, || "idle");
    rt.connect(&watcher, &middle).unwrap();
    assert_eq!(watcher.force().unwrap(), "idle");

    rt.transact(|tx| input.write(tx, 2)).unwrap();
    assert!(middle.is_outdated());
    assert!(watcher.is_outdated());

    // Collections bring their declared producers up to date too.
    let tags = rt.changeable_set(["a"]);
    let upper = tags.map(|t| t.to_uppercase());
    rt.connect(&upper, &middle).unwrap();
    assert_eq!(upper.snapshot().unwrap().len(), 1);
    assert!(!middle.is_outdated());

    rt.transact(|tx| input.write(tx, 3)).unwrap();
    assert!(upper.is_outdated());
    assert_eq!(middle.force().unwrap(), 30);
}

/// Test that derivations reading each other report a cycle instead of
/// recursing.
#[test]
fn dynamic_cycles_are_reported() {
    let rt = Runtime::new();
    let slot: Arc<OnceLock<Adaptive<i32>>> = Arc::new(OnceLock::new());

    let back = slot.clone();
    let first = Adaptive::try_new(&rt, move || match back.get() {
        Some(second) => second.force(),
        None => Ok(0),
    });
    let second = Adaptive::try_map(&first, Ok);
    assert!(slot.set(second.clone()).is_ok());

    assert!(matches!(first.force(), Err(Error::Cycle { .. })));
    assert!(matches!(second.force(), Err(Error::Cycle { .. })));
}

/// Test that failures are cached until an input changes.
#[test]
fn derivation_failures_are_cached() {
    let rt = Runtime::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let input = rt.changeable(-1);

    let counter = runs.clone();
    let checked = Adaptive::try_map(&input, move |n: i32| {
        counter.fetch_add(1, Ordering::SeqCst);
        if n < 0 {
            Err(Error::message("negative input"))
        } else {
            Ok(n * 10)
        }
    });

    assert!(checked.force().is_err());
    assert!(checked.force().is_err());
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    rt.transact(|tx| input.write(tx, 3)).unwrap();
    assert_eq!(checked.force().unwrap(), 30);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a runtime configured from JSON lets derivation panics through.
#[test]
fn panics_propagate_when_not_caught() {
    let config = ripple_core::RuntimeConfig::from_json(r#"{ "catch_panics": false }"#).unwrap();
    let rt = Runtime::with_config(config);
    let input = rt.changeable(0);
    let fragile = Adaptive::map(&input, |n: i32| {
        assert!(n > 0, "must be positive");
        n
    });

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| fragile.force()));
    assert!(outcome.is_err());
    assert!(fragile.is_outdated());

    rt.transact(|tx| input.write(tx, 7)).unwrap();
    assert_eq!(fragile.force().unwrap(), 7);
}
