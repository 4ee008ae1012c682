//! Property tests for the Cause algebra: `then` is associative, `both` is
//! associative and commutative, and `Empty` is the identity of both.

mod common;

use common::{init_test_logging, test_proptest_config};
use proptest::prelude::*;
use weft_runtime::{Cause, Defect, FiberId, RuntimeFiberId};

fn interruptor(n: u64) -> FiberId {
    FiberId::Runtime(RuntimeFiberId::new(n, 0))
}

fn arb_leaf() -> impl Strategy<Value = Cause<i32>> {
    prop_oneof![
        Just(Cause::Empty),
        (0..8i32).prop_map(Cause::fail),
        prop_oneof![Just("boom"), Just("oops")].prop_map(|m| Cause::die(Defect::new(m))),
        (1..4u64).prop_map(|n| Cause::interrupt(interruptor(n))),
    ]
}

/// Arbitrary trees, built with the raw variants so that unsimplified
/// shapes (e.g. `Then(Empty, x)`) are covered too.
fn arb_cause() -> impl Strategy<Value = Cause<i32>> {
    arb_leaf().prop_recursive(4, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Cause::Then(Box::new(l), Box::new(r))),
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Cause::Both(Box::new(l), Box::new(r))),
            inner.prop_map(Cause::stackless),
        ]
    })
}

proptest! {
    #![proptest_config(test_proptest_config(256))]

    #[test]
    fn then_is_associative(a in arb_cause(), b in arb_cause(), c in arb_cause()) {
        init_test_logging();
        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn both_is_associative(a in arb_cause(), b in arb_cause(), c in arb_cause()) {
        init_test_logging();
        let left = a.clone().both(b.clone()).both(c.clone());
        let right = a.both(b.both(c));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn both_is_commutative(a in arb_cause(), b in arb_cause()) {
        init_test_logging();
        prop_assert_eq!(a.clone().both(b.clone()), b.both(a));
    }

    #[test]
    fn empty_is_identity(a in arb_cause()) {
        init_test_logging();
        prop_assert_eq!(Cause::Empty.then(a.clone()), a.clone());
        prop_assert_eq!(a.clone().then(Cause::Empty), a.clone());
        prop_assert_eq!(Cause::Empty.both(a.clone()), a.clone());
        prop_assert_eq!(a.clone().both(Cause::Empty), a.clone());
        prop_assert_eq!(Cause::Then(Box::new(Cause::Empty), Box::new(a.clone())), a);
    }

    #[test]
    fn stackless_is_transparent(a in arb_cause()) {
        init_test_logging();
        prop_assert_eq!(a.clone().stackless(), a.clone());
        prop_assert_eq!(a.clone().stackless().size(), a.size());
        prop_assert_eq!(a.clone().stackless().is_interrupted(), a.is_interrupted());
    }

    #[test]
    fn map_preserves_shape(a in arb_cause()) {
        init_test_logging();
        let mapped = a.clone().map(|e| e + 100);
        prop_assert_eq!(mapped.size(), a.size());
        prop_assert_eq!(mapped.defects().len(), a.defects().len());
        prop_assert_eq!(mapped.interruptors(), a.interruptors());
    }

    #[test]
    fn interrupted_means_only_interrupts(a in arb_cause()) {
        init_test_logging();
        let only = !a.is_failure() && !a.is_die();
        prop_assert_eq!(a.is_interrupted(), only);
    }
}

#[test]
fn then_is_not_commutative() {
    init_test_logging();
    let a = Cause::<i32>::fail(1);
    let b = Cause::<i32>::fail(2);
    assert_ne!(a.clone().then(b.clone()), b.then(a));
}

#[test]
fn both_is_not_then() {
    init_test_logging();
    let a = Cause::<i32>::fail(1);
    let b = Cause::<i32>::die(Defect::new("boom"));
    assert_ne!(a.clone().both(b.clone()), a.then(b));
}
