//! End-to-end scenarios across many fibers: shared counters, races,
//! producer/consumer queues and virtual-time timeouts.

mod common;

use std::time::Duration;

use common::{runtime, test_runtime};
use pretty_assertions::assert_eq;
use weft_runtime::{
    Cause, Defect, Effect, Exit, Fiber, Queue, Ref, Runtime, RuntimeConfig, Schedule,
};

#[test]
fn hundred_fibers_hundred_updates() {
    let runtime = runtime();
    let counter = Ref::new(0u64);
    let worker = {
        let counter = counter.clone();
        move || {
            let counter = counter.clone();
            Effect::<(), String>::repeat_n(move || counter.update(|n| n + 1), 99)
        }
    };

    let program = Effect::<Fiber<(), String>, String>::for_each(0..100, move |_| worker().fork())
        .flat_map(Fiber::await_all::<String>)
        .flat_map(Effect::from_exit)
        .zip_right(counter.get());
    assert_eq!(runtime.run_sync(program), Exit::Success(10_000));
}

#[test]
fn hundred_fibers_on_a_single_thread() {
    let runtime = Runtime::new(RuntimeConfig::new().single_threaded()).unwrap();
    let counter = Ref::new(0u64);
    let inner = counter.clone();
    let program = Effect::<(), String>::for_each_par(0..100, move |_| {
        let counter = inner.clone();
        Effect::repeat_n(move || counter.update(|n| n + 1), 99)
    })
    .zip_right(counter.get());
    assert_eq!(runtime.run_sync(program), Exit::Success(10_000));
}

#[test]
fn race_keeps_both_failures() {
    let runtime = runtime();
    let left = Effect::<u32, String>::fail("left".to_string());
    let right = Effect::<u32, String>::die(Defect::new("right"));
    let exit = runtime.run_sync(left.race(right));

    let cause = exit.cause().cloned().unwrap_or_default();
    assert_eq!(cause.failures(), vec![&"left".to_string()]);
    assert_eq!(cause.defects().len(), 1);
    assert_eq!(
        cause.clone().stackless(),
        Cause::fail("left".to_string()).both(Cause::die(Defect::new("right")))
    );
}

#[test]
fn race_prefers_a_late_success_over_an_early_failure() {
    let runtime = runtime();
    let fast_failure = Effect::<u32, String>::fail("fast".to_string());
    let slow_success = Effect::<(), String>::yield_now().zip_right(Effect::succeed(7));
    assert_eq!(runtime.run_sync(fast_failure.race(slow_success)), Exit::Success(7));
}

#[test]
fn producers_and_consumers_share_a_bounded_queue() {
    let runtime = runtime();
    let queue = Queue::<u32>::bounded(4);
    let producers = {
        let queue = queue.clone();
        Effect::<(), String>::for_each_par(0..4u32, move |p| {
            let queue = queue.clone();
            Effect::for_each(0..25u32, move |i| queue.offer(p * 100 + i)).as_unit()
        })
    };
    let consumer = {
        let queue = queue.clone();
        Effect::<u32, String>::for_each(0..100, move |_| queue.take())
    };

    let (_, mut received) = runtime
        .run_sync(producers.zip_par(consumer))
        .into_result()
        .unwrap();
    received.sort_unstable();
    let expected: Vec<u32> = (0..4).flat_map(|p| (0..25).map(move |i| p * 100 + i)).collect();
    assert_eq!(received, expected);
}

#[test]
fn timeout_on_virtual_time() {
    let (runtime, clock) = test_runtime();
    let slow = Effect::<(), String>::sleep(Duration::from_secs(10)).as_("done");
    let fiber = runtime.run_fork(slow.timeout(Duration::from_secs(1)));

    assert!(clock.wait_for_sleepers(2, Duration::from_secs(5)));
    clock.adjust(Duration::from_secs(1));
    assert_eq!(fiber.await_blocking(), Exit::Success(None));
    assert_eq!(clock.sleepers(), 0);
}

#[test]
fn saturated_backoff_keeps_sleeping() {
    let (runtime, clock) = test_runtime();
    clock.adjust(Duration::from_millis(1));
    let backoff = Schedule::exponential_with_factor(Duration::from_millis(1), f64::MAX);
    let doomed = Effect::<u32, String>::retry(|| Effect::fail("down".to_string()), backoff);
    let fiber = runtime.run_fork(doomed);

    assert!(clock.wait_for_sleepers(1, Duration::from_secs(5)));
    clock.adjust(Duration::from_millis(1));
    // The second delay saturates at Duration::MAX.
    assert!(clock.wait_for_sleepers(1, Duration::from_secs(5)));
    clock.adjust(Duration::from_secs(3600));
    assert_eq!(fiber.poll(), None);

    let exit = runtime.run_sync(fiber.interrupt::<String>()).into_result().unwrap();
    assert!(exit.is_interrupted());
}

#[test]
fn fixed_retry_succeeds_on_virtual_time() {
    let (runtime, clock) = test_runtime();
    let attempts = Ref::new(0u32);
    let counter = attempts.clone();
    let flaky = Effect::<u32, String>::retry(
        move || {
            counter.update_and_get(|n| n + 1).flat_map(|n| {
                if n < 3 {
                    Effect::fail("unavailable".to_string())
                } else {
                    Effect::succeed(n)
                }
            })
        },
        Schedule::spaced(Duration::from_millis(50)),
    );
    let fiber = runtime.run_fork(flaky.zip(Effect::clock_millis()));

    for _ in 0..2 {
        assert!(clock.wait_for_sleepers(1, Duration::from_secs(5)));
        clock.adjust(Duration::from_millis(50));
    }
    assert_eq!(fiber.await_blocking(), Exit::Success((3, 100)));
}

#[test]
fn for_each_par_reports_the_first_failure() {
    let runtime = runtime();
    let program = Effect::<u32, String>::for_each_par(0..10u32, |i| {
        if i == 4 {
            Effect::fail(format!("item {}", i))
        } else {
            Effect::<(), String>::yield_now().as_(i)
        }
    });
    assert_eq!(runtime.run_sync(program), Exit::fail("item 4".to_string()));
}
