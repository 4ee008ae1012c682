//! Scoped resources: finalizer order, exactly-once release, and release
//! under interruption.

mod common;

use std::convert::Infallible;

use common::{init_test_logging, runtime};
use pretty_assertions::assert_eq;
use weft_runtime::{Effect, Exit, Queue, Ref, ReleaseOrder, Scope};

type Log = Ref<Vec<String>>;

fn record(log: &Log, entry: impl Into<String>) -> Effect<(), Infallible> {
    let entry = entry.into();
    log.update(move |mut entries| {
        entries.push(entry);
        entries
    })
}

fn acquire(scope: &Scope, log: &Log, name: &'static str) -> Effect<&'static str, String> {
    let log = log.clone();
    Effect::acquire_release(scope, Effect::succeed(name), move |name, _exit| record(&log, name))
}

#[test]
fn finalizers_run_in_reverse_acquisition_order() {
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let inner = log.clone();
    let program = Effect::<(), String>::scoped(move |scope| {
        acquire(&scope, &inner, "F1")
            .zip_right(acquire(&scope, &inner, "F2"))
            .zip_right(acquire(&scope, &inner, "F3"))
            .zip_right(Effect::fail("body failed".to_string()))
    });

    let exit = runtime.run_sync(program.exit::<String>().zip(log.get()));
    let (exit, entries) = exit.into_result().unwrap();
    assert_eq!(exit, Exit::fail("body failed".to_string()));
    assert_eq!(entries, vec!["F3", "F2", "F1"]);
}

#[test]
fn fifo_scope_releases_in_acquisition_order() {
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let scope = Scope::with_order(ReleaseOrder::Fifo);
    let program = acquire(&scope, &log, "first")
        .zip_right(acquire(&scope, &log, "second"))
        .zip_right(scope.close(Exit::Success(())))
        .zip_right(log.get());
    assert_eq!(
        runtime.run_sync(program),
        Exit::Success(vec!["first".to_string(), "second".to_string()])
    );
}

#[test]
fn finalizer_sees_the_scope_exit() {
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let inner = log.clone();
    let program = Effect::<(), String>::scoped(move |scope| {
        scope
            .add_finalizer(move |exit| {
                let outcome = if exit.is_success() { "success" } else { "failure" };
                record(&inner, outcome)
            })
            .zip_right(Effect::die_message("kaboom"))
    });

    let (exit, entries) = runtime
        .run_sync(program.exit::<String>().zip(log.get()))
        .into_result()
        .unwrap();
    assert!(exit.cause().is_some_and(|cause| cause.is_die()));
    assert_eq!(entries, vec!["failure"]);
}

#[test]
fn closed_scope_runs_new_finalizers_immediately_and_once() {
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let scope = Scope::new();
    let late = log.clone();
    let program = scope
        .close::<String>(Exit::Success(()))
        .zip_right(scope.add_finalizer(move |_| record(&late, "late")))
        .zip(log.get())
        .flat_map({
            let scope = scope.clone();
            move |result| scope.close(Exit::Success(())).as_(result)
        })
        .zip(log.get());

    let ((key, after_add), after_second_close) = runtime.run_sync(program).into_result().unwrap();
    assert_eq!(key, None);
    assert_eq!(after_add, vec!["late"]);
    assert_eq!(after_second_close, vec!["late"]);
    assert!(scope.is_closed());
}

#[test]
fn child_scope_is_closed_by_its_parent() {
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let parent = Scope::new();
    let inner = log.clone();
    let program = parent
        .fork::<String>(ReleaseOrder::Lifo)
        .flat_map(move |child| acquire(&child, &inner, "child resource"))
        .zip_right(parent.close(Exit::Success(())))
        .zip_right(log.get());
    assert_eq!(
        runtime.run_sync(program),
        Exit::Success(vec!["child resource".to_string()])
    );
}

#[test]
fn interrupted_fiber_releases_before_interrupt_returns() {
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let acquired = Queue::<()>::bounded(1);

    let worker_log = log.clone();
    let signal = acquired.clone();
    let worker = Effect::<(), String>::scoped(move |scope| {
        acquire(&scope, &worker_log, "connection")
            .zip_right(signal.offer(()))
            .zip_right(Effect::<(), String>::never())
    });

    let program = worker.fork::<String>().flat_map(move |fiber| {
        acquired
            .take::<String>()
            .zip_right(fiber.interrupt::<String>())
            .zip(log.get())
    });

    let (exit, entries) = runtime.run_sync(program).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(entries, vec!["connection"]);
}

#[test]
fn acquire_use_release_releases_after_defect() {
    init_test_logging();
    let runtime = runtime();
    let log: Log = Ref::new(Vec::new());
    let inner = log.clone();
    let program = Effect::<u32, String>::acquire_use_release(
        Effect::succeed(7u32),
        |_| Effect::die_message("use blew up"),
        move |resource, exit| {
            let entry = format!("released {} after failure: {}", resource, exit.is_failure());
            record(&inner, entry)
        },
    );

    let (exit, entries) = runtime
        .run_sync(program.exit::<String>().zip(log.get()))
        .into_result()
        .unwrap();
    assert!(exit.cause().is_some_and(|cause| cause.is_die()));
    assert_eq!(entries, vec!["released 7 after failure: true"]);
}

#[test]
fn catch_all_does_not_swallow_a_release_defect() {
    init_test_logging();
    let runtime = runtime();
    let program = Effect::<u32, String>::acquire_use_release(
        Effect::succeed(()),
        |_| Effect::fail("use failed".to_string()),
        |_, _| Effect::die_message("release defect"),
    )
    .catch_all(|_| Effect::<u32, String>::succeed(0));

    let exit = runtime.run_sync(program);
    let cause = exit.cause().expect("a release defect must not be recovered");
    let messages: Vec<&str> = cause.defects().into_iter().map(|defect| defect.message()).collect();
    assert!(messages.contains(&"release defect"));
    assert!(cause.failures().is_empty());
}
