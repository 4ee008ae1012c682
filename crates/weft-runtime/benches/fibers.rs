//! Fiber runtime benchmarks
//!
//! Measures the interpreter and scheduler hot paths:
//! - Sequential flat_map chains on one fiber
//! - Fork/join of single and many fibers
//! - Parallel traversal and queue hand-off

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use weft_runtime::{Effect, Fiber, Queue, Runtime, RuntimeConfig};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::new().with_report_unhandled(false)).expect("runtime")
}

fn chain(n: u64) -> Effect<u64, String> {
    (0..n).fold(Effect::succeed(0u64), |acc, i| acc.flat_map(move |sum| Effect::succeed(sum + i)))
}

// ============================================================================
// Interpreter Benchmarks
// ============================================================================

fn bench_run_sync(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("run_sync");

    group.bench_function("succeed", |b| {
        b.iter(|| runtime.run_sync(Effect::<u64, String>::succeed(black_box(42))))
    });

    for len in [100u64, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*len));
        group.bench_with_input(BenchmarkId::new("flat_map_chain", len), len, |b, &n| {
            b.iter(|| runtime.run_sync(chain(n)))
        });
    }

    group.bench_function("catch_all", |b| {
        b.iter(|| {
            let effect = Effect::<u64, String>::fail("boom".to_string())
                .catch_all(|_| Effect::<u64, String>::succeed(1));
            runtime.run_sync(effect)
        })
    });

    group.finish();
}

// ============================================================================
// Fork/Join Benchmarks
// ============================================================================

fn bench_fork_join(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("fork_join");

    group.bench_function("single", |b| {
        b.iter(|| {
            let effect = Effect::<u64, String>::succeed(black_box(7))
                .fork::<String>()
                .flat_map(|fiber| fiber.join());
            runtime.run_sync(effect)
        })
    });

    for fibers in [10usize, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*fibers as u64));
        group.bench_with_input(BenchmarkId::new("await_all", fibers), fibers, |b, &n| {
            b.iter(|| {
                let forks = Effect::<Fiber<u64, String>, String>::for_each(0..n as u64, |i| {
                    chain(i % 16).fork()
                });
                let effect = forks.flat_map(Fiber::await_all::<String>);
                runtime.run_sync(effect)
            })
        });
    }

    group.finish();
}

// ============================================================================
// Concurrency Pattern Benchmarks
// ============================================================================

fn bench_patterns(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("patterns");

    for items in [10u64, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(*items));
        group.bench_with_input(BenchmarkId::new("for_each_par", items), items, |b, &n| {
            b.iter(|| {
                let effect = Effect::<u64, String>::for_each_par(0..n, |i| Effect::succeed(i * 2));
                runtime.run_sync(effect)
            })
        });
    }

    group.bench_function("race", |b| {
        b.iter(|| {
            let effect = Effect::<u64, String>::succeed(1).race(Effect::never());
            runtime.run_sync(effect)
        })
    });

    for messages in [100u32, 1_000].iter() {
        group.throughput(Throughput::Elements(*messages as u64));
        group.bench_with_input(BenchmarkId::new("queue_handoff", messages), messages, |b, &n| {
            b.iter(|| {
                let queue = Queue::<u32>::bounded(16);
                let producer = {
                    let queue = queue.clone();
                    Effect::<(), String>::for_each(0..n, move |i| queue.offer(i)).as_unit()
                };
                let consumer = Effect::<u32, String>::for_each(0..n, move |_| queue.take());
                runtime.run_sync(producer.zip_par(consumer))
            })
        });
    }

    group.finish();
}

criterion_group!(interpreter_benches, bench_run_sync);
criterion_group!(fork_benches, bench_fork_join);
criterion_group!(pattern_benches, bench_patterns);

criterion_main!(interpreter_benches, fork_benches, pattern_benches);
