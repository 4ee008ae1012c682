//! Weft Runtime - fiber concurrency core of the weft effect system
//!
//! This crate provides the runtime half of weft:
//! - `Effect<A, E>` - A lazy description of a computation
//! - `Cause<E>` / `Exit<A, E>` - Lossless record of why a fiber ended
//! - `Fiber<A, E>` - Handle to a running effect: await, join, interrupt
//! - `Runtime` - Scheduler, clock and root FiberRefs that run effects
//! - `Scope` / `ReleaseMap` - Finalizers released exactly once on close
//! - `FiberRef<A>` - Fiber-local values with fork/join semantics
//! - `Ref<A>`, `Queue<A>`, `Schedule` - Shared state, hand-off and retry
//!
//! # Design Goals
//!
//! - Structured concurrency: forked fibers are supervised by their parent
//! - Nothing is lost: concurrent failures, defects and interruptions are
//!   all kept in the `Cause`
//! - Resource safety: a finalizer runs exactly once, whatever the exit
//! - Fibers are cheap: a suspended fiber holds no thread
//!
//! # Interruption
//!
//! Interruption is asynchronous and cooperative. A fiber observes a signal
//! only between instructions of an interruptible region; uninterruptible
//! regions run to completion and see the signal when they end.

pub mod cause;
pub mod clock;
pub mod effect;
pub mod error;
pub mod event_loop;
pub mod exit;
pub mod fiber;
pub mod fiber_id;
pub mod fiber_ref;
pub mod pool;
pub mod queue;
pub mod race;
pub mod release_map;
pub mod runtime;
pub mod schedule;
pub mod scheduler;
pub mod scope;
pub mod sync_ref;
pub mod timer;

pub use cause::{Cause, Defect};
pub use clock::{Clock, LiveClock, TestClock};
pub use effect::{AnyError, Callback, Effect, EffectError, EffectValue, Restore, ScopeExit};
pub use error::{FiberFailure, RuntimeError};
pub use event_loop::EventLoop;
pub use exit::Exit;
pub use fiber::{Fiber, FiberStatus};
pub use fiber_id::{FiberId, RuntimeFiberId};
pub use fiber_ref::{FiberRef, FiberRefs};
pub use pool::ThreadPool;
pub use queue::Queue;
pub use release_map::{Finalizer, ReleaseMap, ReleaseOrder};
pub use runtime::{Runtime, RuntimeBuilder};
pub use schedule::Schedule;
pub use scheduler::{Scheduler, Task};
pub use scope::Scope;
pub use sync_ref::Ref;
pub use timer::{TimerHandle, TimerWheel};

/// Default number of instructions a fiber runs before yielding its thread.
pub const DEFAULT_MAX_OPS_BEFORE_YIELD: usize = 2048;

/// Which scheduler a runtime runs its fibers on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerKind {
    /// A work-stealing pool of `workers` threads.
    WorkStealing { workers: usize },
    /// One thread, tasks in submission order.
    SingleThreaded,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        SchedulerKind::WorkStealing { workers }
    }
}

/// Configuration for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Scheduler to run fibers on
    pub scheduler: SchedulerKind,
    /// Name prefix for spawned threads
    pub thread_name_prefix: String,
    /// Stack size for spawned threads (bytes)
    pub stack_size: Option<usize>,
    /// Instructions a fiber runs before giving its thread back
    pub max_ops_before_yield: usize,
    /// Log failures of root fibers that nobody observes
    pub report_unhandled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerKind::default(),
            thread_name_prefix: "weft-worker".to_string(),
            stack_size: None,
            max_ops_before_yield: DEFAULT_MAX_OPS_BEFORE_YIELD,
            report_unhandled: true,
        }
    }
}

impl RuntimeConfig {
    /// Create a new runtime configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a work-stealing pool with `workers` threads (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.scheduler = SchedulerKind::WorkStealing {
            workers: workers.max(1),
        };
        self
    }

    /// Run every fiber on a single thread.
    pub fn single_threaded(mut self) -> Self {
        self.scheduler = SchedulerKind::SingleThreaded;
        self
    }

    /// Set the scheduler.
    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for spawned threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Set how many instructions a fiber runs before yielding.
    pub fn with_max_ops_before_yield(mut self, ops: usize) -> Self {
        self.max_ops_before_yield = ops.max(1);
        self
    }

    /// Enable or disable logging of unobserved failures.
    pub fn with_report_unhandled(mut self, report: bool) -> Self {
        self.report_unhandled = report;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thread_name_prefix, "weft-worker");
        assert!(config.stack_size.is_none());
        assert_eq!(config.max_ops_before_yield, 2048);
        assert!(config.report_unhandled);
        assert!(matches!(config.scheduler, SchedulerKind::WorkStealing { workers } if workers > 0));
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new()
            .with_thread_name_prefix("custom")
            .with_stack_size(1024 * 1024)
            .with_workers(0)
            .with_max_ops_before_yield(64)
            .with_report_unhandled(false);

        assert_eq!(config.thread_name_prefix, "custom");
        assert_eq!(config.stack_size, Some(1024 * 1024));
        assert_eq!(config.scheduler, SchedulerKind::WorkStealing { workers: 1 });
        assert_eq!(config.max_ops_before_yield, 64);
        assert!(!config.report_unhandled);
        assert_eq!(config.single_threaded().scheduler, SchedulerKind::SingleThreaded);
    }
}
