//! The runtime: the value that owns a scheduler, a clock and the root
//! FiberRefs, and turns effects into running fibers.
//!
//! There is no global runtime. Every root fiber is started through a
//! [`Runtime`] value, and every fiber keeps a handle to the runtime that
//! started it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cause::Defect;
use crate::clock::{Clock, LiveClock};
use crate::effect::{Effect, EffectError};
use crate::error::RuntimeError;
use crate::event_loop::EventLoop;
use crate::exit::Exit;
use crate::fiber::{fiber_body, recover_exit, ExitSlot, Fiber, FiberContext, Observer};
use crate::fiber_ref::FiberRefs;
use crate::pool::ThreadPool;
use crate::scheduler::{Scheduler, Task};
use crate::{RuntimeConfig, SchedulerKind};

/// Handle to a running runtime. Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    fiber_refs: FiberRefs,
    shutdown: AtomicBool,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.clock.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Runtime {
    /// Start a runtime with the scheduler and live clock described by
    /// `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::builder().config(config).build()
    }

    /// Start building a runtime with injected parts.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The clock fibers sleep on.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// The FiberRefs every root fiber starts with.
    pub fn fiber_refs(&self) -> &FiberRefs {
        &self.inner.fiber_refs
    }

    pub(crate) fn schedule(&self, task: Task) {
        self.inner.scheduler.schedule(task);
    }

    /// Start `effect` on a new root fiber and return without waiting.
    pub fn run_fork<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
    {
        self.start(effect, None)
    }

    /// Start `effect` on a new root fiber and call `on_exit` with its exit.
    ///
    /// The callback runs on whichever thread completes the fiber.
    pub fn run_callback<A, E, F>(&self, effect: Effect<A, E>, on_exit: F) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
        F: FnOnce(Exit<A, E>) + Send + 'static,
    {
        self.start(effect, Some(Box::new(move |exit| on_exit(recover_exit(exit)))))
    }

    /// Run `effect` to completion, blocking the calling thread.
    ///
    /// Must not be called from inside a fiber on a single-threaded
    /// runtime: the fiber would wait on its own thread.
    pub fn run_sync<A, E>(&self, effect: Effect<A, E>) -> Exit<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
    {
        if self.is_shutdown() {
            return Exit::die(Defect::from_error(RuntimeError::Shutdown));
        }
        let slot = Arc::new(ExitSlot::new());
        self.start(effect, Some(slot.observer()));
        recover_exit(&slot.wait())
    }

    fn start<A, E>(&self, effect: Effect<A, E>, observer: Option<Observer>) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: EffectError,
    {
        let context = FiberContext::new(self.clone(), None);
        // Attached before the first instruction so a fast failure counts as
        // observed.
        if let Some(observer) = observer {
            context.add_observer(observer);
        }
        context.start(fiber_body(effect), self.inner.fiber_refs.clone(), true);
        Fiber::new(context)
    }

    /// Stop the scheduler and the clock. Fibers that have not finished
    /// never will; later work is dropped.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("runtime shutting down");
        self.inner.scheduler.shutdown();
        self.inner.clock.shutdown();
    }

    /// Whether [`Runtime::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

/// Builder for a [`Runtime`] with an injected clock, scheduler or root
/// FiberRefs. Parts left unset come from the [`RuntimeConfig`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    clock: Option<Arc<dyn Clock>>,
    fiber_refs: FiberRefs,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn fiber_refs(mut self, fiber_refs: FiberRefs) -> Self {
        self.fiber_refs = fiber_refs;
        self
    }

    /// Start the runtime's threads.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => match config.scheduler {
                SchedulerKind::WorkStealing { workers } => Arc::new(ThreadPool::with_config(
                    workers,
                    &config.thread_name_prefix,
                    config.stack_size,
                )?),
                SchedulerKind::SingleThreaded => Arc::new(EventLoop::new(
                    &format!("{}-loop", config.thread_name_prefix),
                    config.stack_size,
                )?),
            },
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(LiveClock::new(&format!("{}-timer", config.thread_name_prefix))?),
        };
        debug!(scheduler = ?config.scheduler, "runtime started");

        Ok(Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                scheduler,
                clock,
                fiber_refs: self.fiber_refs,
                shutdown: AtomicBool::new(false),
            }),
        })
    }
}
