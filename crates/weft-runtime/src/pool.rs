//! Work-stealing thread pool scheduler.
//!
//! Tasks scheduled from outside the pool land in a shared injector. Tasks
//! scheduled from one of its workers (a fiber forking or waking another)
//! stay on that worker's FIFO queue, where idle workers steal them. A
//! panicking task is logged and its worker carries on.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle as StdJoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::cause::Defect;
use crate::error::RuntimeError;
use crate::scheduler::{Scheduler, Task};

/// The local queue of the pool worker running on this thread.
struct LocalQueue {
    pool: usize,
    worker: Worker<Task>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

struct PoolInner {
    injector: Injector<Task>,
    /// One per worker, indexed by worker id.
    stealers: Vec<Stealer<Task>>,
    /// Queued or running.
    pending_tasks: AtomicUsize,
    shutdown: AtomicBool,
    idle: Condvar,
    idle_lock: Mutex<()>,
    num_workers: usize,
}

impl PoolInner {
    /// Identity used to match a thread's local queue to its pool.
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// Own queue first, then the injector, then the other workers starting
    /// from our right-hand neighbour.
    fn find_task(&self, local: &Worker<Task>, worker_id: usize) -> Option<Task> {
        if let Some(task) = local.pop() {
            return Some(task);
        }

        if let Some(task) = retry_steal(|| self.injector.steal()) {
            return Some(task);
        }

        let n = self.stealers.len();
        (1..n)
            .map(|offset| &self.stealers[(worker_id + offset) % n])
            .find_map(|stealer| retry_steal(|| stealer.steal()))
    }

    fn run(&self, task: Task) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            let defect = Defect::from_panic(panic);
            error!(panic = %defect, "worker task panicked");
        }
        self.pending_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A fixed set of worker threads sharing fiber tasks by work stealing.
///
/// Dropping the pool stops the workers after their current task and
/// joins them. Tasks still queued are dropped with it.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<StdJoinHandle<()>>>,
}

impl ThreadPool {
    /// Create a thread pool with one worker per available CPU.
    pub fn new() -> Result<Self, RuntimeError> {
        let num_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(num_workers)
    }

    pub fn with_workers(num_workers: usize) -> Result<Self, RuntimeError> {
        Self::with_config(num_workers, "weft-worker", None)
    }

    /// Workers are named `{thread_name_prefix}-{id}`.
    pub fn with_config(
        num_workers: usize,
        thread_name_prefix: &str,
        stack_size: Option<usize>,
    ) -> Result<Self, RuntimeError> {
        let num_workers = num_workers.max(1);

        let local_queues: Vec<Worker<Task>> =
            (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Task>> = local_queues.iter().map(|w| w.stealer()).collect();

        let inner = Arc::new(PoolInner {
            injector: Injector::new(),
            stealers,
            pending_tasks: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
            num_workers,
        });

        let pool = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for (worker_id, local_queue) in local_queues.into_iter().enumerate() {
            let inner = Arc::clone(&pool.inner);
            let mut builder =
                thread::Builder::new().name(format!("{}-{}", thread_name_prefix, worker_id));
            if let Some(size) = stack_size {
                builder = builder.stack_size(size);
            }
            // On failure, dropping `pool` shuts down the workers already
            // spawned.
            let worker = builder
                .spawn(move || worker_loop(inner, local_queue, worker_id))
                .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
            pool.workers.lock().push(worker);
        }

        debug!(workers = num_workers, "thread pool started");
        Ok(pool)
    }

    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Queued or running tasks.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending_tasks.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Scheduler for ThreadPool {
    fn schedule(&self, task: Task) {
        if self.is_shutdown() {
            return;
        }
        self.inner.pending_tasks.fetch_add(1, Ordering::AcqRel);

        let key = self.inner.key();
        let task = LOCAL.with(|local| {
            if let Some(queue) = local.borrow().as_ref() {
                if queue.pool == key {
                    queue.worker.push(task);
                    return None;
                }
            }
            Some(task)
        });
        if let Some(task) = task {
            self.inner.injector.push(task);
        }
        self.inner.idle.notify_one();
    }

    fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            debug!("thread pool shutting down");
        }
        self.inner.idle.notify_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        Scheduler::shutdown(self);

        // The last handle may be dropped by one of the pool's own workers.
        let current = thread::current().id();
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

fn retry_steal(mut steal: impl FnMut() -> Steal<Task>) -> Option<Task> {
    loop {
        match steal() {
            Steal::Success(task) => return Some(task),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, local: Worker<Task>, worker_id: usize) {
    let key = inner.key();
    LOCAL.with(|slot| {
        *slot.borrow_mut() = Some(LocalQueue { pool: key, worker: local });
    });

    let next_task = || {
        LOCAL.with(|slot| {
            slot.borrow()
                .as_ref()
                .and_then(|queue| inner.find_task(&queue.worker, worker_id))
        })
    };

    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(task) = next_task() {
            inner.run(task);
            continue;
        }

        let mut guard = inner.idle_lock.lock();
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(task) = next_task() {
            drop(guard);
            inner.run(task);
            continue;
        }
        // Pushes to other workers' local queues do not notify; poll for them.
        let _ = inner.idle.wait_for(&mut guard, Duration::from_millis(1));
    }

    LOCAL.with(|slot| slot.borrow_mut().take());
}
