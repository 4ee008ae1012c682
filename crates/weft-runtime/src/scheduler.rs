//! The work-scheduling seam between fibers and threads.

/// A unit of work: one slice of a fiber's run loop.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on some set of threads.
///
/// Fibers never block a thread; a task runs until its fiber suspends,
/// yields or finishes, then returns.
pub trait Scheduler: Send + Sync {
    /// Queue `task` for execution.
    fn schedule(&self, task: Task);

    /// Stop accepting work and let the threads exit once idle.
    fn shutdown(&self) {}
}
