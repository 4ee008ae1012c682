//! Single-threaded scheduler.
//!
//! Every task runs on one dedicated thread, in submission order. Useful for
//! deterministic tests and for embedding the runtime next to code that is
//! not thread-safe.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::RuntimeError;
use crate::scheduler::{Scheduler, Task};

enum Message {
    Run(Task),
    Shutdown,
}

/// A scheduler backed by one thread draining a FIFO channel.
pub struct EventLoop {
    sender: Sender<Message>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Start the loop on a thread called `thread_name`.
    pub fn new(thread_name: &str, stack_size: Option<usize>) -> Result<Self, RuntimeError> {
        let (sender, receiver) = unbounded::<Message>();

        let mut builder = thread::Builder::new().name(thread_name.to_string());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder
            .spawn(move || {
                for message in receiver {
                    match message {
                        Message::Run(task) => {
                            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!("event loop task panicked");
                            }
                        }
                        Message::Shutdown => break,
                    }
                }
                debug!("event loop stopped");
            })
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            sender,
            thread: Mutex::new(Some(handle)),
        })
    }
}

impl Scheduler for EventLoop {
    fn schedule(&self, task: Task) {
        // Fails only after shutdown; the task is dropped.
        let _ = self.sender.send(Message::Run(task));
    }

    fn shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        Scheduler::shutdown(self);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_tasks_run_in_order_on_one_thread() {
        let event_loop = EventLoop::new("weft-loop-test", None).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::bounded(1);

        for i in 0..50 {
            let log = Arc::clone(&log);
            event_loop.schedule(Box::new(move || {
                log.lock().push((i, thread::current().id()));
            }));
        }
        event_loop.schedule(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let log = log.lock();
        assert_eq!(log.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..50).collect::<Vec<_>>());
        assert!(log.iter().all(|(_, id)| *id == log[0].1));
    }

    #[test]
    fn test_loop_survives_panics() {
        let event_loop = EventLoop::new("weft-loop-test", None).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        event_loop.schedule(Box::new(|| panic!("boom")));
        event_loop.schedule(Box::new(move || {
            let _ = tx.send(1);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }
}
