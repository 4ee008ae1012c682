//! Ordered registry of finalizers.
//!
//! A `ReleaseMap` is the mutable core of a [`Scope`](crate::Scope). While
//! running it accepts finalizers under monotonically increasing keys;
//! [`ReleaseMap::release_all`] moves it to the exited state and runs every
//! remaining finalizer with the scope's exit. Finalizers added after that
//! run immediately against the stored exit instead of being kept.
//!
//! All transitions happen under a single `parking_lot` mutex, so `add`,
//! `release` and `release_all` are linearizable with respect to each other.
//! Finalizers themselves always run outside the lock.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cause::Cause;
use crate::effect::{Effect, EffectError, ScopeExit};
use crate::exit::Exit;
use crate::fiber::Fiber;

/// A cleanup action run with the exit of the scope that owns it.
pub type Finalizer = Box<dyn FnOnce(ScopeExit) -> Effect<(), Infallible> + Send>;

/// Order in which [`ReleaseMap::release_all`] runs finalizers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseOrder {
    /// Most recently added first.
    #[default]
    Lifo,
    /// Oldest first.
    Fifo,
    /// All at once, each on its own fiber.
    Parallel,
}

enum State {
    Running {
        next_key: u64,
        finalizers: BTreeMap<u64, Finalizer>,
    },
    Exited {
        next_key: u64,
        exit: ScopeExit,
        finalizers_run: bool,
    },
}

/// Shared handle to a finalizer registry.
#[derive(Clone)]
pub struct ReleaseMap {
    state: Arc<Mutex<State>>,
}

impl Default for ReleaseMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReleaseMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseMap")
            .field("pending", &self.len())
            .field("exited", &self.is_exited())
            .finish()
    }
}

impl ReleaseMap {
    /// Create an empty, running map.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::Running {
                next_key: 0,
                finalizers: BTreeMap::new(),
            })),
        }
    }

    /// Check whether [`ReleaseMap::release_all`] has started.
    pub fn is_exited(&self) -> bool {
        matches!(*self.state.lock(), State::Exited { .. })
    }

    /// Check whether every finalizer taken by `release_all` has finished.
    pub fn is_finalized(&self) -> bool {
        matches!(
            *self.state.lock(),
            State::Exited {
                finalizers_run: true,
                ..
            }
        )
    }

    /// The exit the map was released with.
    pub fn exit(&self) -> Option<ScopeExit> {
        match &*self.state.lock() {
            State::Running { .. } => None,
            State::Exited { exit, .. } => Some(exit.clone()),
        }
    }

    /// Number of finalizers waiting to run.
    pub fn len(&self) -> usize {
        match &*self.state.lock() {
            State::Running { finalizers, .. } => finalizers.len(),
            State::Exited { .. } => 0,
        }
    }

    /// Check whether no finalizer is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `finalizer` and return its key.
    ///
    /// If the map has already exited, the finalizer runs right away with
    /// the stored exit, the caller waits for it, and `None` is returned.
    pub fn add<E: EffectError>(&self, finalizer: Finalizer) -> Effect<Option<u64>, E> {
        let map = self.clone();
        Effect::suspend(move || {
            let mut state = map.state.lock();
            match &mut *state {
                State::Running {
                    next_key,
                    finalizers,
                } => {
                    let key = *next_key;
                    *next_key += 1;
                    finalizers.insert(key, finalizer);
                    Effect::succeed(Some(key))
                }
                State::Exited { next_key, exit, .. } => {
                    *next_key += 1;
                    let exit = exit.clone();
                    drop(state);
                    finalizer(exit).widen_error().uninterruptible().as_(None)
                }
            }
        })
    }

    /// Run and remove the finalizer under `key`, independently of the rest
    /// of the map. Unknown keys are ignored.
    pub fn release<E: EffectError>(&self, key: u64, exit: ScopeExit) -> Effect<(), E> {
        let map = self.clone();
        Effect::suspend(move || match map.remove(key) {
            Some(finalizer) => finalizer(exit).widen_error().uninterruptible(),
            None => Effect::unit(),
        })
    }

    /// Remove the finalizer under `key` without running it.
    pub fn remove(&self, key: u64) -> Option<Finalizer> {
        match &mut *self.state.lock() {
            State::Running { finalizers, .. } => finalizers.remove(&key),
            State::Exited { .. } => None,
        }
    }

    /// Put `finalizer` under `key`, returning the finalizer it displaces
    /// unrun. If the map has exited, `finalizer` runs right away with the
    /// stored exit and `None` is returned.
    pub fn replace<E: EffectError>(
        &self,
        key: u64,
        finalizer: Finalizer,
    ) -> Effect<Option<Finalizer>, E> {
        let map = self.clone();
        Effect::suspend(move || {
            let mut state = map.state.lock();
            match &mut *state {
                State::Running { finalizers, .. } => {
                    Effect::succeed(finalizers.insert(key, finalizer))
                }
                State::Exited { exit, .. } => {
                    let exit = exit.clone();
                    drop(state);
                    finalizer(exit).widen_error().uninterruptible().as_(None)
                }
            }
        })
    }

    /// Exit the map and run every remaining finalizer with `exit`.
    ///
    /// Finalizer failures are kept: sequential orders combine them with
    /// `then` in the order the finalizers ran, the parallel order with
    /// `both`. Calling this on an exited map does nothing. The whole
    /// release runs uninterruptibly.
    pub fn release_all<E: EffectError>(
        &self,
        exit: ScopeExit,
        order: ReleaseOrder,
    ) -> Effect<(), E> {
        let map = self.clone();
        Effect::suspend(move || {
            let finalizers = {
                let mut state = map.state.lock();
                let (next_key, finalizers) = match &mut *state {
                    State::Exited { .. } => return Effect::unit(),
                    State::Running {
                        next_key,
                        finalizers,
                    } => (*next_key, std::mem::take(finalizers)),
                };
                *state = State::Exited {
                    next_key,
                    exit: exit.clone(),
                    finalizers_run: false,
                };
                finalizers
            };
            debug!(finalizers = finalizers.len(), ?order, "releasing scope");

            let done = map.clone();
            run_finalizers(finalizers, exit, order).flat_map(move |outcome| {
                if let State::Exited { finalizers_run, .. } = &mut *done.state.lock() {
                    *finalizers_run = true;
                }
                Effect::from_exit(outcome.widen())
            })
        })
        .uninterruptible()
    }
}

/// Run finalizers in `order`, collecting their combined outcome.
fn run_finalizers<E: EffectError>(
    finalizers: BTreeMap<u64, Finalizer>,
    exit: ScopeExit,
    order: ReleaseOrder,
) -> Effect<Exit<(), Infallible>, E> {
    let ordered: Vec<Finalizer> = match order {
        ReleaseOrder::Lifo => finalizers.into_values().rev().collect(),
        ReleaseOrder::Fifo | ReleaseOrder::Parallel => finalizers.into_values().collect(),
    };

    if order == ReleaseOrder::Parallel {
        let exit_for_each = exit;
        return Effect::for_each(ordered, move |finalizer| {
            finalizer(exit_for_each.clone()).fork::<E>()
        })
        .flat_map(Fiber::await_all)
        .map(Exit::as_unit);
    }

    Effect::for_each(ordered, move |finalizer| finalizer(exit.clone()).exit::<E>()).map(|exits| {
        let mut combined: Cause<Infallible> = Cause::Empty;
        for outcome in exits {
            if let Exit::Failure(cause) = outcome {
                combined = combined.then(cause);
            }
        }
        if combined.is_empty() {
            Exit::Success(())
        } else {
            Exit::Failure(combined)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Defect;
    use crate::{Runtime, RuntimeConfig};
    use pretty_assertions::assert_eq;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().with_workers(2)).unwrap()
    }

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str) -> Finalizer {
        let log = Arc::clone(log);
        Box::new(move |_| {
            Effect::sync(move || {
                log.lock().push(name.to_string());
            })
        })
    }

    fn failing(message: &'static str) -> Finalizer {
        Box::new(move |_| Effect::die_message(message))
    }

    #[test]
    fn test_release_all_is_lifo_by_default() {
        let rt = runtime();
        let log: Log = Arc::default();
        let map = ReleaseMap::new();
        for name in ["f1", "f2", "f3"] {
            rt.run_sync(map.add::<Infallible>(recording(&log, name)));
        }
        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::default()));
        assert_eq!(*log.lock(), vec!["f3", "f2", "f1"]);
        assert!(map.is_finalized());
    }

    #[test]
    fn test_release_all_fifo() {
        let rt = runtime();
        let log: Log = Arc::default();
        let map = ReleaseMap::new();
        for name in ["f1", "f2"] {
            rt.run_sync(map.add::<Infallible>(recording(&log, name)));
        }
        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Fifo));
        assert_eq!(*log.lock(), vec!["f1", "f2"]);
    }

    #[test]
    fn test_add_after_exit_runs_immediately() {
        let rt = runtime();
        let log: Log = Arc::default();
        let map = ReleaseMap::new();
        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Lifo));

        let key = rt.run_sync(map.add::<Infallible>(recording(&log, "late")));
        assert_eq!(key, Exit::Success(None));
        assert_eq!(*log.lock(), vec!["late"]);

        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Lifo));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_late_finalizer_sees_stored_exit() {
        let rt = runtime();
        let seen: Arc<Mutex<Option<ScopeExit>>> = Arc::default();
        let slot = Arc::clone(&seen);
        let map = ReleaseMap::new();
        let stored: ScopeExit = Exit::die(Defect::new("closed badly"));
        let release = map.release_all::<Infallible>(stored.clone(), ReleaseOrder::Lifo);
        rt.run_sync(release.exit::<Infallible>());
        rt.run_sync(map.add::<Infallible>(Box::new(move |exit| {
            Effect::sync(move || {
                *slot.lock() = Some(exit);
            })
        })));
        assert_eq!(*seen.lock(), Some(stored));
    }

    #[test]
    fn test_release_single_key() {
        let rt = runtime();
        let log: Log = Arc::default();
        let map = ReleaseMap::new();
        let first = rt.run_sync(map.add::<Infallible>(recording(&log, "first")));
        rt.run_sync(map.add::<Infallible>(recording(&log, "second")));
        let key = first.into_result().unwrap().unwrap();

        rt.run_sync(map.release::<Infallible>(key, Exit::Success(())));
        assert_eq!(*log.lock(), vec!["first"]);
        assert_eq!(map.len(), 1);

        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Lifo));
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_replace_returns_old_unrun() {
        let rt = runtime();
        let log: Log = Arc::default();
        let map = ReleaseMap::new();
        let key = rt
            .run_sync(map.add::<Infallible>(recording(&log, "old")))
            .into_result()
            .unwrap()
            .unwrap();
        let had_old = rt
            .run_sync(
                map.replace::<Infallible>(key, recording(&log, "new"))
                    .map(|old| old.is_some()),
            )
            .into_result()
            .unwrap();
        assert!(had_old);
        assert!(log.lock().is_empty());

        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Lifo));
        assert_eq!(*log.lock(), vec!["new"]);
    }

    #[test]
    fn test_replace_after_exit_runs_new() {
        let rt = runtime();
        let log: Log = Arc::default();
        let map = ReleaseMap::new();
        rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Lifo));
        let had_old = rt
            .run_sync(map.replace::<Infallible>(0, recording(&log, "new")).map(|old| old.is_some()))
            .into_result()
            .unwrap();
        assert!(!had_old);
        assert_eq!(*log.lock(), vec!["new"]);
    }

    #[test]
    fn test_finalizer_failures_chain_in_run_order() {
        let rt = runtime();
        let map = ReleaseMap::new();
        rt.run_sync(map.add::<Infallible>(failing("first added")));
        rt.run_sync(map.add::<Infallible>(failing("second added")));
        let exit =
            rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Lifo));
        let expected: Cause<Infallible> = Cause::die(Defect::new("second added"))
            .then(Cause::die(Defect::new("first added")));
        assert_eq!(exit, Exit::Failure(expected));
    }

    #[test]
    fn test_parallel_failures_use_both() {
        let rt = runtime();
        let map = ReleaseMap::new();
        rt.run_sync(map.add::<Infallible>(failing("a")));
        rt.run_sync(map.add::<Infallible>(failing("b")));
        let exit =
            rt.run_sync(map.release_all::<Infallible>(Exit::Success(()), ReleaseOrder::Parallel));
        let cause = exit.cause().unwrap();
        assert!(matches!(cause, Cause::Both(_, _)));
        assert_eq!(cause.defects().len(), 2);
    }
}
