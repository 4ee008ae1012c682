//! A fiber-aware bounded queue.
//!
//! `take` on an empty queue and `offer` on a full one suspend the calling
//! fiber instead of blocking a thread. Shutting the queue down interrupts
//! every suspended fiber and every later caller.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::effect::{Effect, EffectError, EffectValue};

type Taker<A> = Box<dyn FnOnce(Option<A>) + Send>;
type Wake = Box<dyn FnOnce(bool) + Send>;

struct Offerer<A> {
    id: u64,
    item: A,
    wake: Wake,
}

struct State<A> {
    items: VecDeque<A>,
    takers: VecDeque<(u64, Taker<A>)>,
    offerers: VecDeque<Offerer<A>>,
    next_id: u64,
    shutdown: bool,
}

impl<A> State<A> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Move the first suspended offerer's item into the freed slot.
    fn admit_offerer(&mut self) -> Option<Wake> {
        let offerer = self.offerers.pop_front()?;
        self.items.push_back(offerer.item);
        Some(offerer.wake)
    }
}

struct Inner<A> {
    capacity: usize,
    state: Mutex<State<A>>,
}

/// A bounded multi-producer, multi-consumer queue for fibers.
pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Queue")
            .field("capacity", &self.inner.capacity)
            .field("len", &state.items.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl<A: EffectValue> Queue<A> {
    /// A queue holding at most `capacity` items (at least one).
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    takers: VecDeque::new(),
                    offerers: VecDeque::new(),
                    next_id: 0,
                    shutdown: false,
                }),
            }),
        }
    }

    /// A queue whose `offer` never suspends.
    pub fn unbounded() -> Self {
        Self::bounded(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Add `item`, suspending while the queue is full. A suspended taker
    /// receives the item directly.
    pub fn offer<E: EffectError>(&self, item: A) -> Effect<(), E> {
        let inner = Arc::clone(&self.inner);
        Effect::async_interrupt(move |callback| {
            let mut state = inner.state.lock();
            if state.shutdown {
                drop(state);
                callback.resume(Effect::interrupt());
                return None;
            }
            if let Some((_, taker)) = state.takers.pop_front() {
                drop(state);
                taker(Some(item));
                callback.succeed(());
                return None;
            }
            if state.items.len() < inner.capacity {
                state.items.push_back(item);
                drop(state);
                callback.succeed(());
                return None;
            }

            let id = state.next_id();
            state.offerers.push_back(Offerer {
                id,
                item,
                wake: Box::new(move |accepted| {
                    if accepted {
                        callback.succeed(());
                    } else {
                        callback.resume(Effect::interrupt());
                    }
                }),
            });
            let inner = Arc::clone(&inner);
            Some(Effect::sync(move || {
                inner.state.lock().offerers.retain(|o| o.id != id);
            }))
        })
    }

    /// Add `item` if there is room. Returns whether it was added.
    pub fn try_offer<E: EffectError>(&self, item: A) -> Effect<bool, E> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || {
            let mut state = inner.state.lock();
            if state.shutdown {
                return false;
            }
            if let Some((_, taker)) = state.takers.pop_front() {
                drop(state);
                taker(Some(item));
                return true;
            }
            if state.items.len() < inner.capacity {
                state.items.push_back(item);
                return true;
            }
            false
        })
    }

    /// Remove the oldest item, suspending while the queue is empty.
    pub fn take<E: EffectError>(&self) -> Effect<A, E> {
        let inner = Arc::clone(&self.inner);
        Effect::async_interrupt(move |callback| {
            let mut state = inner.state.lock();
            if let Some(item) = state.items.pop_front() {
                let admitted = state.admit_offerer();
                drop(state);
                if let Some(wake) = admitted {
                    wake(true);
                }
                callback.succeed(item);
                return None;
            }
            if state.shutdown {
                drop(state);
                callback.resume(Effect::interrupt());
                return None;
            }

            let id = state.next_id();
            state.takers.push_back((
                id,
                Box::new(move |item| match item {
                    Some(item) => callback.succeed(item),
                    None => callback.resume(Effect::interrupt()),
                }),
            ));
            let inner = Arc::clone(&inner);
            Some(Effect::sync(move || {
                inner.state.lock().takers.retain(|(k, _)| *k != id);
            }))
        })
    }

    /// Remove the oldest item if there is one.
    pub fn poll<E: EffectError>(&self) -> Effect<Option<A>, E> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || {
            let mut state = inner.state.lock();
            let item = state.items.pop_front();
            let admitted = if item.is_some() { state.admit_offerer() } else { None };
            drop(state);
            if let Some(wake) = admitted {
                wake(true);
            }
            item
        })
    }

    /// Shut the queue down. Buffered items are dropped and every suspended
    /// fiber is interrupted.
    pub fn shutdown<E: EffectError>(&self) -> Effect<(), E> {
        let inner = Arc::clone(&self.inner);
        Effect::sync(move || {
            let (takers, offerers) = {
                let mut state = inner.state.lock();
                if state.shutdown {
                    return;
                }
                state.shutdown = true;
                state.items.clear();
                (
                    std::mem::take(&mut state.takers),
                    std::mem::take(&mut state.offerers),
                )
            };
            debug!(takers = takers.len(), offerers = offerers.len(), "queue shut down");
            for (_, taker) in takers {
                taker(None);
            }
            for offerer in offerers {
                (offerer.wake)(false);
            }
        })
    }
}
