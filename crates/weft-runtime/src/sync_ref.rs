//! Shared mutable state for fibers.
//!
//! Unlike a [`FiberRef`](crate::FiberRef), a [`Ref`] is one cell shared by
//! every fiber holding a clone. Each operation is atomic: `update` and
//! `modify` run their closure under the lock, so concurrent updates are
//! never lost.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Effect, EffectError, EffectValue};

/// An atomically updated reference shared across fibers.
pub struct Ref<A> {
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.cell.lock()).finish()
    }
}

impl<A> Ref<A>
where
    A: Clone + EffectValue,
{
    /// Create a reference holding `initial`.
    pub fn new(initial: A) -> Self {
        Self {
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// An effect that creates a reference.
    pub fn make<E: EffectError>(initial: A) -> Effect<Ref<A>, E> {
        Effect::sync(move || Ref::new(initial))
    }

    pub fn get<E: EffectError>(&self) -> Effect<A, E> {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || cell.lock().clone())
    }

    pub fn set<E: EffectError>(&self, value: A) -> Effect<(), E> {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || *cell.lock() = value)
    }

    /// Replace the value, returning the old one.
    pub fn get_and_set<E: EffectError>(&self, value: A) -> Effect<A, E> {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || std::mem::replace(&mut *cell.lock(), value))
    }

    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: EffectError,
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Apply `f` and return the new value.
    pub fn update_and_get<E, F>(&self, f: F) -> Effect<A, E>
    where
        E: EffectError,
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Atomically compute a result and a new value from the current one.
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: EffectValue,
        E: EffectError,
        F: FnOnce(A) -> (B, A) + Send + 'static,
    {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || {
            let mut guard = cell.lock();
            let (result, next) = f(guard.clone());
            *guard = next;
            result
        })
    }
}
