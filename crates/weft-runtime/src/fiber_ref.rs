//! Fiber-local state.
//!
//! A [`FiberRef`] names a value that every fiber holds its own copy of.
//! The values live in a [`FiberRefs`] snapshot owned by the fiber. Forking
//! derives the child's snapshot through each ref's `fork` function; joining
//! a finished child merges the values it changed back through `join`.
//!
//! Snapshots are persistent: cloning one is a reference-count bump and
//! writes copy the map only when it is shared.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::effect::{erase, Effect, EffectError, Primitive};

type SharedAny = Arc<dyn Any + Send + Sync>;

/// Type-erased fork/join behaviour of one ref.
trait Descriptor: Send + Sync {
    fn fork(&self, value: &SharedAny) -> SharedAny;
    fn join(&self, parent: Option<&SharedAny>, child: &SharedAny) -> SharedAny;
}

struct RefInner<A> {
    id: u64,
    initial: A,
    fork: Box<dyn Fn(&A) -> A + Send + Sync>,
    join: Box<dyn Fn(&A, &A) -> A + Send + Sync>,
}

impl<A: Clone + Send + Sync + 'static> RefInner<A> {
    fn value_of<'a>(&'a self, value: &'a SharedAny) -> &'a A {
        value.downcast_ref::<A>().unwrap_or(&self.initial)
    }
}

impl<A: Clone + Send + Sync + 'static> Descriptor for RefInner<A> {
    fn fork(&self, value: &SharedAny) -> SharedAny {
        Arc::new((self.fork)(self.value_of(value)))
    }

    fn join(&self, parent: Option<&SharedAny>, child: &SharedAny) -> SharedAny {
        let parent = parent.map_or(&self.initial, |v| self.value_of(v));
        Arc::new((self.join)(parent, self.value_of(child)))
    }
}

/// A fiber-local variable with an initial value and fork/join behaviour.
pub struct FiberRef<A> {
    inner: Arc<RefInner<A>>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: std::fmt::Debug> std::fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.inner.id)
            .field("initial", &self.inner.initial)
            .finish()
    }
}

fn next_ref_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl<A> FiberRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// A ref whose children start with a copy of the parent's value and
    /// whose joined children overwrite it.
    pub fn new(initial: A) -> Self {
        Self::with_fork_join(initial, A::clone, |_, child| child.clone())
    }

    /// A ref with custom fork and join functions. `join` receives the
    /// parent's value and the child's final value.
    pub fn with_fork_join<F, J>(initial: A, fork: F, join: J) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(RefInner {
                id: next_ref_id(),
                initial,
                fork: Box::new(fork),
                join: Box::new(join),
            }),
        }
    }

    /// The value a fiber sees before anything was set.
    pub fn initial(&self) -> &A {
        &self.inner.initial
    }

    /// Read the running fiber's value.
    pub fn get<E: EffectError>(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            Primitive::Succeed(erase(fiber.fiber_refs.get(&this)))
        })))
    }

    /// Set the running fiber's value.
    pub fn set<E: EffectError>(&self, value: A) -> Effect<(), E> {
        let this = self.clone();
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            fiber.fiber_refs.set(&this, value);
            Primitive::unit()
        })))
    }

    /// Update the running fiber's value.
    pub fn update<E, F>(&self, f: F) -> Effect<(), E>
    where
        E: EffectError,
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Update the running fiber's value, returning a result computed from
    /// the old one.
    pub fn modify<B, E, F>(&self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        E: EffectError,
        F: FnOnce(A) -> (B, A) + Send + 'static,
    {
        let this = self.clone();
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            let (result, next) = f(fiber.fiber_refs.get(&this));
            fiber.fiber_refs.set(&this, next);
            Primitive::Succeed(erase(result))
        })))
    }

    /// Run `effect` with the value set to `value`, restoring the previous
    /// value afterwards.
    pub fn locally<B, E>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E>
    where
        B: Send + 'static,
        E: EffectError,
    {
        let this = self.clone();
        Effect::uninterruptible_mask(move |restore| {
            this.get::<E>().flat_map(move |previous| {
                this.set(value)
                    .zip_right(restore.apply(effect).ensuring(this.set(previous)))
            })
        })
    }
}

#[derive(Clone)]
struct Entry {
    descriptor: Arc<dyn Descriptor>,
    value: SharedAny,
    /// Written since the snapshot was forked.
    dirty: bool,
}

/// A fiber's snapshot of every [`FiberRef`] it has touched.
#[derive(Clone, Default)]
pub struct FiberRefs {
    entries: Arc<FxHashMap<u64, Entry>>,
}

impl FiberRefs {
    /// A snapshot where every ref has its initial value.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of refs with an explicit value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether no ref has an explicit value.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read `fiber_ref`, falling back to its initial value.
    pub fn get<A>(&self, fiber_ref: &FiberRef<A>) -> A
    where
        A: Clone + Send + Sync + 'static,
    {
        self.entries
            .get(&fiber_ref.inner.id)
            .and_then(|entry| entry.value.downcast_ref::<A>())
            .unwrap_or(&fiber_ref.inner.initial)
            .clone()
    }

    /// Write `fiber_ref` in this snapshot only.
    pub fn set<A>(&mut self, fiber_ref: &FiberRef<A>, value: A)
    where
        A: Clone + Send + Sync + 'static,
    {
        let descriptor: Arc<dyn Descriptor> = fiber_ref.inner.clone();
        Arc::make_mut(&mut self.entries).insert(
            fiber_ref.inner.id,
            Entry {
                descriptor,
                value: Arc::new(value),
                dirty: true,
            },
        );
    }

    /// Remove the explicit value of `fiber_ref`.
    pub fn delete<A>(&mut self, fiber_ref: &FiberRef<A>) {
        if self.entries.contains_key(&fiber_ref.inner.id) {
            Arc::make_mut(&mut self.entries).remove(&fiber_ref.inner.id);
        }
    }

    /// The snapshot a child fiber starts with.
    pub fn fork(&self) -> FiberRefs {
        let entries = self
            .entries
            .iter()
            .map(|(id, entry)| {
                (
                    *id,
                    Entry {
                        descriptor: Arc::clone(&entry.descriptor),
                        value: entry.descriptor.fork(&entry.value),
                        dirty: false,
                    },
                )
            })
            .collect();
        FiberRefs {
            entries: Arc::new(entries),
        }
    }

    /// Merge the values a finished child changed into this snapshot.
    pub fn join(&mut self, child: &FiberRefs) {
        let changed: Vec<(u64, Entry)> = child
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, entry)| {
                let parent = self.entries.get(id).map(|e| &e.value);
                let value = entry.descriptor.join(parent, &entry.value);
                (
                    *id,
                    Entry {
                        descriptor: Arc::clone(&entry.descriptor),
                        value,
                        dirty: true,
                    },
                )
            })
            .collect();
        if changed.is_empty() {
            return;
        }
        Arc::make_mut(&mut self.entries).extend(changed);
    }
}

impl std::fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberRefs").field("len", &self.len()).finish()
    }
}

impl<E: EffectError> Effect<FiberRefs, E> {
    /// The running fiber's snapshot.
    pub fn get_fiber_refs() -> Self {
        Effect::from_primitive(Primitive::WithFiber(Box::new(|fiber| {
            Primitive::Succeed(erase(fiber.fiber_refs.clone()))
        })))
    }
}

impl<E: EffectError> Effect<(), E> {
    /// Replace the running fiber's snapshot.
    pub fn set_fiber_refs(refs: FiberRefs) -> Self {
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            fiber.fiber_refs = refs;
            Primitive::unit()
        })))
    }

    /// Merge `refs` into the running fiber's snapshot as if it were the
    /// final snapshot of a joined child.
    pub fn inherit_fiber_refs(refs: FiberRefs) -> Self {
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            fiber.fiber_refs.join(&refs);
            Primitive::unit()
        })))
    }
}
