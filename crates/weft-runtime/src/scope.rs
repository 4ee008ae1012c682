//! Resource scopes.
//!
//! A [`Scope`] is a lifetime boundary that owns a [`ReleaseMap`]. Resources
//! acquired into a scope register their release as a finalizer; closing the
//! scope runs every finalizer exactly once with the scope's exit.
//!
//! Scopes nest: a child created with [`Scope::fork`] is closed by its parent
//! unless it is closed first or [`detached`](Scope::detach).
//!
//! # Example
//!
//! ```rust
//! use weft_runtime::{Effect, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//! let program: Effect<u32, String> = Effect::scoped(|scope| {
//!     Effect::acquire_release(&scope, Effect::succeed(3), |_conn, _exit| Effect::unit())
//!         .map(|conn| conn * 2)
//! });
//! assert_eq!(runtime.run_sync(program).into_result().unwrap(), 6);
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{sequence_exits, AnyError, Effect, EffectError, EffectValue, ScopeExit};
use crate::exit::Exit;
use crate::fiber::Fiber;
use crate::release_map::{ReleaseMap, ReleaseOrder};

struct ScopeInner {
    release_map: ReleaseMap,
    order: ReleaseOrder,
    /// The parent's map and the key of the finalizer that closes us.
    parent: Mutex<Option<(ReleaseMap, u64)>>,
}

/// Handle to a resource scope. Clones share the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("order", &self.inner.order)
            .field("release_map", &self.inner.release_map)
            .finish()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a typed exit into the exit finalizers receive.
pub fn scope_exit<A, E: EffectError>(exit: &Exit<A, E>) -> ScopeExit {
    match exit {
        Exit::Success(_) => Exit::Success(()),
        Exit::Failure(cause) => Exit::Failure(cause.clone().map(AnyError::new)),
    }
}

impl Scope {
    /// Open a scope that releases in LIFO order.
    pub fn new() -> Self {
        Self::with_order(ReleaseOrder::Lifo)
    }

    /// Open a scope that releases in `order`.
    pub fn with_order(order: ReleaseOrder) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                release_map: ReleaseMap::new(),
                order,
                parent: Mutex::new(None),
            }),
        }
    }

    /// Open a scope as an effect.
    pub fn make<E: EffectError>(order: ReleaseOrder) -> Effect<Scope, E> {
        Effect::sync(move || Scope::with_order(order))
    }

    /// The release order used on close.
    pub fn order(&self) -> ReleaseOrder {
        self.inner.order
    }

    /// The underlying finalizer registry.
    pub fn release_map(&self) -> &ReleaseMap {
        &self.inner.release_map
    }

    /// Check whether the scope has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.release_map.is_exited()
    }

    /// Register a finalizer. Returns its key, or `None` when the scope was
    /// already closed and the finalizer ran immediately.
    pub fn add_finalizer<E, F>(&self, finalizer: F) -> Effect<Option<u64>, E>
    where
        E: EffectError,
        F: FnOnce(&ScopeExit) -> Effect<(), Infallible> + Send + 'static,
    {
        self.inner
            .release_map
            .add(Box::new(move |exit: ScopeExit| finalizer(&exit)))
    }

    /// Open a child scope that this scope closes with its own exit.
    pub fn fork<E: EffectError>(&self, order: ReleaseOrder) -> Effect<Scope, E> {
        let parent = self.clone();
        Effect::suspend(move || {
            let child = Scope::with_order(order);
            let closing = child.clone();
            let linked = child.clone();
            let parent_map = parent.inner.release_map.clone();
            parent
                .add_finalizer::<E, _>(move |exit| closing.close(exit.clone()))
                .map(move |key| {
                    if let Some(key) = key {
                        *linked.inner.parent.lock() = Some((parent_map, key));
                    }
                    child
                })
        })
    }

    /// Stop the parent from closing this scope.
    pub fn detach(&self) {
        if let Some((parent, key)) = self.inner.parent.lock().take() {
            parent.remove(key);
        }
    }

    /// Close the scope with `exit`, running every finalizer. Closing twice
    /// does nothing the second time.
    pub fn close<E: EffectError>(&self, exit: ScopeExit) -> Effect<(), E> {
        let scope = self.clone();
        Effect::suspend(move || {
            scope.detach();
            scope.inner.release_map.release_all(exit, scope.inner.order)
        })
    }
}

impl<A: EffectValue, E: EffectError> Effect<A, E> {
    /// Acquire a resource uninterruptibly and register its release in
    /// `scope`. The release receives the resource and the scope's exit.
    pub fn acquire_release<R>(scope: &Scope, acquire: Effect<A, E>, release: R) -> Effect<A, E>
    where
        A: Clone,
        R: FnOnce(A, &ScopeExit) -> Effect<(), Infallible> + Send + 'static,
    {
        let scope = scope.clone();
        acquire
            .flat_map(move |resource| {
                let held = resource.clone();
                scope
                    .add_finalizer::<E, _>(move |exit| release(held, exit))
                    .as_(resource)
            })
            .uninterruptible()
    }

    /// Acquire a resource, use it, and release it whatever the outcome of
    /// the use. Acquisition and release are uninterruptible; the use keeps
    /// the caller's interruptibility. A failing release is sequenced after
    /// the use's failure.
    pub fn acquire_use_release<R, U, Rel>(
        acquire: Effect<R, E>,
        use_: U,
        release: Rel,
    ) -> Effect<A, E>
    where
        R: EffectValue,
        U: FnOnce(&R) -> Effect<A, E> + Send + 'static,
        Rel: FnOnce(R, &Exit<A, E>) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |resource| {
                let body = use_(&resource);
                restore.apply(body).exit::<E>().flat_map(move |exit| {
                    release(resource, &exit)
                        .exit::<E>()
                        .flat_map(move |after| Effect::from_exit(sequence_exits(exit, after)))
                })
            })
        })
    }

    /// Run the effect built by `f` with a fresh scope, closing the scope
    /// with the effect's exit once it finishes.
    pub fn scoped<F>(f: F) -> Effect<A, E>
    where
        F: FnOnce(Scope) -> Effect<A, E> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            let scope = Scope::new();
            restore.apply(f(scope.clone())).exit::<E>().flat_map(move |exit| {
                scope
                    .close::<Infallible>(scope_exit(&exit))
                    .exit::<E>()
                    .flat_map(move |closed| Effect::from_exit(sequence_exits(exit, closed)))
            })
        })
    }
}

impl<A, E> Effect<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    /// Run `self` on a new fiber that `scope` interrupts when it closes.
    pub fn fork_in<E2: EffectError>(self, scope: &Scope) -> Effect<Fiber<A, E>, E2> {
        let scope = scope.clone();
        Effect::uninterruptible_mask(move |restore| {
            restore.apply(self).fork_daemon::<E2>().flat_map(move |fiber| {
                let target = fiber.clone();
                scope
                    .add_finalizer::<E2, _>(move |_| target.interrupt::<Infallible>().as_unit())
                    .as_(fiber)
            })
        })
    }
}
