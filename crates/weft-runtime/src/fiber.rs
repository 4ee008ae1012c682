//! Fibers and the run loop that executes them.
//!
//! A fiber interprets one effect's instruction stream. Continuations live on
//! an explicit stack owned by the fiber's [`FiberState`], which moves between
//! worker threads as the fiber suspends and resumes. Everything other
//! threads may touch (status, exit, observers, the parked state) sits behind
//! one `parking_lot` mutex in [`FiberContext`].
//!
//! # Interruption
//!
//! An interrupt signal sets a sticky `interrupted` flag and accumulates the
//! interruptor into the fiber's interrupt cause. The run loop checks an
//! edge-triggered `signal` flag between instructions; a fiber parked on an
//! async boundary is resumed directly with its canceler followed by the
//! interrupt. Uninterruptible regions ignore the signal; leaving the region
//! re-checks the sticky flag.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::cause::{Cause, Defect};
use crate::effect::{
    erase, recover, recover_cause, type_mismatch, AnyError, AnyValue, Continuation, Effect,
    EffectError, ErasedCause, FailureHandler, Primitive, Register,
};
use crate::exit::Exit;
use crate::fiber_id::{FiberId, RuntimeFiberId};
use crate::fiber_ref::FiberRefs;
use crate::runtime::Runtime;

/// A value published by a finished fiber, shareable between observers.
pub(crate) type SharedValue = Arc<dyn std::any::Any + Send + Sync>;

/// The exit of a fiber with its types erased.
pub(crate) type ErasedExit = Exit<SharedValue, AnyError>;

pub(crate) type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

/// Wrapper marking the final value of a fiber's effect.
pub(crate) struct Published(SharedValue);

/// Observable lifecycle state of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing instructions or waiting in a run queue.
    Running,
    /// Parked on an async boundary.
    Suspended {
        /// The fibers being waited on, `None` for timers and callbacks.
        blocking_on: FiberId,
    },
    /// Finished; the exit is fixed.
    Done,
}

enum Frame {
    OnSuccess(Continuation),
    Fold {
        on_failure: FailureHandler,
        on_success: Continuation,
    },
    RevertInterruptible(bool),
}

enum Unwound {
    Next(Primitive),
    Done(Exit<AnyValue, AnyError>),
}

/// The part of a fiber owned by whichever thread is running it.
pub(crate) struct FiberState {
    context: Arc<FiberContext>,
    pub(crate) fiber_refs: FiberRefs,
    interruptible: bool,
    stack: Vec<Frame>,
}

impl FiberState {
    /// Identity of the fiber.
    pub(crate) fn id(&self) -> FiberId {
        self.context.id.clone()
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.context.runtime
    }

    /// Start a child fiber. Supervised children are interrupted with their
    /// parent and awaited before the parent completes.
    pub(crate) fn fork(&self, primitive: Primitive, supervised: bool) -> Arc<FiberContext> {
        let parent = if supervised { Some(&self.context) } else { None };
        let child = FiberContext::new(self.context.runtime.clone(), parent);
        debug!(fiber = %child.id, parent = %self.context.id, supervised, "fiber forked");
        child.start(primitive, self.fiber_refs.fork(), self.interruptible);
        child
    }

    fn unwind_success(&mut self, value: AnyValue) -> Unwound {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnSuccess(then) => return Unwound::Next(guarded(move || then(value))),
                Frame::Fold { on_success, .. } => {
                    return Unwound::Next(guarded(move || on_success(value)))
                }
                Frame::RevertInterruptible(interruptible) => {
                    self.interruptible = interruptible;
                    if interruptible && self.context.is_interrupted() {
                        return Unwound::Next(Primitive::Fail(self.context.interrupted_cause()));
                    }
                }
            }
        }
        Unwound::Done(Exit::Success(value))
    }

    fn unwind_failure(&mut self, mut cause: ErasedCause) -> Unwound {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::OnSuccess(_) => {}
                Frame::Fold { on_failure, .. } => {
                    // An interrupted fiber only unwinds through handlers it
                    // cannot be interrupted out of.
                    if self.interruptible && self.context.is_interrupted() {
                        continue;
                    }
                    return Unwound::Next(guarded(move || on_failure(cause)));
                }
                Frame::RevertInterruptible(interruptible) => {
                    self.interruptible = interruptible;
                    if interruptible && self.context.is_interrupted() && !cause.contains_interrupt()
                    {
                        cause = cause.then(self.context.interrupted_cause());
                    }
                }
            }
        }
        Unwound::Done(Exit::Failure(cause))
    }
}

/// Run `f`, turning a panic into a defect.
pub(crate) fn guarded<F>(f: F) -> Primitive
where
    F: FnOnce() -> Primitive,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(next) => next,
        Err(panic) => Primitive::die(Defect::from_panic(panic)),
    }
}

struct Parked {
    state: FiberState,
    canceler: Option<Primitive>,
}

struct Shared {
    status: FiberStatus,
    exit: Option<ErasedExit>,
    final_refs: Option<FiberRefs>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
    interrupted_cause: ErasedCause,
    parked: Option<Parked>,
    async_epoch: u64,
    early_resume: Option<Primitive>,
    children: FxHashMap<u64, Arc<FiberContext>>,
}

/// The part of a fiber shared with other fibers and threads.
pub(crate) struct FiberContext {
    id: FiberId,
    seq: u64,
    runtime: Runtime,
    parent: Option<Weak<FiberContext>>,
    /// Sticky: set by the first interrupt signal, never cleared.
    interrupted: AtomicBool,
    /// Edge: consumed by the run loop.
    signal: AtomicBool,
    shared: Mutex<Shared>,
}

impl FiberContext {
    pub(crate) fn new(runtime: Runtime, parent: Option<&Arc<FiberContext>>) -> Arc<FiberContext> {
        let runtime_id = RuntimeFiberId::next(runtime.clock().now_millis());
        let context = Arc::new(FiberContext {
            id: FiberId::Runtime(runtime_id),
            seq: runtime_id.id(),
            runtime,
            parent: parent.map(Arc::downgrade),
            interrupted: AtomicBool::new(false),
            signal: AtomicBool::new(false),
            shared: Mutex::new(Shared {
                status: FiberStatus::Running,
                exit: None,
                final_refs: None,
                observers: Vec::new(),
                next_observer: 0,
                interrupted_cause: Cause::Empty,
                parked: None,
                async_epoch: 0,
                early_resume: None,
                children: FxHashMap::default(),
            }),
        });
        if let Some(parent) = parent {
            parent.shared.lock().children.insert(context.seq, Arc::clone(&context));
        }
        context
    }

    /// Schedule the first run of the fiber.
    pub(crate) fn start(
        self: &Arc<Self>,
        primitive: Primitive,
        fiber_refs: FiberRefs,
        interruptible: bool,
    ) {
        let state = FiberState {
            context: Arc::clone(self),
            fiber_refs,
            interruptible,
            stack: Vec::new(),
        };
        trace!(fiber = %self.id, "fiber started");
        self.runtime.schedule(Box::new(move || run_loop(state, primitive)));
    }

    pub(crate) fn id(&self) -> &FiberId {
        &self.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.shared.lock().status.clone()
    }

    pub(crate) fn poll(&self) -> Option<ErasedExit> {
        self.shared.lock().exit.clone()
    }

    pub(crate) fn final_refs(&self) -> Option<FiberRefs> {
        self.shared.lock().final_refs.clone()
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    fn interrupted_cause(&self) -> ErasedCause {
        self.shared.lock().interrupted_cause.clone()
    }

    /// Register `observer` for the exit. An already finished fiber runs it
    /// immediately and returns `None`.
    pub(crate) fn add_observer(&self, observer: Observer) -> Option<u64> {
        let mut shared = self.shared.lock();
        let exit = shared.exit.clone();
        match exit {
            Some(exit) => {
                drop(shared);
                observer(&exit);
                None
            }
            None => {
                let key = shared.next_observer;
                shared.next_observer += 1;
                shared.observers.push((key, observer));
                Some(key)
            }
        }
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        self.shared.lock().observers.retain(|(k, _)| *k != key);
    }

    fn running_children(&self) -> Vec<Arc<FiberContext>> {
        self.shared.lock().children.values().cloned().collect()
    }

    /// Signal interruption on behalf of `by`.
    ///
    /// Signals to a finished fiber are ignored. Otherwise the interruptor is
    /// accumulated into the fiber's interrupt cause and forwarded to its
    /// supervised children.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        let (resumed, children) = {
            let mut shared = self.shared.lock();
            if shared.exit.is_some() {
                return;
            }
            let cause =
                std::mem::take(&mut shared.interrupted_cause).then(Cause::interrupt(by.clone()));
            shared.interrupted_cause = cause;
            self.interrupted.store(true, Ordering::Release);
            let resumed = match shared.parked.take() {
                Some(parked) if parked.state.interruptible => {
                    shared.async_epoch += 1;
                    shared.status = FiberStatus::Running;
                    Some((parked, shared.interrupted_cause.clone()))
                }
                Some(parked) => {
                    shared.parked = Some(parked);
                    None
                }
                None => {
                    self.signal.store(true, Ordering::Release);
                    None
                }
            };
            let children: Vec<_> = shared.children.values().cloned().collect();
            (resumed, children)
        };
        debug!(fiber = %self.id, by = %by, "interrupt signal received");

        if let Some((parked, cause)) = resumed {
            let next = cancel_then_fail(parked.canceler, cause);
            let state = parked.state;
            self.runtime.schedule(Box::new(move || run_loop(state, next)));
        }
        for child in children {
            child.interrupt_as(self.id.clone());
        }
    }

    /// Publish the exit. The first call wins; later calls are ignored.
    fn complete(self: &Arc<Self>, exit: ErasedExit, fiber_refs: FiberRefs) {
        let observers = {
            let mut shared = self.shared.lock();
            if shared.exit.is_some() {
                return;
            }
            shared.exit = Some(exit.clone());
            shared.final_refs = Some(fiber_refs);
            shared.status = FiberStatus::Done;
            shared.parked = None;
            shared.early_resume = None;
            std::mem::take(&mut shared.observers)
        };
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.shared.lock().children.remove(&self.seq);
        }

        match &exit {
            Exit::Success(_) => debug!(fiber = %self.id, "fiber completed"),
            Exit::Failure(cause) => {
                let unhandled = observers.is_empty()
                    && !cause.is_interrupted()
                    && self.runtime.config().report_unhandled;
                if unhandled && self.parent.is_none() {
                    error!(
                        fiber = %self.id,
                        "fiber failed with an unhandled cause:\n{}",
                        cause.pretty()
                    );
                } else if unhandled {
                    debug!(fiber = %self.id, "child fiber failed unobserved:\n{}", cause.pretty());
                } else {
                    debug!(fiber = %self.id, interrupted = cause.is_interrupted(), "fiber failed");
                }
            }
        }

        for (_, observer) in observers {
            observer(&exit);
        }
    }
}

/// Run the canceler uninterruptibly, then fail with `cause`.
fn cancel_then_fail(canceler: Option<Primitive>, cause: ErasedCause) -> Primitive {
    let fail = Primitive::Fail(cause);
    match canceler {
        None => fail,
        Some(canceler) => Primitive::FlatMap {
            effect: Box::new(Primitive::UpdateInterruptible {
                interruptible: false,
                body: Box::new(move |_| canceler),
            }),
            then: Box::new(move |_| fail),
        },
    }
}

/// Resumes a fiber parked on an async boundary.
///
/// Each registration gets its own epoch; a resumption for an older epoch,
/// or a second resumption of the same one, is ignored.
#[derive(Clone)]
pub(crate) struct AsyncResume {
    inner: Arc<ResumeInner>,
}

struct ResumeInner {
    context: Arc<FiberContext>,
    epoch: u64,
    fired: AtomicBool,
}

impl AsyncResume {
    pub(crate) fn resume(&self, next: Primitive) {
        let context = &self.inner.context;
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            warn!(fiber = %context.id, "async callback resumed more than once; ignoring");
            return;
        }
        let mut shared = context.shared.lock();
        if shared.async_epoch != self.inner.epoch || shared.exit.is_some() {
            trace!(fiber = %context.id, "stale async resumption ignored");
            return;
        }
        match shared.parked.take() {
            Some(parked) => {
                shared.async_epoch += 1;
                shared.status = FiberStatus::Running;
                drop(shared);
                trace!(fiber = %context.id, "fiber resumed");
                let state = parked.state;
                context.runtime.schedule(Box::new(move || run_loop(state, next)));
            }
            // Still registering on the fiber's own thread.
            None => shared.early_resume = Some(next),
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }
}

/// Register an async callback and park the fiber, unless the callback
/// already fired or an interrupt must be honored. Returns the state back
/// with the next instruction when the fiber keeps running.
fn suspend(
    state: FiberState,
    register: Register,
    blocking_on: FiberId,
) -> Option<(FiberState, Primitive)> {
    let context = Arc::clone(&state.context);
    let epoch = {
        let mut shared = context.shared.lock();
        shared.async_epoch += 1;
        shared.early_resume = None;
        shared.async_epoch
    };
    let resume = AsyncResume {
        inner: Arc::new(ResumeInner {
            context: Arc::clone(&context),
            epoch,
            fired: AtomicBool::new(false),
        }),
    };

    let canceler = match catch_unwind(AssertUnwindSafe(move || register(resume))) {
        Ok(canceler) => canceler,
        Err(panic) => {
            context.shared.lock().async_epoch += 1;
            return Some((state, Primitive::die(Defect::from_panic(panic))));
        }
    };

    let mut shared = context.shared.lock();
    if let Some(next) = shared.early_resume.take() {
        shared.async_epoch += 1;
        return Some((state, next));
    }
    if state.interruptible && context.is_interrupted() {
        shared.async_epoch += 1;
        let cause = shared.interrupted_cause.clone();
        context.signal.store(false, Ordering::Release);
        return Some((state, cancel_then_fail(canceler, cause)));
    }
    trace!(fiber = %context.id, blocking_on = %blocking_on, "fiber suspended");
    shared.status = FiberStatus::Suspended { blocking_on };
    shared.parked = Some(Parked { state, canceler });
    None
}

/// Interrupt `children` on behalf of `by`, wait for all of them, then
/// replay `exit`.
fn supervise_children(
    children: Vec<Arc<FiberContext>>,
    by: FiberId,
    exit: Exit<AnyValue, AnyError>,
) -> Primitive {
    let replay = match exit {
        Exit::Success(value) => Primitive::Succeed(value),
        Exit::Failure(cause) => Primitive::Fail(cause),
    };
    let targets = children.clone();
    let mut chain = Primitive::Sync(Box::new(move || {
        for child in &targets {
            child.interrupt_as(by.clone());
        }
        Primitive::unit()
    }));
    for child in children {
        chain = Primitive::FlatMap {
            effect: Box::new(chain),
            then: Box::new(move |_| await_primitive(child)),
        };
    }
    Primitive::FlatMap {
        effect: Box::new(chain),
        then: Box::new(move |_| replay),
    }
}

/// Suspend until `target` finishes; yields its [`ErasedExit`].
pub(crate) fn await_primitive(target: Arc<FiberContext>) -> Primitive {
    let blocking_on = target.id.clone();
    Primitive::Async {
        register: Box::new(move |resume| {
            let observed = Arc::clone(&target);
            let key = target.add_observer(Box::new(move |exit| {
                resume.resume(Primitive::Succeed(erase(exit.clone())));
            }))?;
            Some(Primitive::Sync(Box::new(move || {
                observed.remove_observer(key);
                Primitive::unit()
            })))
        }),
        blocking_on,
    }
}

/// Suspend until any of `targets` finishes; yields the index of the first
/// one to do so.
pub(crate) fn await_first(targets: Vec<Arc<FiberContext>>) -> Primitive {
    let blocking_on = FiberId::combine_all(targets.iter().map(|t| &t.id));
    Primitive::Async {
        register: Box::new(move |resume| {
            let won = Arc::new(AtomicBool::new(false));
            let mut registered = Vec::with_capacity(targets.len());
            for (index, target) in targets.into_iter().enumerate() {
                let won = Arc::clone(&won);
                let resume = resume.clone();
                let key = target.add_observer(Box::new(move |_| {
                    if !won.swap(true, Ordering::AcqRel) {
                        resume.resume(Primitive::Succeed(erase(index)));
                    }
                }));
                if let Some(key) = key {
                    registered.push((target, key));
                }
            }
            Some(Primitive::Sync(Box::new(move || {
                for (target, key) in registered {
                    target.remove_observer(key);
                }
                Primitive::unit()
            })))
        }),
        blocking_on,
    }
}

fn publish(exit: Exit<AnyValue, AnyError>) -> ErasedExit {
    match exit {
        Exit::Success(value) => match value.downcast::<Published>() {
            Ok(published) => Exit::Success(published.0),
            Err(_) => Exit::die(type_mismatch::<Published>()),
        },
        Exit::Failure(cause) => Exit::Failure(cause),
    }
}

/// The instruction stream of a fiber running `effect`.
pub(crate) fn fiber_body<A, E>(effect: Effect<A, E>) -> Primitive
where
    A: Send + Sync + 'static,
    E: EffectError,
{
    effect
        .map(|value| Published(Arc::new(value)))
        .into_primitive()
}

/// Drive `state` from `current` until the fiber suspends, yields or
/// finishes.
pub(crate) fn run_loop(mut state: FiberState, mut current: Primitive) {
    let context = Arc::clone(&state.context);
    let max_ops = context.runtime.config().max_ops_before_yield;
    let mut ops = 0usize;

    loop {
        if state.interruptible
            && !matches!(current, Primitive::Fail(_))
            && context.signal.swap(false, Ordering::AcqRel)
        {
            current = Primitive::Fail(context.interrupted_cause());
        }
        ops += 1;
        if ops > max_ops {
            trace!(fiber = %context.id, "fiber yielding after {} operations", max_ops);
            let runtime = context.runtime.clone();
            runtime.schedule(Box::new(move || run_loop(state, current)));
            return;
        }

        let unwound = match current {
            Primitive::Succeed(value) => state.unwind_success(value),
            Primitive::Fail(cause) => state.unwind_failure(cause),
            Primitive::Sync(f) => Unwound::Next(guarded(f)),
            Primitive::FlatMap { effect, then } => {
                state.stack.push(Frame::OnSuccess(then));
                Unwound::Next(*effect)
            }
            Primitive::Fold {
                effect,
                on_failure,
                on_success,
            } => {
                state.stack.push(Frame::Fold {
                    on_failure,
                    on_success,
                });
                Unwound::Next(*effect)
            }
            Primitive::UpdateInterruptible {
                interruptible,
                body,
            } => {
                let previous = state.interruptible;
                if interruptible == previous {
                    Unwound::Next(guarded(move || body(previous)))
                } else {
                    state.stack.push(Frame::RevertInterruptible(previous));
                    state.interruptible = interruptible;
                    if interruptible && context.is_interrupted() {
                        Unwound::Next(Primitive::Fail(context.interrupted_cause()))
                    } else {
                        Unwound::Next(guarded(move || body(previous)))
                    }
                }
            }
            Primitive::WithFiber(f) => Unwound::Next(guarded(|| f(&mut state))),
            Primitive::Yield => {
                let runtime = context.runtime.clone();
                runtime.schedule(Box::new(move || run_loop(state, Primitive::unit())));
                return;
            }
            Primitive::Async {
                register,
                blocking_on,
            } => match suspend(state, register, blocking_on) {
                Some((resumed, next)) => {
                    state = resumed;
                    Unwound::Next(next)
                }
                None => return,
            },
        };

        current = match unwound {
            Unwound::Next(next) => next,
            Unwound::Done(exit) => {
                let children = context.running_children();
                if children.is_empty() {
                    context.complete(publish(exit), state.fiber_refs);
                    return;
                }
                // Children are awaited without further interruption; the
                // exit to publish is already decided.
                state.interruptible = false;
                supervise_children(children, context.id.clone(), exit)
            }
        };
    }
}

/// Handle to a running or finished fiber.
///
/// Cloning the handle does not clone the fiber.
pub struct Fiber<A, E> {
    context: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            context: Arc::clone(&self.context),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").field("id", &self.context.id).finish()
    }
}

pub(crate) fn recover_exit<A, E>(exit: &ErasedExit) -> Exit<A, E>
where
    A: Clone + 'static,
    E: EffectError,
{
    match exit {
        Exit::Success(value) => match value.downcast_ref::<A>() {
            Some(a) => Exit::Success(a.clone()),
            None => Exit::die(type_mismatch::<A>()),
        },
        Exit::Failure(cause) => Exit::Failure(recover_cause(cause.clone())),
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    pub(crate) fn new(context: Arc<FiberContext>) -> Self {
        Self {
            context,
            _marker: PhantomData,
        }
    }

    pub(crate) fn context(&self) -> &Arc<FiberContext> {
        &self.context
    }

    /// Identity of the fiber.
    pub fn id(&self) -> FiberId {
        self.context.id.clone()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> FiberStatus {
        self.context.status()
    }

    /// The exit, if the fiber has finished.
    pub fn poll(&self) -> Option<Exit<A, E>> {
        self.context.poll().map(|exit| recover_exit(&exit))
    }

    /// Wait for the fiber to finish. The fiber's FiberRefs are not merged.
    pub fn await_exit<E2: EffectError>(&self) -> Effect<Exit<A, E>, E2> {
        Effect::from_primitive(Primitive::FlatMap {
            effect: Box::new(await_primitive(Arc::clone(&self.context))),
            then: Box::new(|value| match recover::<ErasedExit>(value) {
                Ok(exit) => Primitive::Succeed(erase(recover_exit::<A, E>(&exit))),
                Err(cause) => Primitive::Fail(cause),
            }),
        })
    }

    /// Wait for the fiber, merge its FiberRefs into the caller's, and
    /// continue with its outcome.
    pub fn join(&self) -> Effect<A, E> {
        let fiber = self.clone();
        self.await_exit::<E>()
            .flat_map(move |exit| {
                fiber.inherit_fiber_refs::<E>().zip_right(Effect::from_exit(exit))
            })
    }

    /// Merge the finished fiber's FiberRefs into the caller's.
    pub fn inherit_fiber_refs<E2: EffectError>(&self) -> Effect<(), E2> {
        let context = Arc::clone(&self.context);
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            if let Some(refs) = context.final_refs() {
                fiber.fiber_refs.join(&refs);
            }
            Primitive::unit()
        })))
    }

    /// Interrupt the fiber on behalf of the caller and wait for it to
    /// finish.
    pub fn interrupt<E2: EffectError>(&self) -> Effect<Exit<A, E>, E2> {
        self.interrupt_fork::<E2>().zip_right(self.await_exit())
    }

    /// Interrupt the fiber on behalf of `by` and wait for it to finish.
    pub fn interrupt_as<E2: EffectError>(&self, by: FiberId) -> Effect<Exit<A, E>, E2> {
        let context = Arc::clone(&self.context);
        Effect::<(), E2>::sync(move || context.interrupt_as(by)).zip_right(self.await_exit())
    }

    /// Interrupt the fiber without waiting for it.
    pub fn interrupt_fork<E2: EffectError>(&self) -> Effect<(), E2> {
        let context = Arc::clone(&self.context);
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            context.interrupt_as(fiber.id());
            Primitive::unit()
        })))
    }

    /// Wait for every fiber. Concurrent failures are combined with `both`.
    pub fn await_all<E2: EffectError>(fibers: Vec<Fiber<A, E>>) -> Effect<Exit<Vec<A>, E>, E2> {
        Effect::for_each(fibers, |fiber| fiber.await_exit::<E2>()).map(Exit::collect_all_par)
    }

    /// Interrupt every fiber and wait for all of them.
    pub fn interrupt_all<E2: EffectError>(fibers: Vec<Fiber<A, E>>) -> Effect<(), E2> {
        let targets: Vec<Arc<FiberContext>> =
            fibers.iter().map(|f| Arc::clone(&f.context)).collect();
        let signal = Effect::<(), E2>::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            let by = fiber.id();
            for target in &targets {
                target.interrupt_as(by.clone());
            }
            Primitive::unit()
        })));
        signal.zip_right(Effect::for_each(fibers, |fiber| fiber.await_exit::<E2>()).as_unit())
    }

    /// Block the calling thread until the fiber finishes.
    ///
    /// Meant for code outside the runtime; calling it from inside a fiber
    /// blocks a worker thread.
    pub fn await_blocking(&self) -> Exit<A, E> {
        let slot = Arc::new(ExitSlot::new());
        self.context.add_observer(slot.observer());
        recover_exit(&slot.wait())
    }
}

/// A one-shot exit cell that a thread outside the runtime can block on.
pub(crate) struct ExitSlot {
    exit: Mutex<Option<ErasedExit>>,
    completed: Condvar,
}

impl ExitSlot {
    pub(crate) fn new() -> Self {
        Self {
            exit: Mutex::new(None),
            completed: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, exit: ErasedExit) {
        *self.exit.lock() = Some(exit);
        self.completed.notify_all();
    }

    /// An observer that fills this slot.
    pub(crate) fn observer(self: &Arc<Self>) -> Observer {
        let slot = Arc::clone(self);
        Box::new(move |exit| slot.complete(exit.clone()))
    }

    pub(crate) fn wait(&self) -> ErasedExit {
        let mut exit = self.exit.lock();
        loop {
            if let Some(done) = exit.take() {
                return done;
            }
            self.completed.wait(&mut exit);
        }
    }
}

impl<A, E> Effect<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    /// Run `self` on a new fiber supervised by the current one.
    ///
    /// The child inherits a forked copy of the caller's FiberRefs and its
    /// interruptibility. It is interrupted with its parent, and a parent
    /// that finishes first interrupts and awaits it.
    pub fn fork<E2: EffectError>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(true)
    }

    /// Run `self` on a new fiber that nobody supervises.
    pub fn fork_daemon<E2: EffectError>(self) -> Effect<Fiber<A, E>, E2> {
        self.fork_with(false)
    }

    fn fork_with<E2: EffectError>(self, supervised: bool) -> Effect<Fiber<A, E>, E2> {
        let body = fiber_body(self);
        Effect::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            let child = fiber.fork(body, supervised);
            Primitive::Succeed(erase(Fiber::<A, E>::new(child)))
        })))
    }
}
