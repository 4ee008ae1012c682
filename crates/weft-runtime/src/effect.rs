//! Effect descriptions.
//!
//! An [`Effect<A, E>`] is an inert description of a computation that
//! succeeds with an `A`, fails with a typed `E`, dies with a defect, or is
//! interrupted. Nothing happens until a [`Runtime`](crate::Runtime) runs it
//! on a fiber.
//!
//! # Representation
//!
//! Internally every effect is a `Primitive`: a closed instruction enum
//! with erased value and error types. The interpreter in `fiber` matches it
//! exhaustively and keeps continuations on an explicit stack, so long
//! `flat_map` chains never grow the native call stack. The typed `Effect`
//! wrapper only records `A` and `E` in a phantom and downcasts at the
//! boundaries.
//!
//! # Example
//!
//! ```rust
//! use weft_runtime::{Effect, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//! let program: Effect<i32, String> = Effect::succeed(20)
//!     .map(|n| n + 1)
//!     .flat_map(|n| Effect::succeed(n * 2));
//! assert_eq!(runtime.run_sync(program).into_result().unwrap(), 42);
//! ```

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::error::RuntimeError;
use crate::exit::Exit;
use crate::fiber::{AsyncResume, FiberState};
use crate::fiber_id::FiberId;
use crate::runtime::Runtime;

/// Values that can flow through an effect.
pub trait EffectValue: Send + 'static {}

impl<T: Send + 'static> EffectValue for T {}

/// Typed errors carried in the failure channel.
pub trait EffectError: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> EffectError for T {}

/// A typed error with its type erased.
///
/// Erased errors keep their `Debug` rendering, so causes observed without
/// their static type (finalizers, unhandled-failure reports) still print
/// the original error.
#[derive(Clone)]
pub struct AnyError {
    value: Arc<dyn Any + Send + Sync>,
    render: fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result,
}

impl AnyError {
    /// Erase a typed error.
    pub fn new<E: EffectError>(error: E) -> Self {
        Self {
            value: Arc::new(error),
            render: render_as::<E>,
        }
    }

    /// Get the error if it has type `E`.
    pub fn downcast_ref<E: 'static>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }
}

fn render_as<E: fmt::Debug + 'static>(
    value: &(dyn Any + Send + Sync),
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    match value.downcast_ref::<E>() {
        Some(error) => fmt::Debug::fmt(error, f),
        None => f.write_str("<erased>"),
    }
}

/// Erased errors are equal when they are the same allocation.
impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.render)(&*self.value, f)
    }
}

/// The exit value handed to scope finalizers.
pub type ScopeExit = Exit<(), AnyError>;

pub(crate) type AnyValue = Box<dyn Any + Send>;
pub(crate) type ErasedCause = Cause<AnyError>;
pub(crate) type Continuation = Box<dyn FnOnce(AnyValue) -> Primitive + Send>;
pub(crate) type FailureHandler = Box<dyn FnOnce(ErasedCause) -> Primitive + Send>;
pub(crate) type Register = Box<dyn FnOnce(AsyncResume) -> Option<Primitive> + Send>;

/// The closed instruction set understood by the fiber interpreter.
pub(crate) enum Primitive {
    /// A value is already available.
    Succeed(AnyValue),
    /// Run a side-effecting closure that yields the next instruction.
    Sync(Box<dyn FnOnce() -> Primitive + Send>),
    /// Fail with a cause.
    Fail(ErasedCause),
    /// Run `effect`, then feed its value to `then`.
    FlatMap {
        effect: Box<Primitive>,
        then: Continuation,
    },
    /// Run `effect`, then continue on either channel.
    Fold {
        effect: Box<Primitive>,
        on_failure: FailureHandler,
        on_success: Continuation,
    },
    /// Suspend until the registered callback resumes the fiber. The
    /// returned instruction, if any, cancels the registration on interrupt.
    Async {
        register: Register,
        blocking_on: FiberId,
    },
    /// Run `body` with the given interruptibility, restoring the previous
    /// one afterwards. `body` receives the previous value.
    UpdateInterruptible {
        interruptible: bool,
        body: Box<dyn FnOnce(bool) -> Primitive + Send>,
    },
    /// Inspect or modify the running fiber.
    WithFiber(Box<dyn FnOnce(&mut FiberState) -> Primitive + Send>),
    /// Give the worker thread back to the scheduler.
    Yield,
}

impl Primitive {
    pub(crate) fn unit() -> Primitive {
        Primitive::Succeed(erase(()))
    }

    pub(crate) fn die(defect: Defect) -> Primitive {
        Primitive::Fail(Cause::die(defect))
    }
}

pub(crate) fn erase<A: Send + 'static>(value: A) -> AnyValue {
    Box::new(value)
}

pub(crate) fn recover<A: 'static>(value: AnyValue) -> Result<A, ErasedCause> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| Cause::die(type_mismatch::<A>()))
}

pub(crate) fn type_mismatch<T>() -> Defect {
    Defect::new(RuntimeError::type_mismatch::<T>().to_string())
}

pub(crate) fn erase_cause<E: EffectError>(cause: Cause<E>) -> ErasedCause {
    cause.map(AnyError::new)
}

pub(crate) fn recover_cause<E: EffectError>(cause: ErasedCause) -> Cause<E> {
    cause.flat_map(|error| match error.downcast_ref::<E>() {
        Some(e) => Cause::fail(e.clone()),
        None => Cause::die(type_mismatch::<E>()),
    })
}

/// Continue with `f` applied to the recovered value.
fn resume_with<A: 'static, F>(value: AnyValue, f: F) -> Primitive
where
    F: FnOnce(A) -> Primitive,
{
    match recover::<A>(value) {
        Ok(a) => f(a),
        Err(cause) => Primitive::Fail(cause),
    }
}

/// Sequence a body exit with the exit of something that ran after it.
/// Failures of both compose with `then`, body first.
pub(crate) fn sequence_exits<A, E>(body: Exit<A, E>, after: Exit<(), Infallible>) -> Exit<A, E> {
    match (body, after) {
        (body, Exit::Success(())) => body,
        (Exit::Success(_), Exit::Failure(cause)) => Exit::Failure(cause.widen()),
        (Exit::Failure(first), Exit::Failure(second)) => Exit::Failure(first.then(second.widen())),
    }
}

/// A description of a computation producing `A` or failing with `E`.
#[must_use = "effects do nothing unless they are run"]
pub struct Effect<A, E = Infallible> {
    primitive: Primitive,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_primitive(primitive: Primitive) -> Self {
        Self {
            primitive,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_primitive(self) -> Primitive {
        self.primitive
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("value", &std::any::type_name::<A>())
            .field("error", &std::any::type_name::<E>())
            .finish()
    }
}

/// Restores the interruptibility that was in effect when
/// [`Effect::uninterruptible_mask`] was entered.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the interruptibility captured at mask entry.
    pub fn apply<A, E>(self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_primitive(Primitive::UpdateInterruptible {
            interruptible: self.interruptible,
            body: Box::new(move |_| effect.primitive),
        })
    }
}

impl<A: EffectValue, E: EffectError> Effect<A, E> {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_primitive(Primitive::Succeed(erase(value)))
    }

    /// An effect that runs `f` when executed. A panic inside `f` becomes a
    /// defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_primitive(Primitive::Sync(Box::new(move || {
            Primitive::Succeed(erase(f()))
        })))
    }

    /// Build the effect lazily, when it is executed.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Effect<A, E> + Send + 'static,
    {
        Self::from_primitive(Primitive::Sync(Box::new(move || f().primitive)))
    }

    /// An effect that fails with `error`.
    pub fn fail(error: E) -> Self {
        Self::fail_cause(Cause::fail(error))
    }

    /// An effect that fails with `cause`.
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_primitive(Primitive::Fail(erase_cause(cause)))
    }

    /// An effect that dies with `defect`.
    pub fn die(defect: Defect) -> Self {
        Self::from_primitive(Primitive::die(defect))
    }

    /// An effect that dies with a message.
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Lift a `Result`.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::succeed(value),
            Err(error) => Self::fail(error),
        }
    }

    /// Replay an exit.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(value) => Self::succeed(value),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// An effect that never completes. It can still be interrupted.
    pub fn never() -> Self {
        Self::from_primitive(Primitive::Async {
            register: Box::new(|_| None),
            blocking_on: FiberId::None,
        })
    }

    /// Interrupt the running fiber.
    pub fn interrupt() -> Self {
        Self::from_primitive(Primitive::WithFiber(Box::new(|fiber| {
            Primitive::Fail(Cause::interrupt(fiber.id()))
        })))
    }

    /// Suspend the fiber until `register`'s callback is resumed.
    pub fn async_callback<F>(register: F) -> Self
    where
        F: FnOnce(Callback<A, E>) + Send + 'static,
    {
        Self::async_interrupt(move |callback| {
            register(callback);
            None
        })
    }

    /// Like [`Effect::async_callback`], with a canceler that runs if the
    /// fiber is interrupted while suspended.
    pub fn async_interrupt<F>(register: F) -> Self
    where
        F: FnOnce(Callback<A, E>) -> Option<Effect<(), Infallible>> + Send + 'static,
    {
        Self::async_blocking_on(FiberId::None, register)
    }

    pub(crate) fn async_blocking_on<F>(blocking_on: FiberId, register: F) -> Self
    where
        F: FnOnce(Callback<A, E>) -> Option<Effect<(), Infallible>> + Send + 'static,
    {
        Self::from_primitive(Primitive::Async {
            register: Box::new(move |resume| {
                register(Callback::new(resume)).map(Effect::into_primitive)
            }),
            blocking_on,
        })
    }

    /// Run `f` over `items` one after another, collecting the results.
    pub fn for_each<I, T, F>(items: I, f: F) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        F: FnMut(T) -> Effect<A, E> + Send + 'static,
    {
        fn step<A, E, T, F>(mut items: VecDeque<T>, mut f: F, mut acc: Vec<A>) -> Effect<Vec<A>, E>
        where
            A: EffectValue,
            E: EffectError,
            T: Send + 'static,
            F: FnMut(T) -> Effect<A, E> + Send + 'static,
        {
            match items.pop_front() {
                None => Effect::succeed(acc),
                Some(item) => f(item).flat_map(move |value| {
                    acc.push(value);
                    step(items, f, acc)
                }),
            }
        }

        let items: VecDeque<T> = items.into_iter().collect();
        let capacity = items.len();
        Effect::suspend(move || step(items, f, Vec::with_capacity(capacity)))
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: EffectValue,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_primitive(Primitive::FlatMap {
            effect: Box::new(self.primitive),
            then: Box::new(move |value| {
                resume_with(value, |a: A| Primitive::Succeed(erase(f(a))))
            }),
        })
    }

    /// Continue with the effect produced from the success value.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: EffectValue,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_primitive(Primitive::FlatMap {
            effect: Box::new(self.primitive),
            then: Box::new(move |value| resume_with(value, |a: A| f(a).primitive)),
        })
    }

    /// Run `that` after `self`, keeping the value of `that`.
    pub fn zip_right<B: EffectValue>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that)
    }

    /// Run `that` after `self`, keeping the value of `self`.
    pub fn zip_left<B: EffectValue>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.map(move |_| a))
    }

    /// Run `that` after `self`, keeping both values.
    pub fn zip<B: EffectValue>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| that.map(move |b| (a, b)))
    }

    /// Run an effect built from a reference to the value, keeping the value.
    pub fn tap<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(&A) -> Effect<(), E> + Send + 'static,
    {
        self.flat_map(move |a| f(&a).map(move |_| a))
    }

    /// Replace the success value.
    pub fn as_<B: EffectValue>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value)
    }

    /// Discard the success value.
    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Error channel
    // ------------------------------------------------------------------

    /// Continue on either channel with full access to the cause.
    pub fn fold_cause_effect<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: EffectValue,
        E2: EffectError,
        F: FnOnce(Cause<E>) -> Effect<B, E2> + Send + 'static,
        S: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        Effect::from_primitive(Primitive::Fold {
            effect: Box::new(self.primitive),
            on_failure: Box::new(move |cause| on_failure(recover_cause(cause)).primitive),
            on_success: Box::new(move |value| resume_with(value, |a: A| on_success(a).primitive)),
        })
    }

    /// Continue on either channel. Only typed failures reach `on_failure`;
    /// defects and interruptions propagate.
    ///
    /// A cause holding a defect is never handed to `on_failure`, even if it
    /// also holds typed failures. Those failures are re-raised as defects.
    pub fn fold_effect<B, E2, F, S>(self, on_failure: F, on_success: S) -> Effect<B, E2>
    where
        B: EffectValue,
        E2: EffectError,
        F: FnOnce(E) -> Effect<B, E2> + Send + 'static,
        S: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        self.fold_cause_effect(
            move |cause| {
                if cause.is_die() {
                    let cause = cause.flat_map(|error| Cause::die(Defect::from_error(error)));
                    return Effect::fail_cause(cause);
                }
                match cause.failure_or_cause() {
                    Ok(error) => on_failure(error),
                    Err(cause) => Effect::fail_cause(cause.strip_failures()),
                }
            },
            on_success,
        )
    }

    /// Recover from typed failures. Defects and interruptions propagate,
    /// and so does any typed failure that sits next to a defect.
    pub fn catch_all<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        self.fold_effect(f, Effect::succeed)
    }

    /// Recover from any cause, including defects and interruptions.
    pub fn catch_all_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnOnce(Cause<E>) -> Effect<A, E2> + Send + 'static,
    {
        self.fold_cause_effect(f, Effect::succeed)
    }

    /// Recover from the first defect. Other causes propagate.
    pub fn catch_all_defect<F>(self, f: F) -> Effect<A, E>
    where
        F: FnOnce(Defect) -> Effect<A, E> + Send + 'static,
    {
        self.catch_all_cause(move |cause| {
            let first = cause.defects().first().map(|defect| (*defect).clone());
            match first {
                Some(defect) => f(defect),
                None => Effect::fail_cause(cause),
            }
        })
    }

    /// Transform typed failures.
    pub fn map_error<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        self.map_error_cause(move |cause| cause.map(f))
    }

    /// Transform the whole failure cause.
    pub fn map_error_cause<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: EffectError,
        F: FnOnce(Cause<E>) -> Cause<E2> + Send + 'static,
    {
        self.fold_cause_effect(move |cause| Effect::fail_cause(f(cause)), Effect::succeed)
    }

    /// Observe the outcome as a value. The resulting effect cannot fail.
    pub fn exit<E2: EffectError>(self) -> Effect<Exit<A, E>, E2> {
        self.fold_cause_effect(
            |cause| Effect::succeed(Exit::Failure(cause)),
            |value| Effect::succeed(Exit::Success(value)),
        )
    }

    /// Move typed failures into the success channel.
    pub fn either<E2: EffectError>(self) -> Effect<Result<A, E>, E2> {
        self.fold_effect(|error| Effect::succeed(Err(error)), |value| Effect::succeed(Ok(value)))
    }

    /// Expose the full cause as the typed error.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        self.map_error_cause(Cause::fail)
    }

    /// Turn typed failures into defects.
    pub fn or_die<E2: EffectError>(self) -> Effect<A, E2> {
        self.map_error_cause(|cause| cause.flat_map(|error| Cause::die(Defect::from_error(error))))
    }

    /// Widen an effect whose error type carries no information.
    pub fn widen_error<E2: EffectError>(self) -> Effect<A, E2>
    where
        E: Into<Infallible>,
    {
        Effect::from_primitive(self.primitive)
    }

    // ------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------

    /// Run `self` in an interruptible region.
    pub fn interruptible(self) -> Self {
        Self::from_primitive(Primitive::UpdateInterruptible {
            interruptible: true,
            body: Box::new(move |_| self.primitive),
        })
    }

    /// Run `self` in an uninterruptible region. Interrupt signals received
    /// meanwhile are recorded and acted upon when the region ends.
    pub fn uninterruptible(self) -> Self {
        Self::from_primitive(Primitive::UpdateInterruptible {
            interruptible: false,
            body: Box::new(move |_| self.primitive),
        })
    }

    /// Run the effect built by `f` uninterruptibly. `f` receives a
    /// [`Restore`] that re-enables the ambient interruptibility for a
    /// sub-region.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: FnOnce(Restore) -> Effect<A, E> + Send + 'static,
    {
        Self::from_primitive(Primitive::UpdateInterruptible {
            interruptible: false,
            body: Box::new(move |previous| {
                f(Restore {
                    interruptible: previous,
                })
                .primitive
            }),
        })
    }

    /// Run `finalizer` with the exit of `self`, whatever it is. The
    /// finalizer runs uninterruptibly and its failure is sequenced after
    /// the failure of `self`.
    pub fn on_exit<F>(self, finalizer: F) -> Effect<A, E>
    where
        F: FnOnce(&Exit<A, E>) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            restore.apply(self).exit::<E>().flat_map(move |exit| {
                finalizer(&exit)
                    .exit::<E>()
                    .flat_map(move |after| Effect::from_exit(sequence_exits(exit, after)))
            })
        })
    }

    /// Run `finalizer` after `self`, whatever the outcome.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        self.on_exit(move |_| finalizer)
    }

    /// Run `cleanup` if `self` is interrupted. It receives the interruptors.
    pub fn on_interrupt<F>(self, cleanup: F) -> Effect<A, E>
    where
        F: FnOnce(BTreeSet<FiberId>) -> Effect<(), Infallible> + Send + 'static,
    {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) if cause.contains_interrupt() && cause.is_interrupted() => {
                cleanup(cause.interruptors())
            }
            _ => Effect::unit(),
        })
    }
}

impl<A: EffectValue, E: EffectError> Effect<A, Cause<E>> {
    /// Undo [`Effect::sandbox`].
    pub fn unsandbox(self) -> Effect<A, E> {
        self.map_error_cause(|cause| cause.flat_map(|inner| inner))
    }
}

impl<E: EffectError> Effect<(), E> {
    /// An effect that succeeds with `()`.
    pub fn unit() -> Self {
        Self::from_primitive(Primitive::unit())
    }

    /// Yield the worker thread to other fibers.
    pub fn yield_now() -> Self {
        Self::from_primitive(Primitive::Yield)
    }

    /// Suspend the fiber for `duration` of runtime clock time.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_primitive(Primitive::WithFiber(Box::new(move |fiber| {
            let clock = fiber.runtime().clock();
            Primitive::Async {
                register: Box::new(move |resume| {
                    let handle = clock.schedule(
                        duration,
                        Box::new(move || resume.resume(Primitive::unit())),
                    );
                    Some(Primitive::Sync(Box::new(move || {
                        handle.cancel();
                        Primitive::unit()
                    })))
                }),
                blocking_on: FiberId::None,
            }
        })))
    }
}

impl<E: EffectError> Effect<FiberId, E> {
    /// The identity of the running fiber.
    pub fn fiber_id() -> Self {
        Self::from_primitive(Primitive::WithFiber(Box::new(|fiber| {
            Primitive::Succeed(erase(fiber.id()))
        })))
    }
}

impl<E: EffectError> Effect<Runtime, E> {
    /// The runtime executing the fiber.
    pub fn runtime() -> Self {
        Self::from_primitive(Primitive::WithFiber(Box::new(|fiber| {
            Primitive::Succeed(erase(fiber.runtime().clone()))
        })))
    }
}

impl<E: EffectError> Effect<u64, E> {
    /// Current runtime clock time in milliseconds.
    pub fn clock_millis() -> Self {
        Self::from_primitive(Primitive::WithFiber(Box::new(|fiber| {
            Primitive::Succeed(erase(fiber.runtime().clock().now_millis()))
        })))
    }
}

/// Resumes a fiber suspended by [`Effect::async_callback`] or
/// [`Effect::async_interrupt`].
///
/// Only the first resumption counts; later ones are ignored and logged.
pub struct Callback<A, E> {
    resume: AsyncResume,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for Callback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: EffectValue, E: EffectError> Callback<A, E> {
    fn new(resume: AsyncResume) -> Self {
        Self {
            resume,
            _marker: PhantomData,
        }
    }

    /// Resume the fiber with `effect`.
    pub fn resume(&self, effect: Effect<A, E>) {
        self.resume.resume(effect.primitive);
    }

    /// Resume the fiber with a value.
    pub fn succeed(&self, value: A) {
        self.resume(Effect::succeed(value));
    }

    /// Resume the fiber with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume(Effect::fail(error));
    }

    /// Check whether the fiber was already resumed through this callback.
    pub fn is_resumed(&self) -> bool {
        self.resume.is_fired()
    }
}
