//! Concurrent combinators built on fork, await and interrupt.
//!
//! Every combinator here forks its operands as children of the calling
//! fiber. Interrupting the caller therefore interrupts them, and the caller
//! does not finish before they do. A loser is always interrupted and then
//! awaited, so its finalizers have run by the time the combinator returns.

use std::sync::Arc;
use std::time::Duration;

use crate::cause::Cause;
use crate::effect::{recover, Effect, EffectError, EffectValue, Primitive};
use crate::exit::Exit;
use crate::fiber::{await_first, Fiber, FiberContext};

/// Which operand finished first.
enum Side {
    Left,
    Right,
}

fn first_of<E: EffectError>(
    left: &Arc<FiberContext>,
    right: &Arc<FiberContext>,
) -> Effect<Side, E> {
    Effect::from_primitive(Primitive::FlatMap {
        effect: Box::new(await_first(vec![Arc::clone(left), Arc::clone(right)])),
        then: Box::new(|value| match recover::<usize>(value) {
            Ok(0) => Primitive::Succeed(Box::new(Side::Left)),
            Ok(_) => Primitive::Succeed(Box::new(Side::Right)),
            Err(cause) => Primitive::Fail(cause),
        }),
    })
}

/// Add the exit of an interrupted loser to the winner's failure, unless the
/// loser only reports the interruption it was sent.
fn with_loser<A, E: EffectError>(winner: Cause<E>, loser: Exit<A, E>) -> Cause<E> {
    match loser {
        Exit::Failure(cause) if !cause.is_interrupted_only() => winner.both(cause),
        _ => winner,
    }
}

impl<A, E> Effect<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    /// Run `self` and `that` concurrently and continue with the handler of
    /// whichever finishes first. The handler receives the winner's exit and
    /// the still-running loser.
    ///
    /// The winner's FiberRefs are merged into the caller's before the
    /// handler runs.
    pub fn race_with<B, E2, C, E3, L, R>(
        self,
        that: Effect<B, E2>,
        left_done: L,
        right_done: R,
    ) -> Effect<C, E3>
    where
        B: Clone + Send + Sync + 'static,
        E2: EffectError,
        C: EffectValue,
        E3: EffectError,
        L: FnOnce(Exit<A, E>, Fiber<B, E2>) -> Effect<C, E3> + Send + 'static,
        R: FnOnce(Exit<B, E2>, Fiber<A, E>) -> Effect<C, E3> + Send + 'static,
    {
        self.fork::<E3>()
            .zip(that.fork::<E3>())
            .flat_map(move |(left, right)| {
                first_of::<E3>(left.context(), right.context()).flat_map(move |side| match side {
                    Side::Left => left
                        .await_exit::<E3>()
                        .zip_left(left.inherit_fiber_refs())
                        .flat_map(move |exit| left_done(exit, right)),
                    Side::Right => right
                        .await_exit::<E3>()
                        .zip_left(right.inherit_fiber_refs())
                        .flat_map(move |exit| right_done(exit, left)),
                })
            })
    }

    /// Return the first success of `self` and `that`, interrupting the
    /// other. If both fail, the failure holds both causes.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        self.race_with(
            that,
            |exit, loser| match exit {
                Exit::Success(value) => loser.interrupt::<E>().as_(value),
                Exit::Failure(cause) => {
                    loser.join().map_error_cause(move |other| cause.both(other))
                }
            },
            |exit, loser| match exit {
                Exit::Success(value) => loser.interrupt::<E>().as_(value),
                Exit::Failure(cause) => {
                    loser.join().map_error_cause(move |other| other.both(cause))
                }
            },
        )
    }

    /// Run `self` and `that` concurrently and pair their values. The first
    /// failure interrupts the other side.
    pub fn zip_par<B>(self, that: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.race_with(
            that,
            |exit, right| match exit {
                Exit::Success(a) => right.join().map(move |b| (a, b)),
                Exit::Failure(cause) => right
                    .interrupt::<E>()
                    .flat_map(move |other| Effect::fail_cause(with_loser(cause, other))),
            },
            |exit, left| match exit {
                Exit::Success(b) => left.join().map(move |a| (a, b)),
                Exit::Failure(cause) => left
                    .interrupt::<E>()
                    .flat_map(move |other| Effect::fail_cause(with_loser(cause, other))),
            },
        )
    }

    /// Run `f` over every item concurrently, one fiber per item, and
    /// collect the values in item order.
    ///
    /// The first failure interrupts the fibers still running. The result
    /// then fails with every failure observed, combined with `both`.
    pub fn for_each_par<I, T, F>(items: I, mut f: F) -> Effect<Vec<A>, E>
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        F: FnMut(T) -> Effect<A, E> + Send + 'static,
    {
        let items: Vec<T> = items.into_iter().collect();
        Effect::<Fiber<A, E>, E>::for_each(items, move |item| f(item).fork::<E>())
            .flat_map(|fibers| supervise_all(fibers.clone(), fibers))
    }

    /// Run `self` with a time limit on the runtime clock. On timeout the
    /// effect is interrupted and `None` is returned.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.race_with(
            Effect::<(), E>::sleep(duration),
            |exit, timer| timer.interrupt::<E>().zip_right(Effect::from_exit(exit.map(Some))),
            |_, fiber| fiber.interrupt::<E>().as_(None),
        )
    }

    /// Like [`Effect::timeout`], failing with `error` on timeout.
    pub fn timeout_fail(self, error: E, duration: Duration) -> Effect<A, E> {
        self.timeout(duration).flat_map(move |value| match value {
            Some(value) => Effect::succeed(value),
            None => Effect::fail(error),
        })
    }
}

/// Combine the exits of sibling fibers. Once one of them failed for a
/// reason other than interruption, the interruptions it caused are left out.
fn combine_siblings<A, E: EffectError>(exits: Vec<Exit<A, E>>) -> Exit<Vec<A>, E> {
    let failed = exits
        .iter()
        .any(|exit| matches!(exit, Exit::Failure(cause) if !cause.is_interrupted_only()));
    Exit::collect_all_par(
        exits
            .into_iter()
            .filter(|exit| !(failed && exit.is_interrupted())),
    )
}

/// Wait for every fiber in `pending`, interrupting the rest on the first
/// failure, then combine the exits of `all` in order.
fn supervise_all<A, E>(all: Vec<Fiber<A, E>>, pending: Vec<Fiber<A, E>>) -> Effect<Vec<A>, E>
where
    A: Clone + Send + Sync + 'static,
    E: EffectError,
{
    if pending.is_empty() {
        return Effect::<Exit<A, E>, E>::for_each(all, |fiber| fiber.await_exit::<E>())
            .flat_map(|exits| Effect::from_exit(combine_siblings(exits)));
    }
    let contexts: Vec<Arc<FiberContext>> =
        pending.iter().map(|f| Arc::clone(f.context())).collect();
    Effect::<usize, E>::from_primitive(await_first(contexts)).flat_map(move |index| {
        let mut pending = pending;
        let done = pending.swap_remove(index);
        if matches!(done.poll(), Some(Exit::Failure(_))) {
            Fiber::interrupt_all::<E>(pending).zip_right(supervise_all(all, Vec::new()))
        } else {
            supervise_all(all, pending)
        }
    })
}
