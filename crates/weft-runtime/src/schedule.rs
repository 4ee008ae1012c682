//! Recurrence policies for retrying and repeating effects.
//!
//! A [`Schedule`] is a pure value: given how many recurrences already
//! happened, it says whether to go again and after what delay. The drivers
//! ([`Effect::retry`], [`Effect::repeat`]) are ordinary effects built on
//! `sleep`, so they run on the runtime clock and are interruptible while
//! waiting.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::effect::{Effect, EffectError, EffectValue};

/// A recurrence policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Recur `n` times without delay.
    Recurs(u32),
    /// Recur forever with a fixed delay.
    Spaced(Duration),
    /// Recur forever, the delay growing as `base * factor^n`.
    Exponential { base: Duration, factor: f64 },
    /// Recur forever, the delays following the Fibonacci sequence scaled
    /// by `one`.
    Fibonacci(Duration),
    /// Recur forever without delay.
    Forever,
    /// Recur while both recur, with the longer delay.
    And(Box<Schedule>, Box<Schedule>),
    /// Recur while either recurs, with the shorter delay.
    Union(Box<Schedule>, Box<Schedule>),
}

impl Schedule {
    pub fn recurs(n: u32) -> Self {
        Schedule::Recurs(n)
    }

    pub fn spaced(delay: Duration) -> Self {
        Schedule::Spaced(delay)
    }

    /// Exponential backoff doubling from `base`.
    pub fn exponential(base: Duration) -> Self {
        Schedule::Exponential { base, factor: 2.0 }
    }

    pub fn exponential_with_factor(base: Duration, factor: f64) -> Self {
        Schedule::Exponential { base, factor }
    }

    pub fn fibonacci(one: Duration) -> Self {
        Schedule::Fibonacci(one)
    }

    pub fn forever() -> Self {
        Schedule::Forever
    }

    /// Intersection: recur only while both schedules do.
    pub fn and(self, that: Schedule) -> Self {
        Schedule::And(Box::new(self), Box::new(that))
    }

    /// Union: recur while either schedule does.
    pub fn union(self, that: Schedule) -> Self {
        Schedule::Union(Box::new(self), Box::new(that))
    }

    /// The delay before recurrence number `attempt` (zero-based), or
    /// `None` if the schedule is done.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            Schedule::Recurs(n) => (attempt < *n).then_some(Duration::ZERO),
            Schedule::Spaced(delay) => Some(*delay),
            Schedule::Exponential { base, factor } => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                let nanos = base.as_nanos() as f64 * factor.powi(exponent);
                if nanos >= u64::MAX as f64 {
                    Some(Duration::MAX)
                } else {
                    Some(Duration::from_nanos(nanos.round() as u64))
                }
            }
            Schedule::Fibonacci(one) => {
                let (mut a, mut b) = (1u32, 1u32);
                for _ in 0..attempt {
                    (a, b) = (b, a.saturating_add(b));
                }
                Some(one.saturating_mul(a))
            }
            Schedule::Forever => Some(Duration::ZERO),
            Schedule::And(left, right) => {
                let left = left.next_delay(attempt)?;
                let right = right.next_delay(attempt)?;
                Some(left.max(right))
            }
            Schedule::Union(left, right) => {
                match (left.next_delay(attempt), right.next_delay(attempt)) {
                    (Some(l), Some(r)) => Some(l.min(r)),
                    (delay, None) | (None, delay) => delay,
                }
            }
        }
    }
}

fn retry_from<A, E, F>(factory: Arc<F>, schedule: Arc<Schedule>, attempt: u32) -> Effect<A, E>
where
    A: EffectValue,
    E: EffectError,
    F: Fn() -> Effect<A, E> + Send + Sync + 'static,
{
    factory().catch_all(move |error| match schedule.next_delay(attempt) {
        Some(delay) => {
            debug!(attempt = attempt + 1, ?delay, ?error, "retrying after failure");
            Effect::<(), E>::sleep(delay).zip_right(retry_from(factory, schedule, attempt + 1))
        }
        None => Effect::fail(error),
    })
}

fn repeat_from<A, E, F>(factory: Arc<F>, schedule: Arc<Schedule>, attempt: u32) -> Effect<A, E>
where
    A: EffectValue,
    E: EffectError,
    F: Fn() -> Effect<A, E> + Send + Sync + 'static,
{
    factory().flat_map(move |value| match schedule.next_delay(attempt) {
        Some(delay) => {
            Effect::<(), E>::sleep(delay).zip_right(repeat_from(factory, schedule, attempt + 1))
        }
        None => Effect::succeed(value),
    })
}

impl<A: EffectValue, E: EffectError> Effect<A, E> {
    /// Run the effect built by `factory`, rebuilding and re-running it
    /// after each typed failure while `schedule` allows. Defects and
    /// interruption are not retried.
    pub fn retry<F>(factory: F, schedule: Schedule) -> Effect<A, E>
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let schedule = Arc::new(schedule);
        Effect::suspend(move || retry_from(factory, schedule, 0))
    }

    /// Run the effect built by `factory`, then again after each success
    /// while `schedule` allows. Returns the last value; the first failure
    /// stops the loop.
    pub fn repeat<F>(factory: F, schedule: Schedule) -> Effect<A, E>
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        let factory = Arc::new(factory);
        let schedule = Arc::new(schedule);
        Effect::suspend(move || repeat_from(factory, schedule, 0))
    }

    /// Run the effect `1 + n` times.
    pub fn repeat_n<F>(factory: F, n: u32) -> Effect<A, E>
    where
        F: Fn() -> Effect<A, E> + Send + Sync + 'static,
    {
        Self::repeat(factory, Schedule::recurs(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::exit::Exit;
    use crate::sync_ref::Ref;
    use crate::{Runtime, RuntimeConfig};
    use pretty_assertions::assert_eq;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_schedule_delays() {
        assert_eq!(Schedule::recurs(2).next_delay(1), Some(Duration::ZERO));
        assert_eq!(Schedule::recurs(2).next_delay(2), None);
        assert_eq!(Schedule::spaced(ms(5)).next_delay(100), Some(ms(5)));
        assert_eq!(Schedule::exponential(ms(10)).next_delay(3), Some(ms(80)));
        let fib: Vec<_> = (0..6).map(|n| Schedule::fibonacci(ms(1)).next_delay(n)).collect();
        assert_eq!(fib, [1, 1, 2, 3, 5, 8].map(|n| Some(ms(n))));
    }

    #[test]
    fn test_schedule_composition() {
        let both = Schedule::spaced(ms(10)).and(Schedule::recurs(2));
        assert_eq!(both.next_delay(0), Some(ms(10)));
        assert_eq!(both.next_delay(2), None);

        let either = Schedule::spaced(ms(10)).union(Schedule::recurs(1));
        assert_eq!(either.next_delay(0), Some(Duration::ZERO));
        assert_eq!(either.next_delay(5), Some(ms(10)));
    }

    #[test]
    fn test_retry_until_success() {
        let runtime = Runtime::new(RuntimeConfig::new().with_workers(2)).unwrap();
        let attempts = Ref::new(0u32);
        let counter = attempts.clone();
        let effect = Effect::<u32, String>::retry(
            move || {
                counter.update_and_get(|n| n + 1).flat_map(|n| {
                    if n < 3 {
                        Effect::fail(format!("attempt {}", n))
                    } else {
                        Effect::succeed(n)
                    }
                })
            },
            Schedule::recurs(5),
        );
        assert_eq!(runtime.run_sync(effect), Exit::Success(3));
    }

    #[test]
    fn test_retry_gives_up() {
        let runtime = Runtime::new(RuntimeConfig::new().with_workers(2)).unwrap();
        let effect =
            Effect::<u32, String>::retry(|| Effect::fail("nope".to_string()), Schedule::recurs(2));
        assert_eq!(runtime.run_sync(effect), Exit::fail("nope".to_string()));
    }

    #[test]
    fn test_retry_does_not_catch_defects() {
        let runtime = Runtime::new(RuntimeConfig::new().with_workers(2)).unwrap();
        let attempts = Ref::new(0u32);
        let counter = attempts.clone();
        let effect = Effect::<u32, String>::retry(
            move || counter.update(|n| n + 1).zip_right(Effect::die_message("bug")),
            Schedule::forever(),
        )
        .exit::<String>()
        .zip(attempts.get());
        let (exit, count) = runtime.run_sync(effect).into_result().unwrap();
        assert!(exit.cause().is_some_and(|c| c.is_die()));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_retry_sleeps_on_the_runtime_clock() {
        let clock = TestClock::new();
        let runtime = Runtime::builder()
            .config(RuntimeConfig::new().with_workers(2))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        let effect = Effect::<u32, String>::retry(
            || Effect::fail("down".to_string()),
            Schedule::exponential(ms(100)),
        );
        let fiber = runtime.run_fork(effect.timeout_fail("gave up".to_string(), ms(1000)));

        for delay in [100, 200, 400] {
            assert!(clock.wait_for_sleepers(2, Duration::from_secs(5)));
            clock.adjust(ms(delay));
        }
        // 700ms have passed; the next backoff (800ms) outlasts the timeout.
        assert!(clock.wait_for_sleepers(2, Duration::from_secs(5)));
        clock.adjust(ms(300));
        assert_eq!(fiber.await_blocking(), Exit::fail("gave up".to_string()));
    }

    #[test]
    fn test_repeat_n() {
        let runtime = Runtime::new(RuntimeConfig::new().with_workers(2)).unwrap();
        let counter = Ref::new(0u32);
        let inner = counter.clone();
        let effect = Effect::<(), String>::repeat_n(move || inner.update(|n| n + 1), 99)
            .zip_right(counter.get());
        assert_eq!(runtime.run_sync(effect), Exit::Success(100));
    }
}
