//! Time sources.
//!
//! The runtime reads time and schedules wake-ups only through the [`Clock`]
//! trait. [`LiveClock`] follows wall time on a [`TimerWheel`];
//! [`TestClock`] only moves when a test calls [`TestClock::adjust`], which
//! makes timeouts and retry delays deterministic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::RuntimeError;
use crate::timer::{TimerCallback, TimerHandle, TimerWheel};

/// A monotonic time source that can schedule callbacks.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary, fixed origin. Never decreases.
    fn now_millis(&self) -> u64;

    /// Run `callback` once `delay` has elapsed on this clock.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Release background resources.
    fn shutdown(&self) {}
}

/// Wall-clock time backed by a timer wheel thread.
pub struct LiveClock {
    wheel: TimerWheel,
    origin_millis: u64,
    started: Instant,
}

impl LiveClock {
    /// Start a live clock whose tick thread is called `thread_name`.
    pub fn new(thread_name: &str) -> Result<Self, RuntimeError> {
        let wheel = TimerWheel::new();
        wheel.start(thread_name)?;
        let origin_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            wheel,
            origin_millis,
            started: Instant::now(),
        })
    }
}

impl std::fmt::Debug for LiveClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClock")
            .field("now_millis", &self.now_millis())
            .finish()
    }
}

impl Clock for LiveClock {
    fn now_millis(&self) -> u64 {
        self.origin_millis + self.started.elapsed().as_millis() as u64
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.wheel.schedule(delay, callback)
    }

    fn shutdown(&self) {
        self.wheel.stop();
    }
}

struct Sleeper {
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

struct TestState {
    now_millis: u64,
    next_id: u64,
    /// Keyed by (deadline, id) so equal deadlines fire in schedule order.
    sleepers: BTreeMap<(u64, u64), Sleeper>,
}

impl TestState {
    fn live_sleepers(&self) -> usize {
        self.sleepers
            .values()
            .filter(|s| !s.cancelled.load(Ordering::Acquire))
            .count()
    }
}

/// A virtual clock for tests.
///
/// Time stands still until [`TestClock::adjust`] moves it; every callback
/// whose deadline is reached then runs on the adjusting thread, in deadline
/// order.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<TestClockInner>,
}

struct TestClockInner {
    state: Mutex<TestState>,
    changed: Condvar,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TestClock")
            .field("now_millis", &state.now_millis)
            .field("sleepers", &state.live_sleepers())
            .finish()
    }
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// A clock standing at time zero.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TestClockInner {
                state: Mutex::new(TestState {
                    now_millis: 0,
                    next_id: 1,
                    sleepers: BTreeMap::new(),
                }),
                changed: Condvar::new(),
            }),
        }
    }

    /// Move time forward by `delta`, running every callback that becomes
    /// due.
    pub fn adjust(&self, delta: Duration) {
        let target = self.inner.state.lock().now_millis.saturating_add(whole_millis(delta));
        loop {
            let due = {
                let mut state = self.inner.state.lock();
                let next = state.sleepers.keys().next().copied();
                match next {
                    Some(key) if key.0 <= target => {
                        state.now_millis = state.now_millis.max(key.0);
                        state.sleepers.remove(&key)
                    }
                    _ => {
                        state.now_millis = target;
                        None
                    }
                }
            };
            match due {
                Some(sleeper) => {
                    if !sleeper.cancelled.swap(true, Ordering::AcqRel) {
                        (sleeper.callback)();
                    }
                }
                None => break,
            }
        }
        trace!(now_millis = target, "test clock adjusted");
        self.inner.changed.notify_all();
    }

    /// Number of scheduled callbacks that are neither cancelled nor fired.
    pub fn sleepers(&self) -> usize {
        self.inner.state.lock().live_sleepers()
    }

    /// Block until at least `count` callbacks are waiting, or `timeout`
    /// passes. Returns whether the count was reached.
    pub fn wait_for_sleepers(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.live_sleepers() < count {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                return state.live_sleepers() >= count;
            }
        }
        true
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> u64 {
        self.inner.state.lock().now_millis
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let deadline = state.now_millis.saturating_add(whole_millis(delay));
            state.sleepers.insert(
                (deadline, id),
                Sleeper {
                    cancelled: Arc::clone(&cancelled),
                    callback,
                },
            );
            TimerHandle::new(id, cancelled)
        };
        self.inner.changed.notify_all();
        handle
    }
}
