//! Timer wheel backing the live clock.
//!
//! One ring of buckets advanced by a fixed tick. Scheduling and
//! cancelling are constant time; a timer due more than one revolution out
//! stays in its bucket until the ring comes round to its tick.
//!
//! Callbacks run on the wheel's tick thread, so they must be short. Fiber
//! wake-ups only hand the fiber back to its scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::RuntimeError;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// 1024 buckets of 1ms: one revolution is roughly a second.
const DEFAULT_WHEEL_SIZE: usize = 1024;

/// A callback run when its timer expires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    due_tick: u64,
    callback: TimerCallback,
    /// Set on cancel and on fire, whichever comes first.
    cancelled: Arc<AtomicBool>,
}

/// Cancellation handle returned by [`TimerWheel::schedule`] and
/// [`Clock::schedule`](crate::Clock::schedule).
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub(crate) fn new(id: u64, cancelled: Arc<AtomicBool>) -> Self {
        Self { id, cancelled }
    }

    /// Returns `true` when this call won against firing and earlier
    /// cancels.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// `true` once the timer was cancelled or fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Ring {
    buckets: Vec<Mutex<VecDeque<Pending>>>,
    /// Ticks processed so far.
    ticks: AtomicU64,
    next_id: AtomicU64,
    tick_interval: Duration,
    stopped: AtomicBool,
    wakeup: Condvar,
    wakeup_lock: Mutex<()>,
}

impl Ring {
    fn new(tick_interval: Duration, buckets: usize) -> Self {
        Self {
            buckets: (0..buckets).map(|_| Mutex::new(VecDeque::new())).collect(),
            ticks: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            tick_interval,
            stopped: AtomicBool::new(false),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        }
    }

    fn bucket(&self, tick: u64) -> &Mutex<VecDeque<Pending>> {
        &self.buckets[(tick % self.buckets.len() as u64) as usize]
    }

    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        // Rounded up: never early, at most one tick late.
        let ticks = delay.as_nanos().div_ceil(self.tick_interval.as_nanos().max(1));
        let due_tick = self
            .ticks
            .load(Ordering::Acquire)
            .saturating_add(u64::try_from(ticks).unwrap_or(u64::MAX));

        let cancelled = Arc::new(AtomicBool::new(false));
        self.bucket(due_tick).lock().push_back(Pending {
            due_tick,
            callback,
            cancelled: Arc::clone(&cancelled),
        });
        self.wakeup.notify_one();

        TimerHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed), cancelled)
    }

    fn tick(&self) -> Vec<TimerCallback> {
        let now = self.ticks.fetch_add(1, Ordering::AcqRel);
        let mut bucket = self.bucket(now).lock();
        let (due, later): (VecDeque<Pending>, VecDeque<Pending>) =
            bucket.drain(..).partition(|pending| pending.due_tick <= now);
        *bucket = later;
        drop(bucket);

        due.into_iter()
            .filter(|pending| !pending.cancelled.swap(true, Ordering::AcqRel))
            .map(|pending| pending.callback)
            .collect()
    }
}

/// A timing wheel driven by its own tick thread.
pub struct TimerWheel {
    inner: Arc<Ring>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// 1ms ticks, 1024 buckets.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_TICK_INTERVAL, DEFAULT_WHEEL_SIZE)
    }

    pub fn with_config(tick_interval: Duration, buckets: usize) -> Self {
        Self {
            inner: Arc::new(Ring::new(tick_interval, buckets.max(1))),
            tick_thread: Mutex::new(None),
        }
    }

    /// Start the tick thread. Starting twice does nothing.
    ///
    /// Without a tick thread, timers only fire through [`TimerWheel::advance`].
    pub fn start(&self, thread_name: &str) -> Result<(), RuntimeError> {
        let mut running = self.tick_thread.lock();
        if running.is_none() {
            let ring = Arc::clone(&self.inner);
            let handle = thread::Builder::new()
                .name(thread_name.to_string())
                .spawn(move || drive(&ring))
                .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
            *running = Some(handle);
        }
        Ok(())
    }

    /// Stop the tick thread. Pending timers never fire.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.wakeup.notify_one();

        if let Some(handle) = self.tick_thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Schedule `callback` to run after `delay`.
    pub fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.inner.schedule(delay, callback)
    }

    /// Process one tick by hand and hand back the callbacks now due,
    /// without running them.
    pub fn advance(&self) -> Vec<TimerCallback> {
        self.inner.tick()
    }

    /// Ticks processed so far.
    pub fn current_tick(&self) -> u64 {
        self.inner.ticks.load(Ordering::Acquire)
    }

    pub fn tick_interval(&self) -> Duration {
        self.inner.tick_interval
    }
}

/// Tick-thread body: sleep until the next tick is due, then run what
/// expired.
fn drive(ring: &Ring) {
    let mut deadline = Instant::now() + ring.tick_interval;
    while !ring.stopped.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            ring.tick().into_iter().for_each(|callback| callback());
            deadline += ring.tick_interval;
        } else {
            let mut lock = ring.wakeup_lock.lock();
            let _ = ring.wakeup.wait_for(&mut lock, deadline - now);
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = wheel.schedule(Duration::from_millis(2), counter_callback(&fired));

        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!handle.cancel());

        for _ in 0..5 {
            for callback in wheel.advance() {
                callback();
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timer_fires_on_deadline_tick() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule(Duration::from_millis(3), counter_callback(&fired));

        for _ in 0..3 {
            assert!(wheel.advance().is_empty());
        }
        let expired = wheel.advance();
        assert_eq!(expired.len(), 1);
        for callback in expired {
            callback();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_beyond_one_revolution() {
        let wheel = TimerWheel::with_config(Duration::from_millis(1), 4);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule(Duration::from_millis(6), counter_callback(&fired));

        let mut total = 0;
        for tick in 0..=6 {
            let expired = wheel.advance();
            if tick < 6 {
                assert!(expired.is_empty());
            }
            total += expired.len();
        }
        assert_eq!(total, 1);
    }

    #[test]
    fn test_fired_timer_cannot_be_cancelled() {
        let wheel = TimerWheel::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = wheel.schedule(Duration::ZERO, counter_callback(&fired));
        assert_eq!(wheel.advance().len(), 1);
        assert!(!handle.cancel());
    }

    #[test]
    fn test_tick_thread_fires_timers() {
        let wheel = TimerWheel::new();
        wheel.start("weft-timer-test").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        wheel.schedule(Duration::from_millis(5), counter_callback(&fired));

        for _ in 0..200 {
            if fired.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        wheel.stop();
    }
}
