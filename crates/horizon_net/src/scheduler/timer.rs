//! Cron-style timers driven by the scheduler tick.
//!
//! Timers are created and stopped from any thread, but they only run on the
//! scheduler task. New timers are staged in a `created` list and merged at the
//! start of the next sweep; finished timers are collected in a `closing` list and
//! removed at the end of the sweep, so the live map is never mutated while it is
//! being walked.

use crate::error::NetError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::error;

/// Counter value of a timer that never expires.
pub const INFINITE: i64 = -1;

/// Function run when a timer fires.
pub type TimerFunc = Box<dyn FnMut() + Send + 'static>;

/// Decides whether a condition timer fires on a given sweep.
pub trait TimerCondition: Send + Sync {
    fn check(&self, now: Instant) -> bool;
}

impl<F> TimerCondition for F
where
    F: Fn(Instant) -> bool + Send + Sync,
{
    fn check(&self, now: Instant) -> bool {
        self(now)
    }
}

#[derive(Debug)]
struct TimerState {
    counter: AtomicI64,
    closed: AtomicBool,
}

/// Handle to a scheduled timer.
#[derive(Clone)]
pub struct Timer {
    id: u64,
    state: Arc<TimerState>,
}

impl Timer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stops the timer. It is removed on the next sweep; calling `stop` again
    /// has no effect.
    pub fn stop(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.counter.store(0, Ordering::Release);
    }

    /// Whether the timer has stopped or used up its run count.
    pub fn is_finished(&self) -> bool {
        self.state.counter.load(Ordering::Acquire) == 0
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("counter", &self.state.counter.load(Ordering::Relaxed))
            .finish()
    }
}

struct TimerEntry {
    id: u64,
    func: TimerFunc,
    create_at: Instant,
    interval: Duration,
    condition: Option<Box<dyn TimerCondition>>,
    elapse: Duration,
    state: Arc<TimerState>,
}

impl TimerEntry {
    fn counter(&self) -> i64 {
        self.state.counter.load(Ordering::Acquire)
    }

    fn fire(&mut self) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.func)())) {
            error!(
                "💥 Timer {} panicked: {}",
                self.id,
                super::panic_message(panic.as_ref())
            );
        }
    }
}

/// Owns every timer of one scheduler.
#[derive(Default)]
pub struct TimerManager {
    next_id: AtomicU64,
    timers: Mutex<HashMap<u64, TimerEntry>>,
    created: Mutex<Vec<TimerEntry>>,
    closing: Mutex<Vec<u64>>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timer that fires every `interval`, forever.
    pub fn new_timer<F>(&self, interval: Duration, func: F) -> Result<Timer, NetError>
    where
        F: FnMut() + Send + 'static,
    {
        self.new_count_timer(interval, INFINITE, func)
    }

    /// Timer that fires every `interval`, `count` times (or forever with
    /// [`INFINITE`]). The first run happens one interval after creation.
    pub fn new_count_timer<F>(&self, interval: Duration, count: i64, func: F) -> Result<Timer, NetError>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(NetError::InvalidTimer("non-positive interval"));
        }
        if count < INFINITE {
            return Err(NetError::InvalidTimer("negative count"));
        }
        Ok(self.stage(interval, count, None, Box::new(func)))
    }

    /// Timer that fires once, after `duration`.
    pub fn new_after_timer<F>(&self, duration: Duration, func: F) -> Result<Timer, NetError>
    where
        F: FnMut() + Send + 'static,
    {
        self.new_count_timer(duration, 1, func)
    }

    /// Timer that fires on every sweep where `condition` holds, until stopped.
    pub fn new_cond_timer<C, F>(&self, condition: C, func: F) -> Timer
    where
        C: TimerCondition + 'static,
        F: FnMut() + Send + 'static,
    {
        self.stage(Duration::MAX, INFINITE, Some(Box::new(condition)), Box::new(func))
    }

    fn stage(
        &self,
        interval: Duration,
        count: i64,
        condition: Option<Box<dyn TimerCondition>>,
        func: TimerFunc,
    ) -> Timer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let state = Arc::new(TimerState {
            counter: AtomicI64::new(count),
            closed: AtomicBool::new(false),
        });

        self.created.lock().push(TimerEntry {
            id,
            func,
            create_at: Instant::now(),
            interval,
            condition,
            elapse: interval,
            state: state.clone(),
        });

        Timer { id, state }
    }

    /// Number of live timers, not counting ones staged since the last sweep.
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one sweep at `now`.
    pub fn cron(&self, now: Instant) {
        let mut timers = std::mem::take(&mut *self.timers.lock());

        for entry in self.created.lock().drain(..) {
            timers.insert(entry.id, entry);
        }

        for entry in timers.values_mut() {
            let counter = entry.counter();
            if counter == INFINITE || counter > 0 {
                if let Some(condition) = &entry.condition {
                    if condition.check(now) {
                        entry.fire();
                    }
                } else if entry.create_at.checked_add(entry.elapse).is_some_and(|due| due <= now) {
                    entry.fire();
                    entry.elapse = entry.elapse.saturating_add(entry.interval);

                    // stop() may have zeroed the counter while the timer ran
                    let _ = entry.state.counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                        (c > 0).then(|| c - 1)
                    });
                }
            }

            if entry.counter() == 0 {
                self.closing.lock().push(entry.id);
            }
        }

        for id in self.closing.lock().drain(..) {
            timers.remove(&id);
        }

        *self.timers.lock() = timers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_count_timer_runs_after_each_interval() {
        let manager = TimerManager::new();
        let (hits, func) = counter();
        let timer = manager.new_count_timer(Duration::from_millis(10), 2, func).unwrap();

        // staged timers are merged but not yet due
        manager.cron(Instant::now());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len(), 1);

        manager.cron(Instant::now() + Duration::from_millis(15));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        manager.cron(Instant::now() + Duration::from_millis(25));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(timer.is_finished());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_after_timer_fires_once() {
        let manager = TimerManager::new();
        let (hits, func) = counter();
        manager.new_after_timer(Duration::from_millis(5), func).unwrap();

        let later = Instant::now() + Duration::from_secs(1);
        manager.cron(later);
        manager.cron(later + Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_stop_removes_timer_without_running() {
        let manager = TimerManager::new();
        let (hits, func) = counter();
        let timer = manager.new_timer(Duration::from_millis(1), func).unwrap();

        timer.stop();
        timer.stop();
        manager.cron(Instant::now() + Duration::from_secs(1));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_cond_timer_follows_condition() {
        let manager = TimerManager::new();
        let (hits, func) = counter();
        let enabled = Arc::new(AtomicBool::new(false));
        let flag = enabled.clone();
        let timer = manager.new_cond_timer(move |_now: Instant| flag.load(Ordering::SeqCst), func);

        manager.cron(Instant::now());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        enabled.store(true, Ordering::SeqCst);
        manager.cron(Instant::now());
        manager.cron(Instant::now());
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        timer.stop();
        manager.cron(Instant::now());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_panicking_timer_does_not_stop_sweep() {
        let manager = TimerManager::new();
        let (hits, func) = counter();
        manager
            .new_after_timer(Duration::from_millis(1), || panic!("timer failure"))
            .unwrap();
        manager.new_after_timer(Duration::from_millis(1), func).unwrap();

        manager.cron(Instant::now() + Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_parameters() {
        let manager = TimerManager::new();
        assert!(manager.new_timer(Duration::ZERO, || {}).is_err());
        assert!(manager.new_count_timer(Duration::from_secs(1), -2, || {}).is_err());
    }
}
