//! Task scheduling for handler code.
//!
//! Handlers never run on the connection tasks. The dispatcher submits each
//! handler call as a [`Task`] either to the global [`Scheduler`] or to a
//! [`Lane`], and each of those runs its tasks one at a time on a single tokio
//! task. Everything submitted to the same scheduler is therefore serialized,
//! which is how game logic for one room or table avoids locks.
//!
//! Every task runs inside a panic guard: a panicking handler is logged and the
//! queue keeps draining.

pub mod timer;

pub use timer::{Timer, TimerCondition, TimerManager, INFINITE};

use crate::error::NetError;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default precision of the timer sweep.
pub const DEFAULT_TIMER_PRECISION: Duration = Duration::from_secs(1);

/// Queue length above which the scheduler starts warning about overload.
pub const DEFAULT_TASK_BACKLOG_WARN: usize = 1 << 10;

/// A unit of work run on a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A single-consumer execution lane.
///
/// Services that declare a lane name run their handlers on the matching
/// `LocalScheduler` instead of the global scheduler.
pub trait LocalScheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves once `rx` observes `true`, or its sender is gone.
pub(crate) async fn signalled(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|raised| *raised).await;
}

/// Runs `task`, containing any panic. Returns false when the task panicked.
pub(crate) fn run_guarded(task: Task) -> bool {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(panic) => {
            error!("💥 Handle message panic: {}", panic_message(panic.as_ref()));
            false
        }
    }
}

/// The global scheduler: one task queue plus the timer sweep.
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Task>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    pending: Arc<AtomicUsize>,
    backlog_warn: usize,
    precision: Duration,
    timers: Arc<TimerManager>,
    die: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(precision: Duration, backlog_warn: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (die, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            backlog_warn,
            precision: if precision.is_zero() { DEFAULT_TIMER_PRECISION } else { precision },
            timers: Arc::new(TimerManager::new()),
            die,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the draining task. Must be called from within a tokio runtime;
    /// later calls are ignored.
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().take() else {
            debug!("Scheduler already started");
            return;
        };

        let pending = self.pending.clone();
        let timers = self.timers.clone();
        let precision = self.precision;
        let die = self.die.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(precision);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let stopped = signalled(die);
            tokio::pin!(stopped);

            loop {
                tokio::select! {
                    _ = ticker.tick() => timers.cron(Instant::now()),
                    task = rx.recv() => match task {
                        Some(task) => {
                            pending.fetch_sub(1, Ordering::AcqRel);
                            run_guarded(task);
                        }
                        None => break,
                    },
                    _ = &mut stopped => break,
                }
            }

            info!("🛑 Scheduler stopped");
        });

        *self.handle.lock() = Some(handle);
        info!("🕒 Scheduler started with timer precision {:?}", precision);
    }

    /// Queues a task. Never blocks; a large backlog is reported but not refused.
    pub fn push_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let backlog = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if backlog > self.backlog_warn {
            warn!("⚠️ Scheduler backlog is {} tasks", backlog);
        }

        if self.tx.send(Box::new(task)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!("Scheduler closed, task dropped");
        }
    }

    /// Number of queued tasks not yet started.
    pub fn backlog(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub fn new_timer<F>(&self, interval: Duration, func: F) -> Result<Timer, NetError>
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.new_timer(interval, func)
    }

    pub fn new_count_timer<F>(&self, interval: Duration, count: i64, func: F) -> Result<Timer, NetError>
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.new_count_timer(interval, count, func)
    }

    pub fn new_after_timer<F>(&self, duration: Duration, func: F) -> Result<Timer, NetError>
    where
        F: FnMut() + Send + 'static,
    {
        self.timers.new_after_timer(duration, func)
    }

    pub fn new_cond_timer<C, F>(&self, condition: C, func: F) -> Timer
    where
        C: TimerCondition + 'static,
        F: FnMut() + Send + 'static,
    {
        self.timers.new_cond_timer(condition, func)
    }

    /// Stops the draining task and waits for it to exit. Tasks still queued are
    /// dropped.
    pub async fn close(&self) {
        self.die.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Scheduler task failed: {}", e);
            }
        }
    }
}

impl LocalScheduler for Scheduler {
    fn schedule(&self, task: Task) {
        self.push_task(task);
    }
}

/// A dedicated execution lane with its own queue and draining task.
///
/// Give each room, table or other contended resource its own lane and every
/// handler touching it runs strictly one after another. The lane stops once it
/// is dropped and its queue is empty.
pub struct Lane {
    name: String,
    tx: mpsc::UnboundedSender<Task>,
}

impl Lane {
    /// Creates a lane and spawns its draining task on the current runtime.
    pub fn spawn(name: impl Into<String>) -> Arc<Lane> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        let lane_name = name.clone();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                run_guarded(task);
            }
            debug!("Lane {} drained and stopped", lane_name);
        });

        Arc::new(Lane { name, tx })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl LocalScheduler for Lane {
    fn schedule(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("Lane {} closed, task dropped", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_lane_runs_tasks_in_order() {
        let lane = Lane::spawn("room-1");
        let spans = Arc::new(Mutex::new(Vec::new()));

        let a = spans.clone();
        lane.schedule(Box::new(move || {
            let start = std::time::Instant::now();
            std::thread::sleep(Duration::from_millis(50));
            a.lock().push(("a", start, std::time::Instant::now()));
        }));
        let b = spans.clone();
        let (done_tx, done_rx) = oneshot::channel();
        lane.schedule(Box::new(move || {
            let start = std::time::Instant::now();
            b.lock().push(("b", start, std::time::Instant::now()));
            let _ = done_tx.send(());
        }));

        done_rx.await.unwrap();
        let spans = spans.lock();
        assert_eq!(spans[0].0, "a");
        assert_eq!(spans[1].0, "b");
        assert!(spans[1].1 >= spans[0].2, "b started before a finished");
    }

    #[tokio::test]
    async fn test_scheduler_survives_panicking_task() {
        let scheduler = Scheduler::new(Duration::from_millis(10), DEFAULT_TASK_BACKLOG_WARN);
        scheduler.start();

        scheduler.push_task(|| panic!("handler failure"));
        let (tx, rx) = oneshot::channel();
        scheduler.push_task(move || {
            let _ = tx.send(42);
        });

        assert_eq!(rx.await.unwrap(), 42);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn test_scheduler_drives_timers() {
        let scheduler = Scheduler::new(Duration::from_millis(5), DEFAULT_TASK_BACKLOG_WARN);
        scheduler.start();

        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        scheduler
            .new_after_timer(Duration::from_millis(20), move || {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("timer did not fire")
            .unwrap();
        scheduler.close().await;
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let scheduler = Scheduler::new(Duration::from_millis(10), 4);
        scheduler.start();
        scheduler.start();
        scheduler.close().await;

        scheduler.push_task(|| {});
        // receiver is gone once the loop exits
        assert_eq!(scheduler.backlog(), 0);
    }
}
