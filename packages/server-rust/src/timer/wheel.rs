//! Single-task timer scheduler.
//!
//! One tokio task owns the [`TimerHeap`]. Every mutation arrives over one
//! unbounded command channel, so `add_task` and `cancel` are synchronous,
//! keep their submission order, and may be called from inside a running
//! callback. Every tick the scheduler fires all due tasks.
//!
//! Callbacks run inline on the scheduler task and must not block: a slow
//! callback delays every other timer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use framewire_core::{AtomicBoolean, AtomicUint64};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, trace};

use super::heap::{Callback, Repeat, TaskId, TimerHeap, TimerTask};

/// Default scheduling resolution.
pub const DEFAULT_TICK: Duration = Duration::from_millis(500);

/// Errors returned when scheduling a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("timer wheel has been stopped")]
    Stopped,

    #[error("a task must fire at least once")]
    ZeroCount,
}

enum Command {
    Add(TimerTask),
    Cancel(TaskId),
    Len(oneshot::Sender<usize>),
    Stop,
}

/// Handle to the scheduler task.
pub struct TimerWheel {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicUint64,
    stopped: AtomicBoolean,
    tick: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWheel {
    /// Starts a scheduler with the default 500 ms tick.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Starts a scheduler with a custom tick resolution.
    #[must_use]
    pub fn with_tick(tick: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_scheduler(rx, tick));
        Self {
            tx,
            next_id: AtomicUint64::new(1),
            stopped: AtomicBoolean::new(false),
            tick,
            handle: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Schedules `callback` to fire every `interval`, first at `now + interval`.
    ///
    /// # Errors
    ///
    /// `Stopped` after [`TimerWheel::stop`], `ZeroCount` for `Repeat::Times(0)`.
    pub fn add_task<F>(&self, interval: Duration, repeat: Repeat, callback: F) -> Result<TaskId, TimerError>
    where
        F: FnMut() + Send + 'static,
    {
        if repeat == Repeat::Times(0) {
            return Err(TimerError::ZeroCount);
        }
        if self.stopped.get() {
            return Err(TimerError::Stopped);
        }
        let id = TaskId(self.next_id.get_and_increment());
        let task = TimerTask::new(id, interval, repeat, Box::new(callback) as Callback);
        self.tx
            .send(Command::Add(task))
            .map_err(|_| TimerError::Stopped)?;
        trace!(task_id = %id, ?interval, ?repeat, "timer task added");
        Ok(id)
    }

    /// Cancels a task. Unknown or already finished ids are ignored.
    pub fn cancel(&self, id: TaskId) {
        let _ = self.tx.send(Command::Cancel(id));
    }

    /// Number of tasks currently scheduled. Zero once stopped.
    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Len(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops the scheduler, firing every still-scheduled callback once.
    ///
    /// Returns after the scheduler task has exited.
    pub async fn stop(&self) {
        if self.stopped.compare_and_set(false, true) {
            let _ = self.tx.send(Command::Stop);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "timer scheduler task failed");
            }
        }
    }
}

/// Next deadline for a repeating task. Falls back to `now` when the task
/// has drifted a full tick or more behind schedule.
fn next_fire_at(previous: Instant, interval: Duration, now: Instant, tick: Duration) -> Instant {
    let next = previous + interval;
    if now.saturating_duration_since(next) >= tick {
        now
    } else {
        next
    }
}

fn invoke(task: &mut TimerTask) {
    if catch_unwind(AssertUnwindSafe(|| (task.callback)())).is_err() {
        error!(task_id = %task.id, "timer callback panicked");
    }
}

async fn run_scheduler(mut rx: mpsc::UnboundedReceiver<Command>, tick: Duration) {
    let mut heap = TimerHeap::new();
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(Command::Add(task)) => heap.push(task),
                Some(Command::Cancel(id)) => {
                    if let Some(index) = heap.position(id) {
                        heap.remove_at(index);
                        trace!(task_id = %id, "timer task cancelled");
                    }
                }
                Some(Command::Len(reply)) => {
                    let _ = reply.send(heap.len());
                }
                Some(Command::Stop) | None => break,
            },
            _ = ticker.tick() => fire_due(&mut heap, tick),
        }
    }

    debug!(remaining = heap.len(), "timer wheel stopping, flushing tasks");
    while let Some(mut task) = heap.pop() {
        invoke(&mut task);
    }
}

fn fire_due(heap: &mut TimerHeap, tick: Duration) {
    let now = Instant::now();
    let mut rescheduled = Vec::new();
    while heap.peek().is_some_and(|t| t.fire_at <= now) {
        let Some(mut task) = heap.pop() else { break };
        invoke(&mut task);
        if task.consume() {
            task.fire_at = next_fire_at(task.fire_at, task.interval, now, tick);
            rescheduled.push(task);
        }
    }
    // Pushed after the sweep so a snapped task fires at most once per tick.
    for task in rescheduled {
        heap.push(task);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use framewire_core::AtomicInt32;

    use super::*;

    fn counter() -> (Arc<AtomicInt32>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicInt32::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.increment_and_get();
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_count_times() {
        let wheel = TimerWheel::start();
        let started = Instant::now();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&fired);
        wheel
            .add_task(Duration::from_secs(1), Repeat::Times(3), move || {
                log.lock().push(started.elapsed().as_millis());
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*fired.lock(), vec![1_000, 2_000, 3_000]);
        assert_eq!(wheel.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_fire_waits_for_interval() {
        let wheel = TimerWheel::start();
        let (count, cb) = counter();
        wheel.add_task(Duration::from_secs(3), Repeat::Times(1), cb).unwrap();

        tokio::time::sleep(Duration::from_millis(2_200)).await;
        assert_eq!(count.get(), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forever_task_runs_until_cancelled() {
        let wheel = TimerWheel::start();
        let (count, cb) = counter();
        let id = wheel.add_task(Duration::from_secs(1), Repeat::Forever, cb).unwrap();

        tokio::time::sleep(Duration::from_millis(5_250)).await;
        let fired = count.get();
        assert!(fired >= 4, "expected repeated fires, got {fired}");

        wheel.cancel(id);
        assert_eq!(wheel.len().await, 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.get(), fired);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_first_fire() {
        let wheel = TimerWheel::start();
        let (count, cb) = counter();
        let id = wheel.add_task(Duration::from_secs(1), Repeat::Times(1), cb).unwrap();
        wheel.cancel(id);
        wheel.cancel(id);
        wheel.cancel(TaskId(9_999));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.get(), 0);
        assert!(wheel.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_deadlines_fire_in_submission_order() {
        let wheel = TimerWheel::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            wheel
                .add_task(Duration::from_secs(1), Repeat::Times(1), move || order.lock().push(label))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_may_cancel_its_own_task() {
        let wheel = Arc::new(TimerWheel::start());
        let own_id = Arc::new(Mutex::new(None::<TaskId>));
        let (count, mut bump) = counter();

        let id = wheel
            .add_task(Duration::from_secs(1), Repeat::Forever, {
                let wheel = Arc::clone(&wheel);
                let own_id = Arc::clone(&own_id);
                move || {
                    bump();
                    if let Some(id) = *own_id.lock() {
                        wheel.cancel(id);
                    }
                }
            })
            .unwrap();
        *own_id.lock() = Some(id);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.get(), 1);
        assert_eq!(wheel.len().await, 0);
        wheel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_remaining_tasks_once() {
        let wheel = TimerWheel::start();
        let (count, _) = counter();
        for _ in 0..3 {
            let c = Arc::clone(&count);
            wheel
                .add_task(Duration::from_secs(3_600), Repeat::Forever, move || {
                    c.increment_and_get();
                })
                .unwrap();
        }
        assert_eq!(wheel.len().await, 3);

        wheel.stop().await;
        assert_eq!(count.get(), 3);
        assert_eq!(wheel.len().await, 0);
    }

    #[tokio::test]
    async fn add_after_stop_is_rejected() {
        let wheel = TimerWheel::start();
        wheel.stop().await;
        let err = wheel
            .add_task(Duration::from_secs(1), Repeat::Forever, || {})
            .unwrap_err();
        assert_eq!(err, TimerError::Stopped);
        // Stopping twice is harmless.
        wheel.stop().await;
    }

    #[tokio::test]
    async fn zero_count_is_rejected() {
        let wheel = TimerWheel::start();
        let err = wheel
            .add_task(Duration::from_secs(1), Repeat::Times(0), || {})
            .unwrap_err();
        assert_eq!(err, TimerError::ZeroCount);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_kill_scheduler() {
        let wheel = TimerWheel::start();
        wheel
            .add_task(Duration::from_secs(1), Repeat::Times(1), || panic!("boom"))
            .unwrap();
        let (count, cb) = counter();
        wheel.add_task(Duration::from_secs(2), Repeat::Times(1), cb).unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn next_fire_keeps_cadence_when_on_time() {
        let base = Instant::now();
        let interval = Duration::from_secs(1);
        let next = next_fire_at(base, interval, base + Duration::from_millis(100), DEFAULT_TICK);
        assert_eq!(next, base + interval);
    }

    #[test]
    fn next_fire_snaps_to_now_after_drift() {
        let base = Instant::now();
        let now = base + Duration::from_secs(5);
        let next = next_fire_at(base, Duration::from_secs(1), now, DEFAULT_TICK);
        assert_eq!(next, now);
    }
}
