//! Server lifecycle state and stop signalling.
//!
//! The controller owns three things: the lifecycle state (lock-free via
//! `ArcSwap`), a `watch` channel the accept loop and background relays
//! select on, and a counter of in-flight handler invocations maintained by
//! RAII guards.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use framewire_core::AtomicUint64;
use tokio::sync::watch;

/// Server lifecycle.
///
/// State machine: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed or bound, not yet accepting.
    Starting,
    /// Accept loop is running.
    Running,
    /// `stop()` has begun: no new sessions, existing ones are being closed.
    Draining,
    /// Every session closed and every in-flight handler finished.
    Stopped,
}

#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    in_flight: Arc<AtomicUint64>,
    state: ArcSwap<ServerState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            in_flight: Arc::new(AtomicUint64::new(0)),
            state: ArcSwap::from_pointee(ServerState::Starting),
        }
    }

    /// Moves `Starting` to `Running`; any later state is left alone.
    pub fn set_running(&self) {
        self.state.rcu(|state| match **state {
            ServerState::Starting => Arc::new(ServerState::Running),
            _ => Arc::clone(state),
        });
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        **self.state.load()
    }

    /// Receiver that flips to `true` once shutdown is triggered.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and wakes every subscriber.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(ServerState::Draining));
        self.signal.send_replace(true);
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    /// Tracks one handler invocation until the guard drops, unwinding included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.increment_and_get();
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.get()
    }

    /// Waits up to `timeout` for in-flight handlers to finish.
    ///
    /// Returns `true` and moves to `Stopped` on success; on timeout the
    /// state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.get() == 0 {
                self.state.store(Arc::new(ServerState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once `rx` observes `true` or its sender is gone.
pub async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicUint64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.decrement_and_get();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let controller = ShutdownController::new();
        assert_eq!(controller.state(), ServerState::Starting);
        controller.set_running();
        assert_eq!(controller.state(), ServerState::Running);
        assert!(!controller.is_shutting_down());
        controller.trigger_shutdown();
        assert_eq!(controller.state(), ServerState::Draining);
        assert!(controller.is_shutting_down());
    }

    #[test]
    fn late_set_running_does_not_undo_shutdown() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        controller.set_running();
        assert_eq!(controller.state(), ServerState::Draining);
    }

    #[test]
    fn guards_track_in_flight_work() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        drop(a);
        assert_eq!(controller.in_flight_count(), 1);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn guard_released_on_panic() {
        let controller = ShutdownController::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = controller.in_flight_guard();
            panic!("handler failure");
        }));
        assert!(result.is_err());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_late_trigger() {
        let controller = ShutdownController::new();
        let mut rx = controller.subscribe();
        let waiter = tokio::spawn(async move { shutdown_signalled(&mut rx).await });
        controller.trigger_shutdown();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_earlier_trigger() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        let mut rx = controller.subscribe();
        shutdown_signalled(&mut rx).await;
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.state(), ServerState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_while_work_remains() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.state(), ServerState::Draining);
    }
}
