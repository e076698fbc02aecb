//! Auto-reconnect scheduler.
//!
//! A single cancellable background loop that keeps re-dialling the best known
//! endpoint until a session authenticates, the retry window runs out, or
//! someone cancels it.
//!
//! # Timeline (default policy)
//!
//! ```text
//! t=0      loop starts (window opens)
//! t=10s    attempt 1      ┐
//! t=20s    attempt 2      │ 10 s apart
//!   ...                   │
//! t=60s    attempt 6      ┘
//! t=120s   attempt 7      ┐ 60 s apart
//!   ...                   │
//! t=540s   attempt 14     ┘
//! t=600s   window exhausted, loop stops
//! ```
//!
//! Every wait is sliced into `poll_tick` steps so an authenticated session or
//! an exhausted window is noticed within one tick, not after a whole backoff.
//! Cancellation aborts the task outright.
//!
//! Each attempt runs in its own task and the next slot is timed from the
//! moment the attempt started, so a dial that takes seconds to fail does not
//! stretch the spacing.  A slot that comes up while the previous attempt is
//! still dialling calls the driver anyway; the driver's own single-attempt
//! guard makes that a no-op.
//!
//! # Driver
//!
//! The scheduler does not know how to connect.  It drives a
//! [`ReconnectDriver`] held by `Weak` reference (the connection manager owns
//! the scheduler, so a strong reference would be a cycle).  If the driver is
//! dropped the loop ends as cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use pairlink_core::{EndpointRecord, ReconnectPolicy};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use super::events::{ConnectionEvent, EventBus, StopReason};

/// What the loop needs from the connection manager.
#[async_trait]
pub trait ReconnectDriver: Send + Sync {
    /// `true` once a session is authenticated.
    fn is_connected(&self) -> bool;
    /// Best endpoint to dial right now, if any.
    fn reconnect_target(&self) -> Option<EndpointRecord>;
    /// Runs one automatic connection attempt against `target`.
    async fn attempt(&self, target: EndpointRecord);
    /// Called once when the loop observes an authenticated session.
    fn reconnected(&self, target: &EndpointRecord);
}

/// Observable loop state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub active: bool,
    /// Attempts made by the current (or most recent) loop.
    pub attempt_count: u32,
    /// When the current (or most recent) loop started.
    pub window_started: Option<Instant>,
}

struct Shared {
    policy: ReconnectPolicy,
    state: Mutex<ReconnectState>,
    /// Incremented on every start and cancel; a loop only touches state while
    /// its own run id is current.
    run_id: AtomicU64,
    events: Arc<EventBus>,
    /// The most recently launched attempt.
    attempt: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReconnectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, run: u64) -> bool {
        self.run_id.load(Ordering::Acquire) == run
    }

    fn record_attempt(&self, run: u64, attempt: u32) {
        let mut state = self.lock_state();
        if self.is_current(run) {
            state.attempt_count = attempt;
        }
    }

    /// Runs one attempt off the loop's clock.
    fn launch_attempt(
        self: &Arc<Self>,
        run: u64,
        driver: Arc<dyn ReconnectDriver>,
        target: EndpointRecord,
    ) {
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            if shared.is_current(run) {
                driver.attempt(target).await;
            }
        });
        // An earlier attempt still dialling is left to finish on its own.
        drop(
            self.attempt
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(task),
        );
    }

    fn abort_attempt(&self) {
        if let Some(task) = self
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn finish(&self, run: u64, reason: StopReason) {
        {
            let mut state = self.lock_state();
            if !self.is_current(run) {
                return;
            }
            state.active = false;
        }
        info!(?reason, "auto-reconnect loop stopped");
        self.events
            .publish(ConnectionEvent::AutoReconnectStopped { reason });
    }
}

/// Owner of the (at most one) reconnect loop.
pub struct ReconnectScheduler {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy, events: Arc<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                policy,
                state: Mutex::new(ReconnectState::default()),
                run_id: AtomicU64::new(0),
                events,
                attempt: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.shared.policy
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock_state().active
    }

    pub fn state(&self) -> ReconnectState {
        *self.shared.lock_state()
    }

    /// Starts the loop unless one is already running.
    ///
    /// Returns `true` if a new loop was started.  Must be called from within
    /// a Tokio runtime.
    pub fn start(&self, driver: Weak<dyn ReconnectDriver>) -> bool {
        let mut state = self.shared.lock_state();
        if state.active {
            return false;
        }
        let run = self.shared.run_id.fetch_add(1, Ordering::AcqRel) + 1;
        *state = ReconnectState {
            active: true,
            attempt_count: 0,
            window_started: Some(Instant::now()),
        };

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run_loop(shared, run, driver));
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        drop(state);

        if let Some(previous) = previous {
            previous.abort();
        }
        info!(run, "auto-reconnect loop started");
        self.shared.events.publish(ConnectionEvent::AutoReconnectStarted);
        true
    }

    /// Stops the loop and resets the attempt count and window.
    ///
    /// Safe to call at any time; does nothing if no loop is running.
    pub fn cancel(&self) {
        let (was_active, task) = {
            let mut state = self.shared.lock_state();
            let was_active = state.active;
            *state = ReconnectState::default();
            self.shared.run_id.fetch_add(1, Ordering::AcqRel);
            let task = self
                .task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            (was_active, task)
        };
        if let Some(task) = task {
            task.abort();
        }
        self.shared.abort_attempt();
        if was_active {
            info!("auto-reconnect loop cancelled");
            self.shared.events.publish(ConnectionEvent::AutoReconnectStopped {
                reason: StopReason::Cancelled,
            });
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shared.abort_attempt();
    }
}

/// Waits until `deadline` in `poll_tick` slices.
///
/// Returns early with a stop reason if the driver reports a session or the
/// window runs out.
async fn wait_until(
    shared: &Shared,
    driver: &Weak<dyn ReconnectDriver>,
    started: Instant,
    deadline: Instant,
) -> Option<StopReason> {
    loop {
        match driver.upgrade() {
            None => return Some(StopReason::Cancelled),
            Some(driver) if driver.is_connected() => return Some(StopReason::Reconnected),
            Some(_) => {}
        }
        if shared.policy.window_exhausted(started.elapsed()) {
            return Some(StopReason::WindowExhausted);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        time::sleep(shared.policy.poll_tick.min(deadline - now)).await;
    }
}

async fn run_loop(shared: Arc<Shared>, run: u64, driver: Weak<dyn ReconnectDriver>) {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    let mut last_target: Option<EndpointRecord> = None;

    let mut due = started + shared.policy.delay_before(1);

    let reason = loop {
        if let Some(reason) = wait_until(&shared, &driver, started, due).await {
            break reason;
        }

        let Some(strong) = driver.upgrade() else {
            break StopReason::Cancelled;
        };
        let Some(target) = strong.reconnect_target() else {
            warn!("no endpoint to reconnect to");
            break StopReason::NoTarget;
        };

        attempt += 1;
        shared.record_attempt(run, attempt);
        debug!(
            attempt,
            peer = %target.peer,
            address = %target.address,
            elapsed = ?started.elapsed(),
            "auto-reconnect attempt"
        );
        due = Instant::now() + shared.policy.delay_before(attempt + 1);
        last_target = Some(target.clone());
        shared.launch_attempt(run, strong, target);
    };

    if reason == StopReason::Reconnected {
        if let (Some(driver), Some(target)) = (driver.upgrade(), last_target.as_ref()) {
            driver.reconnected(target);
        }
    }
    shared.finish(run, reason);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use pairlink_core::PeerIdentity;

    use super::*;

    /// Records every attempt with its offset from the test start.
    struct RecordingDriver {
        start: Instant,
        connected: AtomicBool,
        /// Attempt number (1-based) on which the driver reports success.
        succeed_on: Option<usize>,
        attempts: Mutex<Vec<Duration>>,
        reconnected: Mutex<Vec<PeerIdentity>>,
        target: Option<EndpointRecord>,
        /// How long each attempt takes to fail.
        dial_time: Option<Duration>,
    }

    impl RecordingDriver {
        fn new(succeed_on: Option<usize>) -> Arc<Self> {
            Self::with_target(
                succeed_on,
                Some(EndpointRecord::new(
                    PeerIdentity::new("studio"),
                    "192.168.1.10",
                    6996,
                    None,
                )),
            )
        }

        fn with_target(succeed_on: Option<usize>, target: Option<EndpointRecord>) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                connected: AtomicBool::new(false),
                succeed_on,
                attempts: Mutex::new(Vec::new()),
                reconnected: Mutex::new(Vec::new()),
                target,
                dial_time: None,
            })
        }

        fn slow(dial_time: Duration) -> Arc<Self> {
            let mut driver = Self::new(None);
            if let Some(inner) = Arc::get_mut(&mut driver) {
                inner.dial_time = Some(dial_time);
            }
            driver
        }

        fn attempt_offsets(&self) -> Vec<u64> {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.as_secs())
                .collect()
        }
    }

    #[async_trait]
    impl ReconnectDriver for RecordingDriver {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn reconnect_target(&self) -> Option<EndpointRecord> {
            self.target.clone()
        }

        async fn attempt(&self, _target: EndpointRecord) {
            {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(self.start.elapsed());
                if self.succeed_on == Some(attempts.len()) {
                    self.connected.store(true, Ordering::SeqCst);
                }
            }
            if let Some(dial_time) = self.dial_time {
                time::sleep(dial_time).await;
            }
        }

        fn reconnected(&self, target: &EndpointRecord) {
            self.reconnected.lock().unwrap().push(target.peer.clone());
        }
    }

    fn scheduler() -> (ReconnectScheduler, Arc<EventBus>) {
        let events = Arc::new(EventBus::default());
        (
            ReconnectScheduler::new(ReconnectPolicy::default(), Arc::clone(&events)),
            events,
        )
    }

    fn weak(driver: &Arc<RecordingDriver>) -> Weak<dyn ReconnectDriver> {
        let strong: Arc<dyn ReconnectDriver> = Arc::clone(driver) as Arc<dyn ReconnectDriver>;
        Arc::downgrade(&strong)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_and_window() {
        // Arrange
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::new(None);

        // Act
        assert!(scheduler.start(weak(&driver)));
        time::sleep(Duration::from_secs(601)).await;

        // Assert
        assert_eq!(
            driver.attempt_offsets(),
            vec![10, 20, 30, 40, 50, 60, 120, 180, 240, 300, 360, 420, 480, 540]
        );
        assert!(!scheduler.is_active(), "loop must stop at the window");
        assert_eq!(scheduler.state().attempt_count, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_do_not_stretch_the_schedule() {
        // Arrange: every attempt takes 8 s to fail
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::slow(Duration::from_secs(8));

        // Act
        assert!(scheduler.start(weak(&driver)));
        time::sleep(Duration::from_secs(601)).await;

        // Assert
        assert_eq!(
            driver.attempt_offsets(),
            vec![10, 20, 30, 40, 50, 60, 120, 180, 240, 300, 360, 420, 480, 540]
        );
        assert!(!scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_checked_while_an_attempt_is_dialling() {
        // Arrange: the attempt at 540 s is still dialling when the window closes
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::slow(Duration::from_secs(90));

        // Act
        scheduler.start(weak(&driver));
        time::sleep(Duration::from_millis(600_500)).await;

        // Assert
        assert!(!scheduler.is_active());
        assert_eq!(scheduler.state().attempt_count, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_rejected_while_active() {
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::new(None);

        assert!(scheduler.start(weak(&driver)));
        assert!(!scheduler.start(weak(&driver)));
        time::sleep(Duration::from_secs(25)).await;

        assert_eq!(driver.attempt_offsets(), vec![10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_wait_stops_loop_and_resets_state() {
        // Arrange
        let (scheduler, events) = scheduler();
        let mut rx = events.subscribe();
        let driver = RecordingDriver::new(None);
        scheduler.start(weak(&driver));
        time::sleep(Duration::from_secs(15)).await;

        // Act
        scheduler.cancel();
        time::sleep(Duration::from_secs(120)).await;

        // Assert
        assert_eq!(driver.attempt_offsets(), vec![10]);
        assert_eq!(scheduler.state(), ReconnectState::default());
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::AutoReconnectStarted);
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::AutoReconnectStopped {
                reason: StopReason::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_without_loop_is_noop() {
        let (scheduler, events) = scheduler();
        let mut rx = events.subscribe();

        scheduler.cancel();
        scheduler.cancel();

        assert!(!scheduler.is_active());
        assert!(rx.try_recv().is_err(), "no event for an idle cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_terminal_and_reported_once() {
        // Arrange
        let (scheduler, events) = scheduler();
        let mut rx = events.subscribe();
        let driver = RecordingDriver::new(Some(3));

        // Act
        scheduler.start(weak(&driver));
        time::sleep(Duration::from_secs(120)).await;

        // Assert
        assert_eq!(driver.attempt_offsets(), vec![10, 20, 30]);
        assert!(!scheduler.is_active());
        assert_eq!(driver.reconnected.lock().unwrap().len(), 1);
        let _started = rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::AutoReconnectStopped {
                reason: StopReason::Reconnected
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_observed_within_one_poll_tick() {
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::new(None);
        scheduler.start(weak(&driver));

        time::sleep(Duration::from_secs(12)).await;
        driver.connected.store(true, Ordering::SeqCst);
        time::sleep(Duration::from_millis(600)).await;

        assert!(!scheduler.is_active());
        assert_eq!(driver.attempt_offsets(), vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_stops_loop() {
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::with_target(None, None);

        scheduler.start(weak(&driver));
        time::sleep(Duration::from_secs(11)).await;

        assert!(!scheduler.is_active());
        assert!(driver.attempt_offsets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_driver_ends_loop_as_cancelled() {
        let (scheduler, events) = scheduler();
        let mut rx = events.subscribe();
        let driver = RecordingDriver::new(None);
        scheduler.start(weak(&driver));

        drop(driver);
        time::sleep(Duration::from_secs(1)).await;

        assert!(!scheduler.is_active());
        let _started = rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::AutoReconnectStopped {
                reason: StopReason::Cancelled
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_cancel_begins_new_window() {
        let (scheduler, _events) = scheduler();
        let driver = RecordingDriver::new(None);

        scheduler.start(weak(&driver));
        time::sleep(Duration::from_secs(5)).await;
        scheduler.cancel();
        assert!(scheduler.start(weak(&driver)));
        time::sleep(Duration::from_secs(11)).await;

        assert_eq!(driver.attempt_offsets(), vec![15]);
        assert_eq!(scheduler.state().attempt_count, 1);
    }
}
