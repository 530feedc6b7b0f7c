//! # Staggered Polling Scheduler
//!
//! Dozens of dashboard views refresh "every 30 seconds". Left alone, they all
//! fire in the same tick and the backend sees a burst of identical requests.
//! The scheduler gives every component a random offset of up to 30% of its
//! nominal interval, computed once at registration, so the effective periods
//! drift apart and the bursts never line up.
//!
//! Callbacks are fire-and-forget: the scheduler never awaits them and does not
//! prevent overlapping runs. A callback that must not overlap itself should
//! submit its work through the [`RequestQueue`](super::RequestQueue) or guard
//! itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound of the random offset, as a fraction of the nominal interval.
pub const JITTER_RATIO: f64 = 0.3;

/// The cadence assigned to a component. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRegistration {
    /// Unique key of the polling component.
    pub component_name: String,
    /// The interval the component asked for.
    pub base_interval: Duration,
    /// Random offset in `[0, JITTER_RATIO * base_interval)`.
    pub jitter_offset: Duration,
}

impl PollRegistration {
    /// `base_interval + jitter_offset`, the period the timer actually uses.
    pub fn effective_interval(&self) -> Duration {
        self.base_interval + self.jitter_offset
    }
}

/// Read-only view of one registration, as returned by [`StaggeredPoller::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStatus {
    /// Unique key of the polling component.
    pub component_name: String,
    /// The interval the component asked for.
    pub nominal_interval: Duration,
    /// The jittered period in use.
    pub effective_interval: Duration,
    /// Whether a timer is currently active for the component.
    pub running: bool,
}

#[derive(Default)]
struct PollerState {
    registrations: HashMap<String, PollRegistration>,
    active: HashMap<String, CancellationToken>,
}

/// # Staggered Poller
///
/// Registry of polling cadences keyed by component name, with at most one
/// active timer per name. Construct one per application and share it.
#[derive(Default)]
pub struct StaggeredPoller {
    state: Mutex<PollerState>,
}

impl std::fmt::Debug for StaggeredPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaggeredPoller").field("status", &self.status()).finish()
    }
}

impl StaggeredPoller {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, PollerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers (or re-registers) a component and draws its jitter offset.
    ///
    /// A previous registration under the same name is replaced outright. An
    /// already running timer keeps its old period until the next `start`.
    pub fn register(&self, component_name: &str, base_interval: Duration) -> PollRegistration {
        let factor: f64 = rand::rng().random::<f64>() * JITTER_RATIO;
        let registration = PollRegistration {
            component_name: component_name.to_string(),
            base_interval,
            jitter_offset: base_interval.mul_f64(factor),
        };

        tracing::debug!(
            component = component_name,
            base_ms = base_interval.as_millis() as u64,
            jitter_ms = registration.jitter_offset.as_millis() as u64,
            "Registered staggered poll"
        );

        self.lock_state()
            .registrations
            .insert(component_name.to_string(), registration.clone());
        registration
    }

    /// Removes a registration, stopping its timer first.
    pub fn unregister(&self, component_name: &str) -> Option<PollRegistration> {
        let mut state = self.lock_state();
        if let Some(token) = state.active.remove(component_name) {
            token.cancel();
        }
        state.registrations.remove(component_name)
    }

    /// Starts polling a registered component.
    ///
    /// The callback runs once right away, on the caller's thread, and then
    /// every effective interval on a tokio task. Starting an unregistered
    /// component logs a warning and does nothing. Starting a running
    /// component replaces its timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&self, component_name: &str, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (period, token) = {
            let mut state = self.lock_state();
            let Some(registration) = state.registrations.get(component_name) else {
                tracing::warn!(
                    component = component_name,
                    "Polling start requested for unregistered component; ignoring"
                );
                return;
            };
            // tokio intervals reject a zero period.
            let period = registration.effective_interval().max(Duration::from_millis(1));

            if let Some(previous) = state.active.remove(component_name) {
                tracing::debug!(component = component_name, "Replacing active poll timer");
                previous.cancel();
            }
            let token = CancellationToken::new();
            state.active.insert(component_name.to_string(), token.clone());
            (period, token)
        };

        let first_tick = Instant::now() + period;
        callback();

        let name = component_name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }
            tracing::trace!(component = %name, "Poll timer stopped");
        });

        tracing::info!(
            component = component_name,
            period_ms = period.as_millis() as u64,
            "Started staggered polling"
        );
    }

    /// Like [`start`](Self::start), for callbacks that produce a future. Each
    /// tick spawns the future and moves on without awaiting it.
    pub fn start_async<F, Fut>(&self, component_name: &str, make_future: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start(component_name, move || {
            tokio::spawn(make_future());
        });
    }

    /// Cancels the component's timer. Returns whether one was running.
    ///
    /// A callback already in progress is not interrupted.
    pub fn stop(&self, component_name: &str) -> bool {
        match self.lock_state().active.remove(component_name) {
            Some(token) => {
                token.cancel();
                tracing::info!(component = component_name, "Stopped staggered polling");
                true
            }
            None => false,
        }
    }

    /// Cancels every active timer.
    pub fn stop_all(&self) {
        let stopped: Vec<(String, CancellationToken)> = self.lock_state().active.drain().collect();
        for (_, token) in &stopped {
            token.cancel();
        }
        if !stopped.is_empty() {
            tracing::info!(count = stopped.len(), "Stopped all staggered polling");
        }
    }

    /// Whether a timer is active for the component.
    pub fn is_running(&self, component_name: &str) -> bool {
        self.lock_state().active.contains_key(component_name)
    }

    /// Every registration with its nominal and effective interval, sorted by name.
    pub fn status(&self) -> Vec<PollStatus> {
        let state = self.lock_state();
        let mut status: Vec<PollStatus> = state
            .registrations
            .values()
            .map(|registration| PollStatus {
                component_name: registration.component_name.clone(),
                nominal_interval: registration.base_interval,
                effective_interval: registration.effective_interval(),
                running: state.active.contains_key(&registration.component_name),
            })
            .collect();
        status.sort_by(|a, b| a.component_name.cmp(&b.component_name));
        status
    }
}

impl Drop for StaggeredPoller {
    fn drop(&mut self) {
        for (_, token) in self.lock_state().active.drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (count, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let poller = StaggeredPoller::new();
        for _ in 0..200 {
            let registration = poller.register("X", Duration::from_millis(1000));
            assert!(registration.jitter_offset < Duration::from_millis(300));
            let effective = registration.effective_interval();
            assert!(effective >= Duration::from_millis(1000));
            assert!(effective <= Duration::from_millis(1300));
        }
    }

    #[test]
    fn identical_intervals_are_staggered() {
        let poller = StaggeredPoller::new();
        let a = poller.register("A", Duration::from_millis(1000));
        let b = poller.register("B", Duration::from_millis(1000));
        assert_ne!(a.jitter_offset, b.jitter_offset);
    }

    #[test]
    fn re_registering_replaces_the_cadence() {
        let poller = StaggeredPoller::new();
        poller.register("trades", Duration::from_secs(30));
        poller.register("trades", Duration::from_secs(5));

        let status = poller.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].nominal_interval, Duration::from_secs(5));
        assert!(status[0].effective_interval < Duration::from_millis(6500));
    }

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_then_every_effective_interval() {
        let poller = StaggeredPoller::new();
        let period = poller.register("X", Duration::from_millis(1000)).effective_interval();
        let (count, callback) = counter();

        poller.start("X", callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(period - Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        tokio::time::sleep(period).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_keeps_a_single_timer() {
        let poller = StaggeredPoller::new();
        let period = poller.register("positions", Duration::from_millis(500)).effective_interval();
        let (count, callback) = counter();
        let callback = Arc::new(callback);

        let first = Arc::clone(&callback);
        poller.start("positions", move || first());
        let second = Arc::clone(&callback);
        poller.start("positions", move || second());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        tokio::time::sleep(period + Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        tokio::time::sleep(period).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_unregistered_component_is_a_no_op() {
        let poller = StaggeredPoller::new();
        let (count, callback) = counter();

        poller.start("ghost", callback);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!poller.is_running("ghost"));
        assert!(poller.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_future_ticks_and_is_idempotent() {
        let poller = StaggeredPoller::new();
        let period = poller.register("stats", Duration::from_millis(200)).effective_interval();
        let (count, callback) = counter();

        poller.start("stats", callback);
        tokio::time::sleep(period + Duration::from_millis(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(poller.stop("stats"));
        assert!(!poller.stop("stats"));
        tokio::time::sleep(period * 5).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!poller.status()[0].running);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_cancels_every_timer() {
        let poller = StaggeredPoller::new();
        poller.register("a", Duration::from_millis(100));
        poller.register("b", Duration::from_millis(100));
        let (count, callback) = counter();
        let callback = Arc::new(callback);

        let a = Arc::clone(&callback);
        poller.start("a", move || a());
        let b = Arc::clone(&callback);
        poller.start("b", move || b());
        assert!(poller.status().iter().all(|s| s.running));

        poller.stop_all();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(poller.status().iter().all(|s| !s.running));
    }

    #[tokio::test(start_paused = true)]
    async fn async_callbacks_are_not_awaited() {
        let poller = StaggeredPoller::new();
        let period = poller.register("slow", Duration::from_millis(100)).effective_interval();
        let started = Arc::new(AtomicUsize::new(0));

        let handle = Arc::clone(&started);
        poller.start_async("slow", move || {
            let handle = Arc::clone(&handle);
            async move {
                handle.fetch_add(1, Ordering::SeqCst);
                // Longer than the period: ticks keep coming regardless.
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        });

        tokio::time::sleep(period * 3 + Duration::from_millis(5)).await;
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn status_is_sorted_by_component_name() {
        let poller = StaggeredPoller::new();
        poller.register("trades", Duration::from_secs(30));
        poller.register("bot_status", Duration::from_secs(10));
        poller.register("positions", Duration::from_secs(5));

        let names: Vec<String> = poller.status().into_iter().map(|s| s.component_name).collect();
        assert_eq!(names, vec!["bot_status", "positions", "trades"]);
    }

    #[test]
    fn unregister_forgets_the_component() {
        let poller = StaggeredPoller::new();
        poller.register("stats", Duration::from_secs(30));
        assert!(poller.unregister("stats").is_some());
        assert!(poller.unregister("stats").is_none());
        assert!(poller.status().is_empty());
    }
}
