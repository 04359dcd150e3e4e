//! Activity-adaptive reload scheduling.
//!
//! Each managed cache gets one [`Scheduler`] that ticks once per period. While
//! requests keep arriving it reloads on every tick. Once traffic stops it keeps
//! reloading through a grace window and then pauses until either a request
//! signals activity again or a request path notices the cache went stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::RefreshError;

/// A cache that can be reloaded from the backing store.
#[async_trait]
pub trait Reload: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Fetch fresh data and publish it. On error the previous generation must stay served.
    async fn reload(&self) -> Result<(), RefreshError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between ticks, also the staleness bound.
    pub period: Duration,
    /// How long reloads continue after traffic stops.
    pub grace: Duration,
}

/// What a single tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickPhase {
    /// Activity was seen during the last period.
    Active,
    /// First quiet tick, starts the quiet streak.
    QuietGrace,
    /// Still quiet, inside the grace window.
    QuietSustained,
    /// Quiet for at least the grace window, no reload.
    Paused,
}

impl TickPhase {
    pub fn reloads(self) -> bool {
        !matches!(self, TickPhase::Paused)
    }
}

#[derive(Debug, Default)]
struct TickState {
    quiet_since: Option<Instant>,
    last_attempt: Option<Instant>,
    last_phase: Option<TickPhase>,
}

pub struct Scheduler<R> {
    target: Arc<R>,
    config: SchedulerConfig,
    activity: AtomicBool,
    state: Mutex<TickState>,
    // Serializes reloads of this cache; readers of the cache never take it
    reload_lock: tokio::sync::Mutex<()>,
}

impl<R: Reload> Scheduler<R> {
    pub fn new(target: Arc<R>, config: SchedulerConfig) -> Self {
        Self {
            target,
            config,
            activity: AtomicBool::new(false),
            state: Mutex::new(TickState::default()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn target(&self) -> &Arc<R> {
        &self.target
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Record that a request was served.
    pub fn notify_activity(&self) {
        self.activity.store(true, Ordering::Release);
    }

    /// Run one tick of the state machine, reloading unless paused.
    pub async fn tick(&self, now: Instant) -> TickPhase {
        let phase = self.advance(now);
        if phase.reloads() {
            let _guard = self.reload_lock.lock().await;
            self.reload_locked(now).await;
        }
        phase
    }

    /// Reload synchronously if the last reload attempt is older than one period.
    ///
    /// Also clears the quiet streak so a paused scheduler resumes ticking.
    /// Returns whether a reload ran.
    pub async fn check_and_refresh_if_stale(&self, now: Instant) -> bool {
        if !self.is_stale(now) {
            return false;
        }

        self.activity.store(true, Ordering::Release);
        let _guard = self.reload_lock.lock().await;

        // Another request may have refreshed while we waited for the lock
        if !self.is_stale(now) {
            return false;
        }

        self.lock_state().quiet_since = None;
        debug!(cache = self.target.name(), "cache stale, forcing reload");
        self.reload_locked(now).await;
        true
    }

    /// Reload now regardless of the state machine.
    pub async fn force_reload(&self, now: Instant) {
        let _guard = self.reload_lock.lock().await;
        self.reload_locked(now).await;
    }

    /// Spawn the periodic tick loop. It stops when `cancellation_token` is cancelled.
    pub fn spawn(self: &Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(cancellation_token).await })
    }

    #[tracing::instrument(skip_all, fields(cache = self.target.name()))]
    async fn run(&self, cancellation_token: CancellationToken) {
        let period = self.config.period;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while let Some(now) = cancellation_token
            .run_until_cancelled(interval.tick())
            .await
        {
            self.tick(now).await;
        }

        debug!("scheduler stopped");
    }

    fn advance(&self, now: Instant) -> TickPhase {
        let active = self.activity.swap(false, Ordering::AcqRel);
        let mut state = self.lock_state();

        let phase = if active {
            state.quiet_since = None;
            TickPhase::Active
        } else {
            match state.quiet_since {
                None => {
                    // The quiet streak began somewhere in the period that just ended
                    state.quiet_since = Some(now.checked_sub(self.config.period).unwrap_or(now));
                    TickPhase::QuietGrace
                }
                Some(since) if now.saturating_duration_since(since) < self.config.grace => {
                    TickPhase::QuietSustained
                }
                Some(_) => TickPhase::Paused,
            }
        };

        if state.last_phase != Some(phase) {
            debug!(
                cache = self.target.name(),
                from = ?state.last_phase,
                to = ?phase,
                "scheduler phase changed"
            );
            state.last_phase = Some(phase);
        } else {
            trace!(cache = self.target.name(), ?phase, "scheduler tick");
        }

        phase
    }

    fn is_stale(&self, now: Instant) -> bool {
        match self.lock_state().last_attempt {
            Some(at) => now.saturating_duration_since(at) > self.config.period,
            None => true,
        }
    }

    /// Caller must hold `reload_lock`.
    async fn reload_locked(&self, now: Instant) {
        let started = Instant::now();
        match self.target.reload().await {
            Ok(()) => debug!(
                cache = self.target.name(),
                elapsed = ?started.elapsed(),
                "cache reloaded"
            ),
            Err(error) => warn!(%error, "cache refresh failed, keeping previous generation"),
        }

        // Failed attempts count too, otherwise every request would retry while the store is down
        self.lock_state().last_attempt = Some(now);
    }

    fn lock_state(&self) -> MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    pub(crate) struct CountingReload {
        pub(crate) reloads: AtomicUsize,
        pub(crate) failing: AtomicBool,
    }

    impl CountingReload {
        pub(crate) fn count(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reload for CountingReload {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reload(&self) -> Result<(), RefreshError> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(RefreshError::new(
                    "counting",
                    quotaward_db::DbError::Connection(tokio_rusqlite::Error::ConnectionClosed),
                ));
            }
            Ok(())
        }
    }

    fn scheduler(period: u64, grace: u64) -> Scheduler<CountingReload> {
        Scheduler::new(
            Arc::new(CountingReload::default()),
            SchedulerConfig {
                period: Duration::from_secs(period),
                grace: Duration::from_secs(grace),
            },
        )
    }

    fn at(start: Instant, secs: u64) -> Instant {
        start + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_quiet_ticks_pause_after_grace_window() {
        let scheduler = scheduler(60, 900);
        let start = Instant::now();

        let mut phases = Vec::new();
        for tick in 1..=17u64 {
            phases.push(scheduler.tick(at(start, tick * 60)).await);
        }

        assert_eq!(phases[0], TickPhase::QuietGrace);
        assert!(phases[1..14].iter().all(|p| *p == TickPhase::QuietSustained));
        assert_eq!(phases[14], TickPhase::Paused);
        assert_eq!(phases[16], TickPhase::Paused);
        assert_eq!(scheduler.target().count(), 14);
    }

    #[tokio::test]
    async fn test_default_periods_pause_on_seventeenth_quiet_tick() {
        let scheduler = scheduler(55, 900);
        let start = Instant::now();

        for tick in 1..=16u64 {
            assert!(scheduler.tick(at(start, tick * 55)).await.reloads());
        }
        assert_eq!(scheduler.tick(at(start, 17 * 55)).await, TickPhase::Paused);
        assert_eq!(scheduler.target().count(), 16);
    }

    #[tokio::test]
    async fn test_activity_resumes_and_resets_streak() {
        let scheduler = scheduler(60, 120);
        let start = Instant::now();

        assert_eq!(scheduler.tick(at(start, 60)).await, TickPhase::QuietGrace);
        assert_eq!(scheduler.tick(at(start, 120)).await, TickPhase::Paused);
        assert_eq!(scheduler.tick(at(start, 180)).await, TickPhase::Paused);
        assert_eq!(scheduler.target().count(), 1);

        scheduler.notify_activity();
        assert_eq!(scheduler.tick(at(start, 240)).await, TickPhase::Active);
        assert_eq!(scheduler.target().count(), 2);

        // The streak starts over
        assert_eq!(scheduler.tick(at(start, 300)).await, TickPhase::QuietGrace);
        assert_eq!(scheduler.target().count(), 3);
    }

    #[tokio::test]
    async fn test_activity_keeps_scheduler_active() {
        let scheduler = scheduler(60, 60);
        let start = Instant::now();

        for tick in 1..=5u64 {
            scheduler.notify_activity();
            assert_eq!(scheduler.tick(at(start, tick * 60)).await, TickPhase::Active);
        }
        assert_eq!(scheduler.target().count(), 5);
    }

    #[tokio::test]
    async fn test_stale_check_forces_reload_when_paused() {
        let scheduler = scheduler(60, 60);
        let start = Instant::now();

        scheduler.force_reload(start).await;
        assert_eq!(scheduler.target().count(), 1);

        // Fresh enough, nothing to do
        assert!(!scheduler.check_and_refresh_if_stale(at(start, 30)).await);

        assert_eq!(scheduler.tick(at(start, 60)).await, TickPhase::QuietGrace);
        assert_eq!(scheduler.tick(at(start, 120)).await, TickPhase::Paused);
        assert_eq!(scheduler.target().count(), 2);

        assert!(scheduler.check_and_refresh_if_stale(at(start, 200)).await);
        assert_eq!(scheduler.target().count(), 3);

        // The forced reload counts as activity for the next tick
        assert_eq!(scheduler.tick(at(start, 240)).await, TickPhase::Active);
    }

    #[tokio::test]
    async fn test_failed_reload_still_counts_as_attempt() {
        let scheduler = scheduler(60, 60);
        let start = Instant::now();
        scheduler.target().failing.store(true, Ordering::SeqCst);

        assert!(scheduler.check_and_refresh_if_stale(start).await);
        assert!(!scheduler.check_and_refresh_if_stale(at(start, 10)).await);
        assert_eq!(scheduler.target().count(), 1);

        assert!(scheduler.check_and_refresh_if_stale(at(start, 61)).await);
        assert_eq!(scheduler.target().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_ticks_and_stops() {
        let scheduler = Arc::new(scheduler(60, 200));
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone());

        // Quiet ticks at 60, 120, 180 reload; 240 is past the grace window
        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(scheduler.target().count(), 3);

        scheduler.notify_activity();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scheduler.target().count(), 4);

        cancel.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(scheduler.target().count(), 4);
    }
}
