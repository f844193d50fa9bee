//! Reconnect scheduling for one managed connection.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chat_bridge_core::Fault;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::{BackoffPolicy, classify::classify};

const DEFAULT_MAX_RETRIES: u32 = 10;

/// Reconnect tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retries allowed since the last successful connection.
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Result of reporting a connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// A retry will run after `delay`; it is attempt number `attempt`.
    Scheduled { attempt: u32, delay: Duration },
    /// A retry is already in flight; nothing was scheduled.
    AlreadyReconnecting,
    /// The retry budget is spent. Terminal until `reset_attempt_count`.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    RetryScheduled,
    Exhausted,
}

#[derive(Default)]
struct ReconnectState {
    attempt_count: u32,
    is_reconnecting: bool,
    pending: Option<JoinHandle<()>>,
    /// Bumped whenever the pending timer is replaced or cancelled. A timer
    /// that wakes up with an old generation does nothing.
    generation: u64,
}

impl ReconnectState {
    fn cancel_pending(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.pending.take().is_some_and(|handle| {
            handle.abort();
            true
        })
    }
}

/// Decides whether, when and how often a dropped connection is retried.
///
/// One instance per managed connection. At most one retry is pending at
/// any time, and the pending retry can be cancelled until it fires.
pub struct ReconnectCoordinator {
    config: ReconnectConfig,
    state: Arc<Mutex<ReconnectState>>,
}

impl ReconnectCoordinator {
    /// Create a new coordinator.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ReconnectState::default())),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ReconnectState> {
        lock(&self.state)
    }

    /// Report a connection error and schedule `reconnect` if allowed.
    ///
    /// When the retry fires, the attempt counter is incremented and the
    /// in-flight flag cleared before `reconnect` runs. Must be called from
    /// within a tokio runtime.
    pub fn on_connection_error<F, Fut>(&self, fault: Option<&Fault>, reconnect: F) -> ReconnectOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let classification = classify(fault);
        let mut state = self.lock();

        tracing::info!(
            fault = %fault.map_or_else(|| "none".to_string(), ToString::to_string),
            %classification,
            attempt_count = state.attempt_count,
            is_reconnecting = state.is_reconnecting,
            "connection error"
        );

        if state.is_reconnecting {
            tracing::debug!("already attempting to reconnect");
            return ReconnectOutcome::AlreadyReconnecting;
        }

        let max_retries = self.config.max_retries;
        if state.attempt_count >= max_retries {
            tracing::error!(max_retries, "maximum reconnection attempts reached, not retrying");
            return ReconnectOutcome::Exhausted {
                attempts: state.attempt_count,
            };
        }

        state.is_reconnecting = true;
        state.cancel_pending();

        let delay = self.config.backoff.next_delay(state.attempt_count);
        let attempt = state.attempt_count + 1;
        let generation = state.generation;
        let shared = Arc::clone(&self.state);

        tracing::info!(
            attempt,
            max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&shared);
                if state.generation != generation {
                    return;
                }
                state.pending = None;
                state.attempt_count += 1;
                state.is_reconnecting = false;
            }
            tracing::debug!(attempt, "reconnect timer fired");
            reconnect().await;
        }));

        ReconnectOutcome::Scheduled { attempt, delay }
    }

    /// Reset after a successful connection: counter to zero, no retry
    /// pending.
    pub fn on_successful_connection(&self) {
        let mut state = self.lock();
        if state.attempt_count > 0 || state.pending.is_some() {
            tracing::info!(
                previous_attempts = state.attempt_count,
                "connection successful, resetting reconnection counter"
            );
        }
        state.attempt_count = 0;
        state.is_reconnecting = false;
        if state.cancel_pending() {
            tracing::debug!("cancelled pending reconnect");
        }
    }

    /// Reconnect attempts since the last success.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.lock().attempt_count
    }

    /// Zero the attempt counter, leaving any pending retry alone. This is
    /// the only way out of `Exhausted`.
    pub fn reset_attempt_count(&self) {
        self.lock().attempt_count = 0;
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        let state = self.lock();
        if state.pending.is_some() {
            CoordinatorState::RetryScheduled
        } else if state.attempt_count >= self.config.max_retries {
            CoordinatorState::Exhausted
        } else {
            CoordinatorState::Idle
        }
    }

    /// Cancel any pending retry.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.is_reconnecting = false;
        if state.cancel_pending() {
            tracing::debug!("cancelled pending reconnect on shutdown");
        }
    }
}

impl Drop for ReconnectCoordinator {
    fn drop(&mut self) {
        lock(&self.state).cancel_pending();
    }
}

fn lock(state: &Mutex<ReconnectState>) -> MutexGuard<'_, ReconnectState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::{Ready, ready};

    use super::*;

    fn config(max_retries: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_retries,
            backoff: BackoffPolicy::default(),
        }
    }

    fn counting(calls: &Arc<AtomicUsize>) -> impl FnOnce() -> Ready<()> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(())
        }
    }

    /// Longer than any jittered delay.
    async fn let_timers_fire() {
        tokio::time::sleep(Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedules_with_backoff_delay() {
        let coordinator = ReconnectCoordinator::new(config(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let outcome = coordinator.on_connection_error(None, counting(&calls));
        let ReconnectOutcome::Scheduled { attempt, delay } = outcome else {
            panic!("expected a scheduled retry, got {outcome:?}");
        };
        assert_eq!(attempt, 1);
        let (lo, hi) = coordinator.config().backoff.bounds(0);
        assert!(delay >= lo && delay <= hi);
        assert_eq!(coordinator.state(), CoordinatorState::RetryScheduled);
        assert_eq!(coordinator.attempt_count(), 0);

        let_timers_fire().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.attempt_count(), 1);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_errors_schedule_once() {
        let coordinator = ReconnectCoordinator::new(config(10));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = coordinator.on_connection_error(None, counting(&calls));
        let second = coordinator.on_connection_error(
            Some(&Fault::new().with_code("ECONNRESET")),
            counting(&calls),
        );
        assert!(matches!(first, ReconnectOutcome::Scheduled { .. }));
        assert_eq!(second, ReconnectOutcome::AlreadyReconnecting);

        let_timers_fire().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_max_retries() {
        let coordinator = ReconnectCoordinator::new(config(3));
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let outcome = coordinator.on_connection_error(None, counting(&calls));
            assert!(
                matches!(outcome, ReconnectOutcome::Scheduled { attempt, .. } if attempt == expected)
            );
            let_timers_fire().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let outcome = coordinator.on_connection_error(None, counting(&calls));
        assert_eq!(outcome, ReconnectOutcome::Exhausted { attempts: 3 });
        assert_eq!(coordinator.state(), CoordinatorState::Exhausted);

        let_timers_fire().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Still exhausted on the next error.
        let outcome = coordinator.on_connection_error(None, counting(&calls));
        assert_eq!(outcome, ReconnectOutcome::Exhausted { attempts: 3 });

        coordinator.reset_attempt_count();
        let outcome = coordinator.on_connection_error(None, counting(&calls));
        assert!(matches!(outcome, ReconnectOutcome::Scheduled { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_cancels_pending_retry() {
        let coordinator = ReconnectCoordinator::new(config(10));
        let calls = Arc::new(AtomicUsize::new(0));

        coordinator.on_connection_error(None, counting(&calls));
        coordinator.on_successful_connection();
        assert_eq!(coordinator.state(), CoordinatorState::Idle);

        let_timers_fire().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.attempt_count(), 0);

        // The in-flight flag was cleared, so a new error schedules again.
        let outcome = coordinator.on_connection_error(None, counting(&calls));
        assert!(matches!(outcome, ReconnectOutcome::Scheduled { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_accumulated_attempts() {
        let coordinator = ReconnectCoordinator::new(config(10));
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            coordinator.on_connection_error(None, counting(&calls));
            let_timers_fire().await;
        }
        assert_eq!(coordinator.attempt_count(), 4);

        coordinator.on_successful_connection();
        assert_eq!(coordinator.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_success_cycles_never_accumulate() {
        let coordinator = Arc::new(ReconnectCoordinator::new(config(10)));
        let calls = Arc::new(AtomicUsize::new(0));

        for cycle in 1..=3 {
            let fault = Fault::new().with_close_code(1006);
            let reconnect = {
                let coordinator = Arc::clone(&coordinator);
                let calls = Arc::clone(&calls);
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    coordinator.on_successful_connection();
                }
            };
            let outcome = coordinator.on_connection_error(Some(&fault), reconnect);
            assert!(matches!(outcome, ReconnectOutcome::Scheduled { attempt: 1, .. }));

            let_timers_fire().await;
            assert_eq!(calls.load(Ordering::SeqCst), cycle);
            assert_eq!(coordinator.attempt_count(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_and_drop_cancel() {
        let calls = Arc::new(AtomicUsize::new(0));

        let coordinator = ReconnectCoordinator::new(config(10));
        coordinator.on_connection_error(None, counting(&calls));
        coordinator.shutdown();

        let dropped = ReconnectCoordinator::new(config(10));
        dropped.on_connection_error(None, counting(&calls));
        drop(dropped);

        let_timers_fire().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_config_defaults() {
        let config: ReconnectConfig = serde_json::from_str(r#"{ "backoff": { "jitter_fraction": 0.0 } }"#).unwrap();
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.backoff.base_ms, 3_000);
        tokio_test::assert_ok!(serde_json::from_str::<ReconnectConfig>("{}"));
    }
}
