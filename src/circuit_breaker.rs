//! Circuit breaker guarding cross-node broadcast, implemented with lock-free atomics.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    opened_at_millis: AtomicU64,
}

/// Per-node-fleet circuit breaker over `MessagingService::broadcast`.
///
/// Transitions: `Closed` -> `Open` once `failure_count` reaches
/// `failure_threshold`; `Open` -> `HalfOpen` lazily, the first time
/// `allow_request()` is called after `open_timeout` has elapsed; `HalfOpen` ->
/// `Closed` on the next success (failure count resets to zero); `HalfOpen` ->
/// `Open` on the next failure (the open timer restarts).
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
    failure_threshold: usize,
    open_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_threshold", &self.failure_threshold)
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: usize, open_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                success_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
            }),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (used by tests to fake the passage of time).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// True if a call should be let through right now. Performs the lazy
    /// `Open` -> `HalfOpen` transition as a side effect when the timeout has
    /// elapsed.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.inner.opened_at_millis.load(Ordering::Acquire);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                if elapsed >= self.open_timeout.as_millis() as u64 {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::info!("circuit breaker: open -> half_open");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.inner.success_count.fetch_add(1, Ordering::Relaxed);
        if self
            .inner
            .state
            .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.failure_count.store(0, Ordering::Release);
            tracing::info!("circuit breaker: half_open -> closed");
        } else if self.state() == CircuitState::Closed {
            self.inner.failure_count.store(0, Ordering::Release);
        }
    }

    pub fn record_failure(&self) {
        let current = self.state();
        let failures = self.inner.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        match current {
            CircuitState::HalfOpen => {
                if self
                    .inner
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: half_open -> open");
                }
            }
            CircuitState::Closed => {
                if failures >= self.failure_threshold
                    && self
                        .inner
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.inner.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    tracing::error!(failures, threshold = self.failure_threshold, "circuit breaker: closed -> open");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        self.inner.state.store(STATE_CLOSED, Ordering::Release);
        self.inner.failure_count.store(0, Ordering::Release);
        self.inner.opened_at_millis.store(0, Ordering::Release);
        tracing::info!("circuit breaker: reset -> closed");
    }

    pub fn state(&self) -> CircuitState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state"),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.inner.failure_count.load(Ordering::Acquire)
    }

    pub fn success_count(&self) -> usize {
        self.inner.success_count.load(Ordering::Acquire)
    }

    /// Time since the breaker opened, or zero if it is not currently open.
    pub fn open_duration(&self) -> Duration {
        if self.state() != CircuitState::Open {
            return Duration::from_millis(0);
        }
        let opened_at = self.inner.opened_at_millis.load(Ordering::Acquire);
        Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn starts_closed_and_allows_requests() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(1));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn transitions_to_half_open_after_timeout_elapses() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100)).with_clock(clock.clone());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());

        clock.advance(150);
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_and_resets_failures() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100)).with_clock(clock.clone());
        breaker.record_failure();
        clock.advance(150);
        assert!(breaker.allow_request());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_timer() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100)).with_clock(clock.clone());
        breaker.record_failure();
        clock.advance(150);
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timer restarted: not enough time has passed since the half-open failure.
        clock.advance(50);
        assert!(!breaker.allow_request());
        clock.advance(60);
        assert!(breaker.allow_request());
    }

    #[test]
    fn reset_forces_closed_regardless_of_state() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
