//! Circuit breaker for the AI matcher.
//!
//! Tracks consecutive failures; once the limit is hit the breaker opens and
//! every call is refused until the cooldown elapses.  The first call after
//! the cooldown is a trial: success closes the breaker, failure reopens it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub max_consecutive_failures: u32,
    /// How long the breaker stays open
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            max_consecutive_failures: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    open: AtomicBool,
    consecutive_failures: AtomicU32,
    tripped_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            "[CB] Matcher breaker: {} failures, cooldown {:?}",
            config.max_consecutive_failures, config.cooldown
        );
        CircuitBreaker {
            config,
            open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            tripped_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BreakerState {
        if !self.open.load(Ordering::SeqCst) {
            return BreakerState::Closed;
        }
        let tripped_at = *self.tripped_at.lock().unwrap_or_else(PoisonError::into_inner);
        match tripped_at {
            Some(t) if t.elapsed() >= self.config.cooldown => BreakerState::HalfOpen,
            _ => BreakerState::Open,
        }
    }

    /// Whether a call may go through now.
    pub fn allow(&self) -> bool {
        self.state() != BreakerState::Open
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            info!("[CB] Matcher breaker closed");
            *self.tripped_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let half_open = self.state() == BreakerState::HalfOpen;
        if failures >= self.config.max_consecutive_failures || half_open {
            self.trip(failures);
        }
    }

    fn trip(&self, failures: u32) {
        error!(
            "[CB] Matcher breaker OPEN after {} consecutive failures (limit {})",
            failures, self.config.max_consecutive_failures
        );
        self.open.store(true, Ordering::SeqCst);
        *self.tripped_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}
