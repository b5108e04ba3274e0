//! Resilience primitives shared by every source adapter.
//!
//! - [`CircuitBreaker`]: per-source gate that fast-fails calls once an
//!   upstream keeps failing
//! - [`BackoffPolicy`]: exponential backoff with jitter
//! - [`retry`]: composes both around one network operation

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, BreakerConfig};
use crate::model::SourceType;

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    /// Set only while `status == Open`.
    pub opened_at: Option<Instant>,
    /// Admission time of the half-open trial call still in flight.
    pub trial_started: Option<Instant>,
}

impl CircuitBreakerState {
    fn closed() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started: None,
        }
    }
}

/// Returned by [`CircuitBreaker::try_acquire`] while the circuit is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit open for source '{source_type}' (retry in {remaining:?})")]
pub struct CircuitOpenError {
    pub source_type: SourceType,
    pub remaining: Duration,
}

/// Circuit breaker for one upstream source.
///
/// The breaker only sees outcomes, never causes. Every transition is:
///
/// ```text
/// Closed --(failures == threshold)--> Open --(cooldown elapsed, call)--> HalfOpen
/// HalfOpen --(success)--> Closed        HalfOpen --(failure)--> Open
/// ```
///
/// HalfOpen admits a single trial call. One that never reports back is
/// replaced once another cool-down has passed.
#[derive(Debug)]
pub struct CircuitBreaker {
    source_type: SourceType,
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(source_type: SourceType, threshold: u32, cooldown: Duration) -> Self {
        Self {
            source_type,
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(CircuitBreakerState::closed()),
        }
    }

    pub fn from_config(source_type: SourceType, config: &BreakerConfig) -> Self {
        Self::new(
            source_type,
            config.threshold,
            Duration::from_secs(config.cooldown_secs),
        )
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    /// Asks permission to make a call.
    pub fn try_acquire(&self) -> Result<(), CircuitOpenError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<(), CircuitOpenError> {
        let mut state = self.lock();
        match state.status {
            CircuitStatus::Closed => Ok(()),
            CircuitStatus::HalfOpen => {
                let busy = state
                    .trial_started
                    .map(|at| now.saturating_duration_since(at))
                    .filter(|elapsed| *elapsed < self.cooldown);
                match busy {
                    Some(elapsed) => Err(CircuitOpenError {
                        source_type: self.source_type,
                        remaining: self.cooldown - elapsed,
                    }),
                    None => {
                        state.trial_started = Some(now);
                        Ok(())
                    }
                }
            }
            CircuitStatus::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cooldown {
                    state.status = CircuitStatus::HalfOpen;
                    state.opened_at = None;
                    state.trial_started = Some(now);
                    info!(source = %self.source_type, "Circuit breaker HALF-OPEN, admitting a trial call");
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        source_type: self.source_type,
                        remaining: self.cooldown - elapsed,
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.status == CircuitStatus::Open {
            // Late success of a call admitted before the circuit opened.
            debug!(source = %self.source_type, "Ignoring success while circuit is open");
            return;
        }
        if state.status != CircuitStatus::Closed {
            info!(source = %self.source_type, "Circuit breaker CLOSED");
        }
        *state = CircuitBreakerState::closed();
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.status {
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                state.trial_started = None;
                warn!(source = %self.source_type, "Trial call failed, circuit breaker re-OPENED");
            }
            CircuitStatus::Closed if state.consecutive_failures >= self.threshold => {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                warn!(
                    source = %self.source_type,
                    failures = state.consecutive_failures,
                    "Circuit breaker OPEN"
                );
            }
            // Late failures from calls admitted before the circuit opened
            // do not restart the cool-down.
            _ => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        // The state is plain data; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Exponential Backoff
// ============================================================================

/// Exponential backoff with uniform jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1)`; `0.25` means ±25%.
    pub jitter: f64,
    /// Total attempts including the first one.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 0.99),
            max_attempts: config.max_attempts.max(1),
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retrying after failed attempt number `attempt`
    /// (0-based), without jitter: `min(max_delay, base_delay * 2^attempt)`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay, never above `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let offset = self.jitter * (fastrand::f64() * 2.0 - 1.0);
        delay.mul_f64(1.0 + offset).min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

// ============================================================================
// Retry Wrapper
// ============================================================================

/// Classifies errors for the retry wrapper.
pub trait Transient {
    /// `true` if trying again may succeed (network error, rate limit, 5xx).
    fn is_transient(&self) -> bool;

    /// Upstream-provided minimum wait (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Failure of a call made through [`retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Permanent(E),

    #[error("Cancelled")]
    Cancelled,
}

/// Runs `op` under the breaker and backoff policy.
///
/// `op` receives the 0-based attempt number. Transient failures are
/// recorded to the breaker and retried after a backoff sleep; permanent
/// failures return at once and count as a responsive upstream.
pub async fn retry<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + Transient + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        breaker.try_acquire()?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = op(attempt) => outcome,
        };

        match outcome {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(err) if !err.is_transient() => {
                breaker.record_success();
                return Err(RetryError::Permanent(err));
            }
            Err(err) => {
                breaker.record_failure();
                if !policy.should_retry(attempt) {
                    debug!(source = %breaker.source_type(), attempts = attempt + 1, error = %err, "Retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }

                let mut delay = policy.delay_for(attempt);
                if let Some(hint) = err.retry_after() {
                    delay = delay.max(hint).min(policy.max_delay);
                }
                debug!(
                    source = %breaker.source_type(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
