/**
 * REQUIREMENT: Transient faults are retried with exponential backoff; repeated
 * failures open a circuit breaker around the cluster store and REST calls
 * PURPOSE: Standalone retry and circuit-breaker helpers with explicit timeouts
 */
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{CollabError, CollabResult};

/// Retry policy: base delay doubled per attempt, up to `max_attempts`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Run `operation` under the policy, retrying on error with exponential backoff
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
) -> CollabResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CollabResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    policy.max_attempts,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker: after `failure_threshold` consecutive failures the circuit
/// opens for `open_duration`; a half-open probe admits one call
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_duration: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold,
            open_duration,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Defaults from the error-handling design: 5 failures, 60 s open window
    pub fn with_defaults(name: &str) -> Self {
        Self::new(name, 5, Duration::from_secs(60))
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Gate a call attempt; `Err(CircuitOpen)` while the window has not elapsed
    pub fn check(&self) -> CollabResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.open_duration {
                    inner.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(CollabError::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        if inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold
        {
            if inner.state != CircuitState::Open {
                warn!(
                    "circuit breaker '{}' opened after {} consecutive failures",
                    self.name, inner.consecutive_failures
                );
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `operation` through the breaker with a caller-side timeout
    pub async fn call<T, Fut>(&self, timeout: Duration, operation: Fut) -> CollabResult<T>
    where
        Fut: Future<Output = CollabResult<T>>,
    {
        self.check()?;
        match tokio::time::timeout(timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(err)
            }
            Err(_) => {
                self.record_failure();
                Err(CollabError::Timeout(self.name.clone()))
            }
        }
    }
}
