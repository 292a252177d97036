//! Circuit breakers for the engine's external dependencies.
//!
//! A breaker fronts one named dependency and trips after repeated failures,
//! so a struggling service sees silence instead of a stream of doomed calls.
//! State sits behind a mutex; the protected operation itself runs outside
//! the lock.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

/// Life cycle of a breaker.
///
/// `Closed` is normal operation. Enough failures open the breaker, and calls
/// fail fast without reaching the dependency until the recovery timeout has
/// passed. The next caller after that moves it to `HalfOpen` and probes;
/// enough consecutive probe successes close it again, while a probe failure
/// reopens it immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trip and recovery thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before a probe is allowed through.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
}

impl BreakerConfig {
    pub const fn new(
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            success_threshold,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60), 3)
    }
}

/// Failure mode of a guarded call.
#[derive(Debug, Error)]
pub enum GuardError<E>
where
    E: std::error::Error,
{
    /// The breaker was open; the dependency was never called.
    #[error("{0} circuit breaker is open")]
    Open(String),
    /// The dependency was called and failed; the failure has been counted.
    #[error("{0}")]
    Service(E),
}

impl<E> GuardError<E>
where
    E: std::error::Error,
{
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Point-in-time breaker view for status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Runs `op` under the breaker.
    ///
    /// Returns [`GuardError::Open`] without invoking `op` while the breaker
    /// is open and the recovery timeout has not yet elapsed.
    pub async fn guard<T, E, F, Fut>(&self, op: F) -> Result<T, GuardError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.acquire() {
            return Err(GuardError::Open(self.name.clone()));
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure(&error);
                Err(GuardError::Service(error))
            }
        }
    }

    /// Gate for one call attempt; flips an expired open breaker to half-open.
    fn acquire(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return true;
        }
        let expired = inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
        if expired {
            inner.state = CircuitState::HalfOpen;
            tracing::info!(breaker = %self.name, "Circuit breaker probing for recovery");
        }
        expired
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            _ => inner.failure_count = 0,
        }
    }

    // The failure count is only cleared on a fully closed breaker, so a
    // single half-open failure is already back at the threshold and reopens.
    fn record_failure(&self, error: &dyn fmt::Display) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failure_count >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.success_count = 0;
            tracing::error!(breaker = %self.name, %error, "Circuit breaker opened");
        }
    }

    // Critical sections never panic; recover the value from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
