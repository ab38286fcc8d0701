//! Circuit breaker for fault tolerance.
//!
//! Wraps calls to a volatile dependency (store, runtime) and fails fast once
//! the observed failure rate inside the monitoring window crosses the
//! configured threshold, recovering via a timed half-open probe.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, WorkdenError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// How long an open circuit blocks before allowing a half-open probe.
    pub recovery_timeout: Duration,
    /// Sliding window length for failure-rate tracking.
    pub monitoring_period: Duration,
    /// Failure rate (0..=1) above which the circuit opens.
    pub expected_failure_rate: f64,
    /// Minimum samples in the window before the rate is considered at all.
    pub minimum_request_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            expected_failure_rate: 0.5,
            minimum_request_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Requests flow through.
    Closed,
    /// Requests are rejected until the recovery timeout elapses.
    Open,
    /// A probing request is allowed through to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub window_requests: u32,
    pub window_failures: u32,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: Vec<Sample>,
    next_attempt_at: Option<Instant>,
}

/// Per-dependency circuit breaker. Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    dependency: String,
    config: CircuitBreakerConfig,
    inner: Arc<RwLock<BreakerInner>>,
}

enum Gate {
    Permit,
    Reject,
}

impl CircuitBreaker {
    pub fn new(dependency: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            dependency: dependency.to_string(),
            config,
            inner: Arc::new(RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                window: Vec::new(),
                next_attempt_at: None,
            })),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Run `operation` under the breaker. While the circuit is open and the
    /// recovery timeout has not elapsed, the operation is not invoked and
    /// `CircuitOpen` is returned.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.before_call().await {
            Gate::Permit => {}
            Gate::Reject => {
                return Err(WorkdenError::CircuitOpen {
                    dependency: self.dependency.clone(),
                })
            }
        }

        let result = operation().await;
        self.after_call(result.is_ok()).await;
        result
    }

    /// Like [`execute`](Self::execute), but degrades to `fallback` instead
    /// of surfacing an error when the circuit is (or just became) open.
    /// A failure that leaves the circuit closed still propagates.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        match self.before_call().await {
            Gate::Permit => {}
            Gate::Reject => return fallback().await,
        }

        let result = operation().await;
        self.after_call(result.is_ok()).await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.state().await == CircuitState::Open {
                    tracing::warn!(
                        dependency = %self.dependency,
                        error = %e,
                        "circuit opened, serving fallback"
                    );
                    fallback().await
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.write().await;
        Self::prune(&mut inner, self.config.monitoring_period);

        let total = inner.window.len() as u32;
        let failures = inner.window.iter().filter(|s| !s.success).count() as u32;
        CircuitBreakerStats {
            state: inner.state,
            window_requests: total,
            window_failures: failures,
            failure_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
        }
    }

    /// Open the circuit regardless of observed traffic.
    pub async fn force_open(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout);
        tracing::warn!(dependency = %self.dependency, "circuit breaker forced open");
    }

    /// Close the circuit; the sample window is kept.
    pub async fn force_close(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.next_attempt_at = None;
        tracing::info!(dependency = %self.dependency, "circuit breaker forced closed");
    }

    /// Close the circuit and discard all samples.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.next_attempt_at = None;
        inner.window.clear();
        tracing::info!(dependency = %self.dependency, "circuit breaker reset");
    }

    async fn before_call(&self) -> Gate {
        let mut inner = self.inner.write().await;
        Self::prune(&mut inner, self.config.monitoring_period);

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Gate::Permit,
            CircuitState::Open => {
                let due = inner
                    .next_attempt_at
                    .is_some_and(|at| Instant::now() >= at);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(
                        dependency = %self.dependency,
                        "circuit breaker half-open, probing"
                    );
                    Gate::Permit
                } else {
                    Gate::Reject
                }
            }
        }
    }

    async fn after_call(&self, success: bool) {
        let mut inner = self.inner.write().await;
        Self::prune(&mut inner, self.config.monitoring_period);
        inner.window.push(Sample {
            at: Instant::now(),
            success,
        });

        match inner.state {
            CircuitState::HalfOpen => {
                if success {
                    inner.state = CircuitState::Closed;
                    inner.next_attempt_at = None;
                    inner.window.clear();
                    tracing::info!(
                        dependency = %self.dependency,
                        "circuit breaker closed after successful probe"
                    );
                } else {
                    self.trip(&mut inner, "probe failed in half-open");
                }
            }
            CircuitState::Closed => {
                if !success && self.over_threshold(&inner) {
                    self.trip(&mut inner, "failure rate over threshold");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn over_threshold(&self, inner: &BreakerInner) -> bool {
        let total = inner.window.len() as u32;
        if total < self.config.minimum_request_threshold {
            return false;
        }
        let failures = inner.window.iter().filter(|s| !s.success).count();
        failures as f64 / total as f64 > self.config.expected_failure_rate
    }

    fn trip(&self, inner: &mut BreakerInner, cause: &str) {
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout);
        tracing::warn!(
            dependency = %self.dependency,
            cause,
            window = inner.window.len(),
            "circuit breaker opened"
        );
    }

    fn prune(inner: &mut BreakerInner, monitoring_period: Duration) {
        let Some(cutoff) = Instant::now().checked_sub(monitoring_period) else {
            return;
        };
        inner.window.retain(|s| s.at >= cutoff);
    }
}
