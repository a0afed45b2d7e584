//! Failure tripwire around a single remote backend.
//!
//! closed: calls pass through and failures are counted.
//! open: calls fail immediately until `recovery_timeout` has elapsed.
//! half_open: one trial call decides between closed and open.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is let through.
    pub recovery_timeout: Duration,
    /// Upper bound on a single wrapped call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view for health reports.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub open_for_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose recovery timeout has passed
    /// still reports `Open` until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.inner.lock().opened_at
    }

    /// Force the circuit closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            open_for_ms: inner
                .opened_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Run `operation` under the breaker and the per-call timeout.
    ///
    /// Returns `CircuitBreakerOpen` without invoking `operation` while the
    /// circuit is open. Any error, including a timeout, counts as a failure.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GateError>>,
    {
        let permit = self.admit()?;
        let mut guard = CallGuard {
            breaker: self,
            permit,
            settled: false,
        };

        let outcome = match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(GateError::AiServiceTimeout(
                self.config.call_timeout.as_millis() as u64,
            )),
        };

        guard.settled = true;
        match &outcome {
            Ok(_) => self.on_success(permit),
            Err(e) => self.on_failure(permit, e),
        }
        outcome
    }

    fn admit(&self) -> Result<Permit, GateError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let ready = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if ready {
                    debug!(breaker = %self.name, "circuit half-open, allowing trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial)
                } else {
                    Err(GateError::CircuitBreakerOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(GateError::CircuitBreakerOpen(self.name.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    /// Only a trial call can close the circuit. A call admitted while closed
    /// that finishes after the circuit opened leaves the state alone.
    fn on_success(&self, permit: Permit) {
        let mut inner = self.inner.lock();
        match permit {
            Permit::Trial => {
                debug!(breaker = %self.name, "circuit closed");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
            }
            Permit::Normal => {
                if inner.state == CircuitState::Closed {
                    inner.failure_count = 0;
                }
            }
        }
    }

    fn on_failure(&self, permit: Permit, error: &GateError) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);

        let trip = match permit {
            Permit::Trial => true,
            Permit::Normal => {
                inner.state == CircuitState::Closed
                    && inner.failure_count >= self.config.failure_threshold
            }
        };

        if trip {
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                error = %error,
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
        }
    }
}

/// Settles a trial call that was dropped before completing.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.permit == Permit::Trial {
            self.breaker
                .on_failure(self.permit, &GateError::Internal("trial call cancelled".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), GateError> {
        cb.call(|| async { Err::<(), _>(GateError::AiServiceUnavailable("down".into())) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker();

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
        assert!(cb.opened_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_does_not_invoke_operation() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let calls = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result, Err(GateError::CircuitBreakerOpen("test".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        cb.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(cb.failure_count(), 0);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_recovery_timeout() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        let calls = AtomicU32::new(0);
        let trial = cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        let second = cb.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (trial, second) = tokio::join!(trial, second);

        assert!(trial.is_ok());
        assert!(matches!(second, Err(GateError::CircuitBreakerOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_during_trial() {
        let cb = Arc::new(CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(120),
            },
        ));

        // Admitted while closed, finishes at t=40
        let slow = tokio::spawn({
            let cb = cb.clone();
            async move {
                cb.call(|| async {
                    tokio::time::sleep(Duration::from_secs(40)).await;
                    Ok(())
                })
                .await
            }
        });
        tokio::task::yield_now().await;

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        // Trial admitted at t=30, finishes at t=50
        tokio::time::sleep(Duration::from_secs(30)).await;
        let trial = tokio::spawn({
            let cb = cb.clone();
            async move {
                cb.call(|| async {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    Ok(())
                })
                .await
            }
        });
        tokio::task::yield_now().await;

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(slow.is_finished());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let extra = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                extra.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GateError::CircuitBreakerOpen(_))));
        assert_eq!(extra.load(Ordering::SeqCst), 0);

        assert!(trial.await.unwrap().is_ok());
        assert!(slow.await.unwrap().is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_restarts_timer() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        let first_open = cb.opened_at().unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(fail(&cb).await.is_err());

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.opened_at().unwrap() > first_open);

        // Timer restarted: still short-circuiting shortly after
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(fail(&cb).await, Err(GateError::CircuitBreakerOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let cb = breaker();

        let result = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(GateError::AiServiceTimeout(5000)));
        assert_eq!(cb.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = cb.call(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        });
        // Drop the trial before it finishes
        let _ = tokio::time::timeout(Duration::from_millis(100), trial).await;

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset() {
        let cb = breaker();
        {
            let mut inner = cb.inner.lock();
            inner.state = CircuitState::Open;
            inner.failure_count = 9;
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.snapshot().open_for_ms, None);
    }
}
