//! Circuit breaker shared by action middleware and the dispatcher.
//!
//! After `failure_threshold` consecutive failures the circuit opens and calls
//! are refused until `open_duration` elapses; then a single probe is let
//! through (HalfOpen). A successful probe closes the circuit, a failed one
//! reopens it.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::{ActionError, ActionHandler, ActionInput, ActionOutput, ActionPorts, CIRCUIT_OPEN_ERROR};

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward threshold.
    Closed { consecutive_failures: u32 },
    /// Calls are refused until `wait_duration` has elapsed since `opened_at`.
    Open {
        opened_at: Instant,
        wait_duration: Duration,
    },
    /// Probing: one call allowed to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    open_duration: Duration,
    pub total_calls: u64,
    pub total_failures: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            failure_threshold: failure_threshold.max(1),
            open_duration,
            total_calls: 0,
            total_failures: 0,
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    /// Whether a call may go through now.
    ///
    /// Transitions Open -> HalfOpen once the wait has elapsed.
    pub fn is_available(&mut self) -> bool {
        match &self.state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen => true,
            CircuitState::Open {
                opened_at,
                wait_duration,
            } => {
                if opened_at.elapsed() >= *wait_duration {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_calls += 1;
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self) {
        self.total_calls += 1;
        self.total_failures += 1;
        self.state = match &self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    self.open()
                } else {
                    CircuitState::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => self.open(),
        };
    }

    fn open(&self) -> CircuitState {
        CircuitState::Open {
            opened_at: Instant::now(),
            wait_duration: self.open_duration,
        }
    }
}

// ---------------------------------------------------------------------------
// Action middleware
// ---------------------------------------------------------------------------

/// Refuses calls to an action whose recent invocations keep failing.
///
/// The breaker lives as long as the wrapper, so register the wrapped handler
/// once in the `ActionRegistry` to share state across runs.
pub struct CircuitBreaking<H> {
    inner: H,
    breaker: Mutex<CircuitBreaker>,
}

impl<H: ActionHandler> CircuitBreaking<H> {
    pub fn new(inner: H, failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            inner,
            breaker: Mutex::new(CircuitBreaker::new(failure_threshold, open_duration)),
        }
    }

    fn with_breaker<T>(&self, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        match self.breaker.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl<H: ActionHandler> ActionHandler for CircuitBreaking<H> {
    fn ports(&self) -> ActionPorts {
        self.inner.ports()
    }

    fn execute(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send {
        async move {
            if !self.with_breaker(|b| b.is_available()) {
                return Err(ActionError::typed(
                    CIRCUIT_OPEN_ERROR,
                    format!("circuit open for action '{}'", input.node_type),
                ));
            }
            let result = self.inner.execute(input).await;
            match &result {
                Ok(_) => self.with_breaker(|b| b.record_success()),
                // Cancellation says nothing about the action's health.
                Err(e) if e.is_cancellation() => {}
                Err(_) => self.with_breaker(|b| b.record_failure()),
            }
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_probes_after_wait() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(10));
        assert!(cb.is_available());
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Closed { consecutive_failures: 1 }));
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));
        assert!(!cb.is_available());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.is_available());
        assert_eq!(cb.state(), &CircuitState::HalfOpen);

        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Open { .. }));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cb.is_available());
        cb.record_success();
        assert!(matches!(cb.state(), CircuitState::Closed { consecutive_failures: 0 }));
        assert_eq!(cb.total_failures, 3);
    }

    #[test]
    fn success_resets_failure_count() {
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(1));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert!(matches!(cb.state(), CircuitState::Closed { consecutive_failures: 1 }));
    }
}
