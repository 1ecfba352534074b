//! Per-node retry with exponential backoff.
//!
//! [`RetryPolicy`] is stateless configuration; [`Retrying`] applies it around
//! any [`ActionHandler`]. A failure is only handed back to the orchestrator
//! (and so becomes eligible for `Catch` interception) after the last attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{ActionError, ActionHandler, ActionInput, ActionOutput, ActionPorts};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry budget and backoff curve for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub retry_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retry_count: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn new(retry_count: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retry_count,
            base_delay,
            max_delay,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Whether a failure on `attempt` (1-based) should be retried.
    pub fn should_retry(&self, attempt: u32, error: &ActionError) -> bool {
        error.retryable && attempt < self.max_attempts()
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Retrying layer
// ---------------------------------------------------------------------------

/// Callback invoked for every failed attempt that will be retried.
pub type RetryObserver = Arc<dyn Fn(&ActionError, u32) + Send + Sync>;

/// Middleware re-invoking the inner action per [`RetryPolicy`].
pub struct Retrying<H> {
    inner: H,
    policy: RetryPolicy,
    observer: Option<RetryObserver>,
}

impl<H: ActionHandler> Retrying<H> {
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            observer: None,
        }
    }

    pub fn observe(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl<H: ActionHandler> ActionHandler for Retrying<H> {
    fn ports(&self) -> ActionPorts {
        self.inner.ports()
    }

    fn execute(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send {
        async move {
            let mut attempt = 1;
            loop {
                let mut this_try = input.clone();
                this_try.attempt = attempt;
                match self.inner.execute(this_try).await {
                    Ok(output) => return Ok(output),
                    Err(mut err) => {
                        err.attempts = attempt;
                        if !self.policy.should_retry(attempt, &err) || input.cancel.is_cancelled() {
                            return Err(err);
                        }
                        if let Some(observer) = &self.observer {
                            observer(&err, attempt);
                        }
                        let delay = self.policy.backoff(attempt);
                        tracing::debug!(
                            node_id = %input.node_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying action"
                        );
                        tokio::select! {
                            _ = input.cancel.cancelled() => return Err(ActionError::cancelled()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::Map;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Flaky {
        fail_times: u32,
        calls: Arc<AtomicU32>,
        retryable: bool,
    }

    impl ActionHandler for Flaky {
        fn ports(&self) -> ActionPorts {
            ActionPorts::flow()
        }

        async fn execute(&self, input: ActionInput) -> Result<ActionOutput, ActionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(input.attempt, n);
            if n <= self.fail_times {
                let err = ActionError::new(format!("fail {n}"));
                Err(if self.retryable { err } else { err.permanent() })
            } else {
                Ok(ActionOutput::empty())
            }
        }
    }

    fn input() -> ActionInput {
        ActionInput {
            run_id: Uuid::now_v7(),
            node_id: "n".into(),
            node_type: "Flaky".into(),
            config: Map::new(),
            inputs: Map::new(),
            variables: Map::new(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(40), Duration::from_millis(500));
        assert_eq!(p.max_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let observed = Arc::new(AtomicU32::new(0));
        let seen = observed.clone();
        let layer = Retrying::new(
            Flaky { fail_times: 2, calls: calls.clone(), retryable: true },
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1)),
        )
        .observe(Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(layer.execute(input()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let layer = Retrying::new(
            Flaky { fail_times: 10, calls: calls.clone(), retryable: true },
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_secs(1)),
        );
        let err = layer.execute(input()).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let layer = Retrying::new(
            Flaky { fail_times: 10, calls: calls.clone(), retryable: false },
            RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(1)),
        );
        assert!(layer.execute(input()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
