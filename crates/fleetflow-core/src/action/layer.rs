//! Middleware applied around every action invocation.
//!
//! The orchestrator composes, innermost first:
//! `OnError` (capture hook) -> `Deadline` (per-attempt timeout + cancellation)
//! -> `Retrying`. Retrying sits outermost so each attempt gets its own
//! deadline and its own capture.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

use super::{ActionError, ActionHandler, ActionInput, ActionOutput, ActionPorts};

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

/// Bounds one invocation by a timeout and the run's cancellation token.
pub struct Deadline<H> {
    inner: H,
    timeout: Duration,
}

impl<H: ActionHandler> Deadline<H> {
    pub fn new(inner: H, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<H: ActionHandler> ActionHandler for Deadline<H> {
    fn ports(&self) -> ActionPorts {
        self.inner.ports()
    }

    fn execute(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send {
        async move {
            let cancel = input.cancel.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ActionError::cancelled()),
                result = tokio::time::timeout(self.timeout, self.inner.execute(input)) => {
                    result.unwrap_or_else(|_| Err(ActionError::timeout(self.timeout)))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// OnError
// ---------------------------------------------------------------------------

/// Capture point invoked when an action fails (screenshots, page dumps...).
///
/// Whatever the hook returns is attached to the error's `details`.
pub trait ErrorHook: Send + Sync {
    fn capture<'a>(
        &'a self,
        input: &'a ActionInput,
        error: &'a ActionError,
    ) -> BoxFuture<'a, Option<Value>>;
}

/// Runs an [`ErrorHook`] on every failed invocation of the inner action.
pub struct OnError<H> {
    inner: H,
    hook: Arc<dyn ErrorHook>,
}

impl<H: ActionHandler> OnError<H> {
    pub fn new(inner: H, hook: Arc<dyn ErrorHook>) -> Self {
        Self { inner, hook }
    }
}

impl<H: ActionHandler> ActionHandler for OnError<H> {
    fn ports(&self) -> ActionPorts {
        self.inner.ports()
    }

    fn execute(
        &self,
        input: ActionInput,
    ) -> impl Future<Output = Result<ActionOutput, ActionError>> + Send {
        async move {
            match self.inner.execute(input.clone()).await {
                Ok(output) => Ok(output),
                Err(err) if err.is_cancellation() => Err(err),
                Err(mut err) => {
                    if let Some(details) = self.hook.capture(&input, &err).await {
                        err.details = Some(details);
                    }
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Sleepy(Duration);

    impl ActionHandler for Sleepy {
        fn ports(&self) -> ActionPorts {
            ActionPorts::flow()
        }

        async fn execute(&self, _input: ActionInput) -> Result<ActionOutput, ActionError> {
            tokio::time::sleep(self.0).await;
            Ok(ActionOutput::empty())
        }
    }

    struct AlwaysFails;

    impl ActionHandler for AlwaysFails {
        fn ports(&self) -> ActionPorts {
            ActionPorts::flow()
        }

        async fn execute(&self, _input: ActionInput) -> Result<ActionOutput, ActionError> {
            Err(ActionError::new("nope"))
        }
    }

    struct Screenshot;

    impl ErrorHook for Screenshot {
        fn capture<'a>(
            &'a self,
            input: &'a ActionInput,
            _error: &'a ActionError,
        ) -> BoxFuture<'a, Option<Value>> {
            Box::pin(async move { Some(json!({"screenshot": format!("{}.png", input.node_id)})) })
        }
    }

    fn input(cancel: CancellationToken) -> ActionInput {
        ActionInput {
            run_id: Uuid::now_v7(),
            node_id: "click".into(),
            node_type: "Click".into(),
            config: Map::new(),
            inputs: Map::new(),
            variables: Map::new(),
            attempt: 1,
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_slow_action() {
        let layer = Deadline::new(Sleepy(Duration::from_secs(5)), Duration::from_secs(1));
        let err = layer.execute(input(CancellationToken::new())).await.unwrap_err();
        assert_eq!(err.error_type, super::super::TIMEOUT_ERROR);
        assert!(err.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_honors_cancellation() {
        let token = CancellationToken::new();
        let layer = Deadline::new(Sleepy(Duration::from_secs(5)), Duration::from_secs(60));
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { layer.execute(input(token)).await })
        };
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn on_error_attaches_capture() {
        let layer = OnError::new(AlwaysFails, Arc::new(Screenshot));
        let err = layer.execute(input(CancellationToken::new())).await.unwrap_err();
        assert_eq!(err.details, Some(json!({"screenshot": "click.png"})));
    }
}
