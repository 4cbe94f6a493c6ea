//! Caller cancellation and deadlines.
//!
//! Every suspension point in the engine (queueing for a permit, waiting on a
//! dependency, waiting on a process) races against the caller's `CallContext`.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

/// Cancellation token plus optional deadline supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Attach an externally owned token (e.g. a server shutdown token).
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancelled or past the deadline.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the caller gives up, with the matching `Cancelled` error.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::cancelled("caller cancelled"),
                _ = tokio::time::sleep_until(deadline) => Error::cancelled("caller deadline elapsed"),
            },
            None => {
                self.token.cancelled().await;
                Error::cancelled("caller cancelled")
            }
        }
    }

    /// Run `fut` unless the caller gives up first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        if self.is_done() {
            return Err(self.done().await);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_without_cancellation() {
        let ctx = CallContext::new();
        let value = ctx.run(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_deadline_cancels_pending_future() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let err = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn test_external_token_cancels() {
        let token = CancellationToken::new();
        let ctx = CallContext::with_token(token.clone());
        assert!(!ctx.is_done());
        token.cancel();
        let err = ctx.run(async { 1 }).await.unwrap_err();
        assert!(err.to_string().contains("caller cancelled"));
    }
}
