//! Deadline-bearing call contexts.
//!
//! Every public driver call takes a [`CallContext`]. Canceling it (or letting its
//! deadline pass) aborts in-flight requests, stops retries and abandons query cursors.

use cosmosql_error::{CosmosError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a context canceled together with `self`, with its own cancel handle.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast when the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(CosmosError::canceled("call canceled"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CosmosError::canceled("deadline exceeded"));
        }
        Ok(())
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> CosmosError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => CosmosError::canceled("call canceled"),
                _ = tokio::time::sleep_until(deadline) => CosmosError::canceled("deadline exceeded"),
            },
            None => {
                self.token.cancelled().await;
                CosmosError::canceled("call canceled")
            }
        }
    }

    /// Run `fut` unless the context finishes first; the future is dropped on cancellation.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }

    /// Sleep for `delay` unless the context finishes first.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}
