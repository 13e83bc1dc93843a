//! Replay handler seam: the application code that re-submits a mutation.

use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

use offgrid_storage::PendingMutation;

/// A replay attempt did not succeed.
///
/// Always treated as retryable by the coordinator.
#[derive(Debug, Clone, Error)]
#[error("Replay failed: {0}")]
pub struct ReplayError(pub String);

impl ReplayError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Re-submits a pending mutation to its destination.
///
/// Implementations own authentication, transport and timeouts; the
/// coordinator waits for as long as `replay` takes and never inspects the
/// payload.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, mutation: &PendingMutation) -> Result<(), ReplayError>;
}

/// Replay handler backed by an async closure.
pub struct FnReplayHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`ReplayHandler`].
///
/// The closure receives its own copy of the mutation.
pub fn replay_fn<F, Fut>(f: F) -> FnReplayHandler<F>
where
    F: Fn(PendingMutation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ReplayError>> + Send,
{
    FnReplayHandler { f }
}

#[async_trait]
impl<F, Fut> ReplayHandler for FnReplayHandler<F>
where
    F: Fn(PendingMutation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ReplayError>> + Send,
{
    async fn replay(&self, mutation: &PendingMutation) -> Result<(), ReplayError> {
        (self.f)(mutation.clone()).await
    }
}
