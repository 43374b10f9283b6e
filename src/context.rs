//! Per-operation context threaded through every transfer call.

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::CorrelationId;

/// Correlation id and cancellation signal for one logical operation.
///
/// Cloning is cheap; clones share the same cancellation token. Concurrent batch
/// operations each get their own context so correlation ids never cross.
#[derive(Clone, Debug)]
pub struct TransferContext {
    correlation_id: CorrelationId,
    cancel_token: CancellationToken,
}

impl TransferContext {
    /// Context with a freshly generated correlation id
    pub fn new() -> Self {
        Self::with_correlation_id(CorrelationId::generate())
    }

    /// Context reusing a correlation id supplied by the caller
    pub fn with_correlation_id(correlation_id: impl Into<CorrelationId>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token, e.g. with a child of an application-wide token
    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Correlation id sent with every request
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Token observed by every layer
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Child context: same correlation id, cancelled with the parent but cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            cancel_token: self.cancel_token.child_token(),
        }
    }

    /// Request cancellation of everything running under this context
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Await `future` unless cancellation wins the race, in which case it is dropped
    pub async fn cancellable<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(Error::Cancelled),
            result = future => result,
        }
    }

    /// Fail fast with [`Error::Cancelled`] if cancellation was requested
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl Default for TransferContext {
    fn default() -> Self {
        Self::new()
    }
}
