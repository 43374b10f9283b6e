//! Batch status polling.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::PollProfile;
use crate::context::TransferContext;
use crate::error::{Error, Result};
use crate::transport::BatchTransport;
use crate::types::{BatchId, BatchStatus};

/// Progress of one polling run
#[derive(Clone, Copy, Debug)]
pub struct PollState {
    started: Instant,
    cutoff: Duration,
    delay: Duration,
    /// Most recently observed status
    pub last_status: BatchStatus,
    /// Status requests issued so far
    pub requests: u32,
}

impl PollState {
    fn new(profile: PollProfile) -> Self {
        Self {
            started: Instant::now(),
            cutoff: profile.cutoff,
            delay: profile.delay,
            last_status: BatchStatus::Incomplete,
            requests: 0,
        }
    }

    /// Time since polling started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Another status request is due
    pub fn should_continue(&self) -> bool {
        self.last_status.is_pending() && self.elapsed() < self.cutoff
    }
}

/// Waits for a committed batch to reach a terminal status
#[derive(Clone)]
pub struct BatchStatusPoller {
    transport: Arc<dyn BatchTransport>,
}

impl BatchStatusPoller {
    /// Create a poller over a transport
    pub fn new(transport: Arc<dyn BatchTransport>) -> Self {
        Self { transport }
    }

    /// Poll until the batch leaves `Incomplete`/`CommitInProgress` or the cutoff passes
    ///
    /// The first request is made one `delay` after the call. A terminal status
    /// (including `Failed`) is returned as-is.
    ///
    /// # Errors
    ///
    /// - [`Error::PollRequestFailed`] as soon as a status request fails
    /// - [`Error::PollingTimedOut`] if the batch is still pending at the cutoff
    /// - [`Error::Cancelled`] if the context is cancelled while waiting
    pub async fn await_terminal(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        profile: PollProfile,
    ) -> Result<BatchStatus> {
        let mut state = PollState::new(profile);

        while state.should_continue() {
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(state.delay) => {}
            }

            let raw = ctx
                .cancellable(self.transport.get_status(ctx, batch_id))
                .await?;
            state.requests += 1;
            state.last_status = BatchStatus::parse_lenient(&raw);

            tracing::debug!(
                batch_id = %batch_id,
                raw_status = %raw,
                status = %state.last_status,
                attempt = state.requests,
                elapsed_secs = state.elapsed().as_secs(),
                "Polled batch status"
            );
        }

        if state.last_status.is_pending() {
            tracing::error!(
                batch_id = %batch_id,
                status = %state.last_status,
                cutoff_secs = state.cutoff.as_secs(),
                "Batch did not reach a terminal status before the cutoff"
            );
            return Err(Error::PollingTimedOut {
                batch_id: batch_id.clone(),
                last_status: state.last_status,
                waited: state.elapsed(),
            });
        }

        tracing::info!(batch_id = %batch_id, status = %state.last_status, "Batch reached terminal status");
        Ok(state.last_status)
    }
}
