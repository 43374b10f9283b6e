//! Retry decorator around any [`BatchTransport`].

use async_trait::async_trait;

use super::{BatchTransport, BlockPayload, RangeRequest, RangedResponse};
use crate::config::RetryConfig;
use crate::context::TransferContext;
use crate::error::Result;
use crate::retry::with_retry_cancellable;
use crate::types::{BatchDescriptor, BatchId, BlockId, FileDescriptor, FileHash};

/// Retries transient failures of the wrapped transport with exponential backoff
///
/// Only errors classified as retryable by [`IsRetryable`](crate::retry::IsRetryable)
/// are retried: connection failures, 408, 429 and 5xx gateway statuses. Cancelling
/// the call's [`TransferContext`] abandons both the attempt in flight and the
/// backoff wait.
///
/// Creating a batch is not idempotent on the service side; a retried create after a
/// lost response leaves an orphaned empty batch. `create_batch` is therefore passed
/// through once unless [`retrying_create_batch`](Self::retrying_create_batch) opts in.
pub struct RetryingTransport<T> {
    inner: T,
    config: RetryConfig,
    retry_create: bool,
}

impl<T: BatchTransport> RetryingTransport<T> {
    /// Wrap a transport
    pub fn new(inner: T, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            retry_create: false,
        }
    }

    /// Retry `create_batch` as well
    pub fn retrying_create_batch(mut self) -> Self {
        self.retry_create = true;
        self
    }

    /// The wrapped transport
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: BatchTransport> BatchTransport for RetryingTransport<T> {
    async fn create_batch(
        &self,
        ctx: &TransferContext,
        descriptor: &BatchDescriptor,
    ) -> Result<BatchId> {
        if !self.retry_create {
            return ctx
                .cancellable(self.inner.create_batch(ctx, descriptor))
                .await;
        }
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.create_batch(ctx, descriptor)
        })
        .await
    }

    async fn register_file(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file: &FileDescriptor,
    ) -> Result<()> {
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.register_file(ctx, batch_id, file)
        })
        .await
    }

    async fn upload_block(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block: &BlockPayload,
    ) -> Result<()> {
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.upload_block(ctx, batch_id, file_name, block)
        })
        .await
    }

    async fn commit_block_list(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block_ids: &[BlockId],
    ) -> Result<()> {
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.commit_block_list(ctx, batch_id, file_name, block_ids)
        })
        .await
    }

    async fn commit_batch(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        files: &[FileHash],
    ) -> Result<()> {
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.commit_batch(ctx, batch_id, files)
        })
        .await
    }

    async fn get_status(&self, ctx: &TransferContext, batch_id: &BatchId) -> Result<String> {
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.get_status(ctx, batch_id)
        })
        .await
    }

    async fn ranged_get(
        &self,
        ctx: &TransferContext,
        request: RangeRequest<'_>,
    ) -> Result<RangedResponse> {
        let inner = &self.inner;
        with_retry_cancellable(&self.config, ctx.cancel_token(), move || {
            inner.ranged_get(ctx, request)
        })
        .await
    }
}
