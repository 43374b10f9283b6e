//! Raw operations against the batch service.
//!
//! [`BatchTransport`] is the seam every engine talks through:
//! - [`HttpTransport`] - reqwest implementation of the wire protocol
//! - [`RetryingTransport`] - optional outer decorator retrying transient failures
//!
//! Transports carry no business logic. They map each call onto one HTTP request and
//! each non-success response onto the matching typed error.

mod http;
#[cfg(test)]
pub(crate) mod mock;
mod retrying;

pub use http::{CORRELATION_ID_HEADER, HttpTransport};
pub use retrying::RetryingTransport;

use async_trait::async_trait;
use bytes::Bytes;

use crate::context::TransferContext;
use crate::error::Result;
use crate::types::{BatchDescriptor, BatchId, BlockId, ByteRange, FileDescriptor, FileHash};

/// Content of one block plus its integrity hash
#[derive(Clone, Debug)]
pub struct BlockPayload {
    /// Block identifier
    pub block_id: BlockId,
    /// Raw block bytes
    pub content: Bytes,
    /// Base64-encoded MD5 of `content`, sent as `Content-MD5`
    pub content_md5: String,
}

/// One ranged GET
#[derive(Clone, Copy, Debug)]
pub struct RangeRequest<'a> {
    /// File name used in error reports
    pub file_name: &'a str,
    /// Absolute URI or path relative to the service base URL
    pub uri: &'a str,
    /// Bytes to fetch
    pub range: ByteRange,
    /// Attach the bearer token (false once a redirect has been followed)
    pub authorize: bool,
}

/// Outcome of a ranged GET
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RangedResponse {
    /// The requested bytes
    Content(Bytes),
    /// The service redirected the request to this absolute location
    Redirect(String),
}

/// Raw batch service operations. No retries, no business logic.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Create a batch container and return its server-assigned id
    async fn create_batch(
        &self,
        ctx: &TransferContext,
        descriptor: &BatchDescriptor,
    ) -> Result<BatchId>;

    /// Register a file in a batch before its blocks are uploaded
    async fn register_file(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file: &FileDescriptor,
    ) -> Result<()>;

    /// Upload one block of a registered file
    async fn upload_block(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block: &BlockPayload,
    ) -> Result<()>;

    /// Commit a file's blocks in the given order
    async fn commit_block_list(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block_ids: &[BlockId],
    ) -> Result<()>;

    /// Commit the batch with one content hash per file
    async fn commit_batch(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        files: &[FileHash],
    ) -> Result<()>;

    /// Raw status string of a batch
    async fn get_status(&self, ctx: &TransferContext, batch_id: &BatchId) -> Result<String>;

    /// Fetch a byte range of a remote file, or the location it was redirected to
    async fn ranged_get(
        &self,
        ctx: &TransferContext,
        request: RangeRequest<'_>,
    ) -> Result<RangedResponse>;
}
