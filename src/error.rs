//! Error types for batch-transfer
//!
//! Every failure raised by the transfer core is typed and carries the identifiers needed
//! to diagnose it (batch id, file name, block id, HTTP status). Nothing in the core
//! downgrades or swallows an error; retrying transient failures is left to
//! [`RetryingTransport`](crate::transport::RetryingTransport) or the calling workflow.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::{BatchId, BatchStatus, BlockId};

/// Result type alias for batch-transfer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for batch-transfer
#[derive(Debug, Error)]
pub enum Error {
    /// Bearer token acquisition failed
    #[error("failed to acquire token for {resource}: {reason}")]
    AuthFailure {
        /// Logical resource the token was requested for
        resource: String,
        /// Why the token source failed
        reason: String,
    },

    /// A create/register/upload/commit call returned a non-success status or never completed
    #[error("{stage} failed for {target}{}: {reason}", fmt_status(.status))]
    TransferFailed {
        /// Which lifecycle stage failed
        stage: TransferStage,
        /// Identifiers of the batch/file/block involved
        target: TransferTarget,
        /// HTTP status, if a response was received
        status: Option<u16>,
        /// Human-readable failure reason
        reason: String,
    },

    /// The status endpoint itself failed while polling
    #[error("status request for batch {batch_id} failed{}: {reason}", fmt_status(.status))]
    PollRequestFailed {
        /// Batch being polled
        batch_id: BatchId,
        /// HTTP status, if a response was received
        status: Option<u16>,
        /// Human-readable failure reason
        reason: String,
    },

    /// The cutoff elapsed while the batch was still Incomplete or CommitInProgress
    #[error("batch {batch_id} still {last_status} after {waited:?}")]
    PollingTimedOut {
        /// Batch being polled
        batch_id: BatchId,
        /// Last status observed before giving up
        last_status: BatchStatus,
        /// Time spent polling
        waited: Duration,
    },

    /// A ranged GET returned a non-success status
    #[error("download of {file_name} failed{}: {reason}", fmt_status(.status))]
    DownloadFailed {
        /// Remote file being downloaded
        file_name: String,
        /// HTTP status, if a response was received
        status: Option<u16>,
        /// Human-readable failure reason
        reason: String,
    },

    /// The service reported the batch as Failed after commit
    #[error("batch {batch_id} was rejected by the service")]
    BatchRejected {
        /// Batch that ended in the Failed state
        batch_id: BatchId,
    },

    /// The operation was cancelled through its [`TransferContext`](crate::TransferContext)
    #[error("transfer cancelled")]
    Cancelled,

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.window_bytes")
        key: Option<String>,
    },

    /// I/O error reading a block source or writing a download sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl Error {
    /// Build a [`Error::TransferFailed`]
    pub fn transfer(
        stage: TransferStage,
        target: TransferTarget,
        status: Option<u16>,
        reason: impl Into<String>,
    ) -> Self {
        Error::TransferFailed {
            stage,
            target,
            status,
            reason: reason.into(),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::TransferFailed { status, .. }
            | Error::PollRequestFailed { status, .. }
            | Error::DownloadFailed { status, .. } => *status,
            _ => None,
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::AuthFailure { .. } => "auth_failure",
            Error::TransferFailed { stage, .. } => match stage {
                TransferStage::Create => "create_failed",
                TransferStage::Register => "register_failed",
                TransferStage::Upload => "upload_failed",
                TransferStage::CommitBlocks => "commit_blocks_failed",
                TransferStage::CommitBatch => "commit_batch_failed",
            },
            Error::PollRequestFailed { .. } => "poll_request_failed",
            Error::PollingTimedOut { .. } => "polling_timed_out",
            Error::DownloadFailed { .. } => "download_failed",
            Error::BatchRejected { .. } => "batch_rejected",
            Error::Cancelled => "cancelled",
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }
}

/// Lifecycle stage a [`Error::TransferFailed`] occurred in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStage {
    /// Creating the batch container
    Create,
    /// Registering a file in the batch
    Register,
    /// Uploading a single block
    Upload,
    /// Committing a file's block list
    CommitBlocks,
    /// Committing the batch
    CommitBatch,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Create => "create batch",
            TransferStage::Register => "register file",
            TransferStage::Upload => "upload block",
            TransferStage::CommitBlocks => "commit block list",
            TransferStage::CommitBatch => "commit batch",
        };
        f.write_str(name)
    }
}

/// Identifiers attached to a [`Error::TransferFailed`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferTarget {
    /// Batch the call was addressed to (absent when creating the batch)
    pub batch_id: Option<BatchId>,
    /// File within the batch
    pub file_name: Option<String>,
    /// Block within the file
    pub block_id: Option<BlockId>,
}

impl TransferTarget {
    /// Target of a batch-level call
    pub fn batch(batch_id: &BatchId) -> Self {
        Self {
            batch_id: Some(batch_id.clone()),
            ..Self::default()
        }
    }

    /// Target of a file-level call
    pub fn file(batch_id: &BatchId, file_name: &str) -> Self {
        Self {
            batch_id: Some(batch_id.clone()),
            file_name: Some(file_name.to_string()),
            block_id: None,
        }
    }

    /// Target of a block upload
    pub fn block(batch_id: &BatchId, file_name: &str, block_id: &BlockId) -> Self {
        Self {
            batch_id: Some(batch_id.clone()),
            file_name: Some(file_name.to_string()),
            block_id: Some(block_id.clone()),
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.batch_id {
            Some(id) => write!(f, "batch {id}")?,
            None => f.write_str("new batch")?,
        }
        if let Some(name) = &self.file_name {
            write!(f, " file {name}")?;
        }
        if let Some(block) = &self.block_id {
            write!(f, " block {block}")?;
        }
        Ok(())
    }
}
