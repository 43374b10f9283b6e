//! Core types for batch-transfer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Server-assigned opaque batch identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Create a new BatchId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BatchId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque value attached to every request of one logical operation for tracing
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh random correlation id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Batch status as reported by the service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Created, files still being added
    Incomplete,
    /// Commit accepted, service still finalizing
    CommitInProgress,
    /// Commit finished, batch retrievable
    Committed,
    /// Service gave up on the batch
    Failed,
}

impl BatchStatus {
    /// Parse a status string; unrecognized values are treated as `Incomplete`
    pub fn parse_lenient(status: &str) -> Self {
        status.parse().unwrap_or(BatchStatus::Incomplete)
    }

    /// Whether a poller should keep waiting on this status
    pub fn is_pending(&self) -> bool {
        matches!(self, BatchStatus::Incomplete | BatchStatus::CommitInProgress)
    }

    /// Wire representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Incomplete => "Incomplete",
            BatchStatus::CommitInProgress => "CommitInProgress",
            BatchStatus::Committed => "Committed",
            BatchStatus::Failed => "Failed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Incomplete" => Ok(BatchStatus::Incomplete),
            "CommitInProgress" => Ok(BatchStatus::CommitInProgress),
            "Committed" => Ok(BatchStatus::Committed),
            "Failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status '{other}'")),
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key/value attribute attached to a batch or a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name
    pub key: String,
    /// Attribute value
    pub value: String,
}

impl Attribute {
    /// Create a new attribute
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Read access granted on a batch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acl {
    /// Users allowed to read the batch
    #[serde(default)]
    pub read_users: Vec<String>,
    /// Groups allowed to read the batch
    #[serde(default)]
    pub read_groups: Vec<String>,
}

/// Everything the service needs to create a batch container
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDescriptor {
    /// Business unit owning the batch
    pub business_unit: String,
    /// When the service may garbage-collect the batch
    pub expiry_date: Option<DateTime<Utc>>,
    /// Read access
    pub acl: Acl,
    /// Searchable batch attributes
    pub attributes: Vec<Attribute>,
}

impl BatchDescriptor {
    /// Create a descriptor for a business unit with no ACL, expiry or attributes
    pub fn new(business_unit: impl Into<String>) -> Self {
        Self {
            business_unit: business_unit.into(),
            expiry_date: None,
            acl: Acl::default(),
            attributes: Vec::new(),
        }
    }
}

/// File metadata registered with a batch before its content is uploaded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDescriptor {
    /// File name within the batch
    pub name: String,
    /// Declared length in bytes
    pub length: u64,
    /// MIME type
    pub mime_type: String,
    /// File attributes
    pub attributes: Vec<Attribute>,
}

impl FileDescriptor {
    /// Descriptor with the generic binary MIME type and no attributes
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length,
            mime_type: "application/octet-stream".to_string(),
            attributes: Vec::new(),
        }
    }

    /// Override the MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

/// Block identifier: `Block_` followed by the 1-based ordinal zero-padded to 5 digits
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    const PREFIX: &'static str = "Block_";

    /// Build the id for a 1-based ordinal
    pub fn from_ordinal(ordinal: u32) -> Self {
        Self(format!("{}{:05}", Self::PREFIX, ordinal))
    }

    /// Recover the ordinal from the id, if it is well formed
    pub fn ordinal(&self) -> Option<u32> {
        self.0.strip_prefix(Self::PREFIX)?.parse().ok()
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One contiguous byte range of a file, uploaded independently
///
/// A block is a plan entry only. Its content hash is computed when the bytes are
/// read for upload and travels on [`BlockPayload`](crate::transport::BlockPayload)
/// as `content_md5`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// 1-based position within the file
    pub ordinal: u32,
    /// Block identifier derived from the ordinal
    pub id: BlockId,
    /// Offset of the first byte
    pub offset: u64,
    /// Number of bytes
    pub length: u64,
}

/// Per-file content hash submitted when committing a batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// File name within the batch
    pub filename: String,
    /// Base64-encoded MD5 of the whole file
    pub hash: String,
}

/// Inclusive byte range used in a `Range: bytes=start-end` header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte
    pub start: u64,
    /// Last byte (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a range covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the `Range` header
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Lifecycle events broadcast by the orchestrator
#[derive(Clone, Debug, PartialEq)]
pub enum TransferEvent {
    /// The batch container was created
    BatchCreated {
        /// New batch id
        batch_id: BatchId,
    },
    /// A file was registered in the batch
    FileRegistered {
        /// Batch id
        batch_id: BatchId,
        /// Registered file
        file_name: String,
    },
    /// All blocks of a file were uploaded and the block list committed
    FileUploaded {
        /// Batch id
        batch_id: BatchId,
        /// Uploaded file
        file_name: String,
        /// Number of blocks committed
        blocks: usize,
    },
    /// The batch commit was accepted
    BatchCommitted {
        /// Batch id
        batch_id: BatchId,
    },
    /// Polling observed a terminal status
    BatchFinished {
        /// Batch id
        batch_id: BatchId,
        /// Terminal status
        status: BatchStatus,
    },
}
