//! # batch-transfer
//!
//! Transfer core for a remote batch storage service that accepts files in
//! independently addressable blocks.
//!
//! ## Design Philosophy
//!
//! batch-transfer is designed to be:
//! - **Correct under concurrency** - blocks upload in parallel, the committed block list is always in ordinal order
//! - **Typed failures** - every error names its stage and the batch, file and block involved
//! - **Library-first** - no CLI, no global state; a [`TransferContext`] is passed to every call
//! - **Event-driven** - consumers subscribe to lifecycle events instead of polling the library
//!
//! Retrying transient HTTP failures is not part of the core. [`BatchLifecycle::connect`]
//! wraps the HTTP transport in a [`RetryingTransport`] unless retries are disabled.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use batch_transfer::{
//!     BatchDescriptor, BatchFile, BatchLifecycle, BatchSubmission, Config,
//!     StaticTokenSupplier, TransferContext,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::for_service("https://files.example.com/api");
//!     let lifecycle = BatchLifecycle::connect(&config, Arc::new(StaticTokenSupplier::new("token")))?;
//!
//!     // Subscribe to events
//!     let mut events = lifecycle.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let submission = BatchSubmission::new(BatchDescriptor::new("Logistics"))
//!         .with_file(BatchFile::from_path("manifest.csv").await?.with_mime_type("text/csv"))
//!         .awaiting_commit(config.poll_profile(None));
//!
//!     let receipt = lifecycle.submit(&TransferContext::new(), submission).await?;
//!     println!("batch {} finished as {:?}", receipt.batch_id, receipt.final_status);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bearer token supply
pub mod auth;
/// Configuration types
pub mod config;
/// Per-operation correlation and cancellation
pub mod context;
/// Ranged download engine
pub mod download;
/// Error types
pub mod error;
/// Batch lifecycle orchestration
pub mod orchestrator;
/// Batch status polling
pub mod poller;
/// Retry logic with exponential backoff
pub mod retry;
/// Batch service transports
pub mod transport;
/// Core types and events
pub mod types;
/// Chunked block upload engine
pub mod upload;

// Re-export commonly used types
pub use auth::{AccessToken, CachedTokenSupplier, StaticTokenSupplier, TokenSource, TokenSupplier};
pub use config::{Config, PollProfile};
pub use context::TransferContext;
pub use download::RangeDownloadEngine;
pub use error::{Error, Result, TransferStage, TransferTarget};
pub use orchestrator::{BatchFile, BatchLifecycle, BatchReceipt, BatchSubmission};
pub use poller::BatchStatusPoller;
pub use transport::{BatchTransport, HttpTransport, RetryingTransport};
pub use types::{
    Attribute, BatchDescriptor, BatchId, BatchStatus, BlockId, CorrelationId, FileDescriptor,
    FileHash, TransferEvent,
};
pub use upload::{BlockSource, ChunkedUploadEngine, FileBlockSource, MemoryBlockSource};
