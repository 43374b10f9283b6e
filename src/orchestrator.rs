//! Batch lifecycle orchestration.
//!
//! [`BatchLifecycle::submit`] drives one logical batch end to end:
//!
//! 1. create the batch container
//! 2. per file: register it, upload its blocks, commit its block list
//! 3. commit the batch with one content hash per file
//! 4. optionally poll until the service reports a terminal status
//!
//! The first failing stage aborts everything after it. Nothing is retried or salvaged
//! here; a failed batch is simply never committed and expires on the service side.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::{CachedTokenSupplier, TokenSource, TokenSupplier};
use crate::config::{Config, PollProfile};
use crate::context::TransferContext;
use crate::download::RangeDownloadEngine;
use crate::error::{Error, Result, TransferStage, TransferTarget};
use crate::poller::BatchStatusPoller;
use crate::transport::{BatchTransport, HttpTransport, RetryingTransport};
use crate::types::{
    Attribute, BatchDescriptor, BatchId, BatchStatus, FileDescriptor, FileHash, TransferEvent,
};
use crate::upload::{BlockSource, ChunkedUploadEngine, FileBlockSource};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A file to add to a batch together with its content
#[derive(Clone)]
pub struct BatchFile {
    /// Metadata registered with the service
    pub descriptor: FileDescriptor,
    /// Content uploaded block by block
    pub source: Arc<dyn BlockSource>,
}

impl BatchFile {
    /// File whose declared length is taken from its source
    pub fn new(name: impl Into<String>, source: Arc<dyn BlockSource>) -> Self {
        Self {
            descriptor: FileDescriptor::new(name, source.len()),
            source,
        }
    }

    /// Open a file on disk, named after its final path component
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                ))
            })?;
        let source = FileBlockSource::open(path).await?;
        Ok(Self::new(name, Arc::new(source)))
    }

    /// Override the MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.descriptor.mime_type = mime_type.into();
        self
    }

    /// Add a file attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.descriptor.attributes.push(Attribute::new(key, value));
        self
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Everything needed to create, fill and commit one batch
#[derive(Clone)]
pub struct BatchSubmission {
    /// Batch metadata
    pub descriptor: BatchDescriptor,
    /// Files in upload order
    pub files: Vec<BatchFile>,
    /// Poll after committing until a terminal status, using this profile
    pub await_commit: Option<PollProfile>,
}

impl BatchSubmission {
    /// Submission without files or polling
    pub fn new(descriptor: BatchDescriptor) -> Self {
        Self {
            descriptor,
            files: Vec::new(),
            await_commit: None,
        }
    }

    /// Append a file
    pub fn with_file(mut self, file: BatchFile) -> Self {
        self.files.push(file);
        self
    }

    /// Wait for the commit to finish using `profile`
    pub fn awaiting_commit(mut self, profile: PollProfile) -> Self {
        self.await_commit = Some(profile);
        self
    }
}

/// Outcome of a successful submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReceipt {
    /// Id assigned by the service
    pub batch_id: BatchId,
    /// Content hashes submitted with the batch commit
    pub file_hashes: Vec<FileHash>,
    /// Terminal status, when polling was requested
    pub final_status: Option<BatchStatus>,
}

/// Top-level driver composing transport, upload engine and poller
pub struct BatchLifecycle {
    transport: Arc<dyn BatchTransport>,
    uploader: ChunkedUploadEngine,
    downloader: RangeDownloadEngine,
    poller: BatchStatusPoller,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl BatchLifecycle {
    /// Compose the lifecycle over an existing transport
    pub fn new(transport: Arc<dyn BatchTransport>, config: &Config) -> Self {
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            uploader: ChunkedUploadEngine::new(Arc::clone(&transport), &config.upload),
            downloader: RangeDownloadEngine::new(Arc::clone(&transport), &config.download),
            poller: BatchStatusPoller::new(Arc::clone(&transport)),
            transport,
            event_tx,
        }
    }

    /// Validate `config` and wire an HTTP transport to the configured service
    ///
    /// The transport is wrapped in a [`RetryingTransport`] unless
    /// `retry.max_attempts` is zero. Batch creation is never retried.
    pub fn connect(config: &Config, tokens: Arc<dyn TokenSupplier>) -> Result<Self> {
        config.validate()?;
        let http = HttpTransport::new(&config.service, tokens)?;
        let transport: Arc<dyn BatchTransport> = if config.retry.max_attempts > 0 {
            Arc::new(RetryingTransport::new(http, config.retry.clone()))
        } else {
            Arc::new(http)
        };
        Ok(Self::new(transport, config))
    }

    /// Like [`connect`](Self::connect), minting tokens from `source` through a
    /// [`CachedTokenSupplier`] that renews them `service.token_refresh_margin`
    /// before they expire
    pub fn connect_with_source(config: &Config, source: Arc<dyn TokenSource>) -> Result<Self> {
        let tokens = CachedTokenSupplier::new(source, config.service.token_refresh_margin);
        Self::connect(config, Arc::new(tokens))
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Ranged download engine sharing this lifecycle's transport
    pub fn downloader(&self) -> &RangeDownloadEngine {
        &self.downloader
    }

    /// Poller sharing this lifecycle's transport
    pub fn poller(&self) -> &BatchStatusPoller {
        &self.poller
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }

    /// Create, fill and commit a batch
    ///
    /// # Errors
    ///
    /// The first failing stage aborts the submission and its error is returned
    /// unchanged. A batch the service reports as `Failed` after commit yields
    /// [`Error::BatchRejected`].
    pub async fn submit(
        &self,
        ctx: &TransferContext,
        submission: BatchSubmission,
    ) -> Result<BatchReceipt> {
        ctx.ensure_active()?;

        let batch_id = ctx
            .cancellable(self.transport.create_batch(ctx, &submission.descriptor))
            .await?;
        tracing::info!(
            batch_id = %batch_id,
            correlation_id = %ctx.correlation_id(),
            files = submission.files.len(),
            "Batch created"
        );
        self.emit(TransferEvent::BatchCreated {
            batch_id: batch_id.clone(),
        });

        match self.fill_and_commit(ctx, &batch_id, submission).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                tracing::error!(
                    batch_id = %batch_id,
                    correlation_id = %ctx.correlation_id(),
                    error = %e,
                    code = e.error_code(),
                    "Batch submission aborted"
                );
                Err(e)
            }
        }
    }

    async fn fill_and_commit(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        submission: BatchSubmission,
    ) -> Result<BatchReceipt> {
        let mut file_hashes = Vec::with_capacity(submission.files.len());

        for file in &submission.files {
            ctx.ensure_active()?;

            let source_len = file.source.len();
            if file.descriptor.length != source_len {
                return Err(Error::transfer(
                    TransferStage::Register,
                    TransferTarget::file(batch_id, file.name()),
                    None,
                    format!(
                        "declared length {} does not match content length {source_len}",
                        file.descriptor.length
                    ),
                ));
            }

            ctx.cancellable(self.transport.register_file(ctx, batch_id, &file.descriptor))
                .await?;
            self.emit(TransferEvent::FileRegistered {
                batch_id: batch_id.clone(),
                file_name: file.name().to_string(),
            });

            let uploaded = self
                .uploader
                .upload(ctx, batch_id, file.name(), Arc::clone(&file.source))
                .await?;
            self.emit(TransferEvent::FileUploaded {
                batch_id: batch_id.clone(),
                file_name: file.name().to_string(),
                blocks: uploaded.block_count,
            });
            file_hashes.push(uploaded.file_hash);
        }

        ctx.ensure_active()?;
        ctx.cancellable(self.transport.commit_batch(ctx, batch_id, &file_hashes))
            .await?;
        tracing::info!(batch_id = %batch_id, files = file_hashes.len(), "Batch committed");
        self.emit(TransferEvent::BatchCommitted {
            batch_id: batch_id.clone(),
        });

        let final_status = match submission.await_commit {
            Some(profile) => {
                let status = self.poller.await_terminal(ctx, batch_id, profile).await?;
                self.emit(TransferEvent::BatchFinished {
                    batch_id: batch_id.clone(),
                    status,
                });
                if status == BatchStatus::Failed {
                    return Err(Error::BatchRejected {
                        batch_id: batch_id.clone(),
                    });
                }
                Some(status)
            }
            None => None,
        };

        Ok(BatchReceipt {
            batch_id: batch_id.clone(),
            file_hashes,
            final_status,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Call, MockTransport, StatusReply};
    use crate::upload::{MemoryBlockSource, md5_base64};
    use std::time::Duration;

    fn config() -> Config {
        let mut config = Config::for_service("https://files.example.com");
        config.upload.block_size_kib = Some(1);
        config
    }

    fn file(name: &str, len: usize) -> BatchFile {
        let data: Vec<u8> = (0..len).map(|i| (i % 13) as u8).collect();
        BatchFile::new(name, Arc::new(MemoryBlockSource::new(data)))
    }

    fn submission() -> BatchSubmission {
        BatchSubmission::new(BatchDescriptor::new("Logistics"))
            .with_file(file("a.bin", 2048))
            .with_file(file("b.bin", 100))
    }

    fn quick_poll() -> PollProfile {
        PollProfile::new(Duration::from_secs(60), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn stages_run_in_lifecycle_order() {
        let transport = Arc::new(MockTransport::new());
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let receipt = lifecycle
            .submit(&TransferContext::new(), submission())
            .await
            .unwrap();

        let stages: Vec<&'static str> = transport
            .calls()
            .iter()
            .map(|c| match c {
                Call::CreateBatch => "create",
                Call::RegisterFile { .. } => "register",
                Call::UploadBlock { .. } => "upload",
                Call::CommitBlockList { .. } => "commit-blocks",
                Call::CommitBatch { .. } => "commit-batch",
                Call::GetStatus => "status",
                Call::RangedGet { .. } => "get",
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                "create",
                "register",
                "upload",
                "upload",
                "commit-blocks",
                "register",
                "upload",
                "commit-blocks",
                "commit-batch"
            ]
        );
        assert_eq!(receipt.batch_id, BatchId::from("batch-1"));
        assert_eq!(receipt.final_status, None);
    }

    #[tokio::test]
    async fn batch_commit_carries_one_hash_per_file() {
        let transport = Arc::new(MockTransport::new());
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let receipt = lifecycle
            .submit(&TransferContext::new(), submission())
            .await
            .unwrap();

        let committed = transport
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::CommitBatch { files } => Some(files),
                _ => None,
            })
            .unwrap();
        let expected_a: Vec<u8> = (0..2048).map(|i| (i % 13) as u8).collect();
        assert_eq!(committed, receipt.file_hashes);
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].filename, "a.bin");
        assert_eq!(committed[0].hash, md5_base64(&expected_a));
        assert_eq!(committed[1].filename, "b.bin");
    }

    #[tokio::test]
    async fn failed_block_upload_stops_the_batch() {
        let transport = Arc::new(MockTransport::new().failing_block(2, 401));
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let err = lifecycle
            .submit(&TransferContext::new(), submission())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransferFailed { stage: TransferStage::Upload, .. }));
        let calls = transport.calls();
        assert!(!calls.iter().any(|c| matches!(c, Call::CommitBlockList { .. })));
        assert!(!calls.iter().any(|c| matches!(c, Call::CommitBatch { .. })));
        assert!(
            !calls
                .iter()
                .any(|c| matches!(c, Call::RegisterFile { file_name } if file_name == "b.bin")),
            "second file must not be registered"
        );
    }

    #[tokio::test]
    async fn create_failure_aborts_before_any_file_work() {
        let transport = Arc::new(MockTransport::new().failing_stage(TransferStage::Create, 503));
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let err = lifecycle
            .submit(&TransferContext::new(), submission())
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "create_failed");
        assert_eq!(transport.calls(), vec![Call::CreateBatch]);
    }

    #[tokio::test]
    async fn register_failure_uploads_and_commits_nothing() {
        let transport = Arc::new(MockTransport::new().failing_stage(TransferStage::Register, 409));
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let err = lifecycle
            .submit(&TransferContext::new(), submission())
            .await
            .unwrap_err();

        match err {
            Error::TransferFailed { stage, target, status, .. } => {
                assert_eq!(stage, TransferStage::Register);
                assert_eq!(status, Some(409));
                assert_eq!(target.file_name.as_deref(), Some("a.bin"));
            }
            other => panic!("expected TransferFailed, got {other:?}"),
        }
        assert_eq!(
            transport.calls(),
            vec![
                Call::CreateBatch,
                Call::RegisterFile {
                    file_name: "a.bin".into()
                }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn commit_batch_failure_is_never_reported_as_committed() {
        let transport = Arc::new(
            MockTransport::new()
                .failing_stage(TransferStage::CommitBatch, 500)
                .with_statuses([StatusReply::Status("Committed")]),
        );
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());
        let mut events = lifecycle.subscribe();

        let err = lifecycle
            .submit(&TransferContext::new(), submission().awaiting_commit(quick_poll()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::TransferFailed {
                stage: TransferStage::CommitBatch,
                status: Some(500),
                ..
            }
        ));
        assert_eq!(transport.status_calls(), 0);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(
            !received.iter().any(|e| matches!(
                e,
                TransferEvent::BatchCommitted { .. } | TransferEvent::BatchFinished { .. }
            )),
            "unexpected events: {received:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_batch_commit_returns_promptly() {
        let transport = Arc::new(
            MockTransport::new().delaying_stage(TransferStage::CommitBatch, Duration::from_secs(3600)),
        );
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());
        let mut events = lifecycle.subscribe();
        let ctx = TransferContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = lifecycle.submit(&ctx, submission()).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransferEvent::BatchCommitted { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_create_returns_promptly() {
        let transport = Arc::new(
            MockTransport::new().delaying_stage(TransferStage::Create, Duration::from_secs(3600)),
        );
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());
        let ctx = TransferContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = lifecycle.submit(&ctx, submission()).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(transport.calls(), vec![Call::CreateBatch]);
    }

    #[tokio::test]
    async fn mismatched_declared_length_is_rejected_before_register() {
        let transport = Arc::new(MockTransport::new());
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());
        let mut bad = file("a.bin", 10);
        bad.descriptor.length = 11;

        let err = lifecycle
            .submit(
                &TransferContext::new(),
                BatchSubmission::new(BatchDescriptor::new("x")).with_file(bad),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransferFailed { stage: TransferStage::Register, .. }));
        assert_eq!(transport.calls(), vec![Call::CreateBatch]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reports_committed_status() {
        let transport = Arc::new(MockTransport::new().with_statuses([
            StatusReply::Status("CommitInProgress"),
            StatusReply::Status("Committed"),
        ]));
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());
        let mut events = lifecycle.subscribe();

        let receipt = lifecycle
            .submit(&TransferContext::new(), submission().awaiting_commit(quick_poll()))
            .await
            .unwrap();

        assert_eq!(receipt.final_status, Some(BatchStatus::Committed));
        assert_eq!(transport.status_calls(), 2);

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received.first(),
            Some(&TransferEvent::BatchCreated {
                batch_id: BatchId::from("batch-1")
            })
        );
        assert_eq!(
            received.last(),
            Some(&TransferEvent::BatchFinished {
                batch_id: BatchId::from("batch-1"),
                status: BatchStatus::Committed
            })
        );
        assert!(received.contains(&TransferEvent::FileUploaded {
            batch_id: BatchId::from("batch-1"),
            file_name: "a.bin".into(),
            blocks: 2
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_is_a_rejection() {
        let transport =
            Arc::new(MockTransport::new().with_statuses([StatusReply::Status("Failed")]));
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let err = lifecycle
            .submit(&TransferContext::new(), submission().awaiting_commit(quick_poll()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BatchRejected { batch_id } if batch_id.as_str() == "batch-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_timeout_propagates() {
        let transport = Arc::new(MockTransport::new());
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());

        let err = lifecycle
            .submit(&TransferContext::new(), submission().awaiting_commit(quick_poll()))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "polling_timed_out");
    }

    #[tokio::test]
    async fn cancelled_context_creates_nothing() {
        let transport = Arc::new(MockTransport::new());
        let lifecycle = BatchLifecycle::new(transport.clone(), &config());
        let ctx = TransferContext::new();
        ctx.cancel();

        let err = lifecycle.submit(&ctx, submission()).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn file_from_path_uses_file_name_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.csv");
        std::fs::write(&path, b"id,name\n1,alpha\n").unwrap();

        let file = BatchFile::from_path(&path)
            .await
            .unwrap()
            .with_mime_type("text/csv")
            .with_attribute("Kind", "Manifest");

        assert_eq!(file.descriptor.name, "manifest.csv");
        assert_eq!(file.descriptor.length, 16);
        assert_eq!(file.descriptor.mime_type, "text/csv");
        assert_eq!(file.descriptor.attributes, vec![Attribute::new("Kind", "Manifest")]);
    }

    #[test]
    fn connect_with_source_rejects_invalid_config() {
        struct NoTokens;

        #[async_trait::async_trait]
        impl TokenSource for NoTokens {
            async fn fetch_token(&self, resource: &str) -> Result<crate::auth::AccessToken> {
                Err(Error::AuthFailure {
                    resource: resource.to_string(),
                    reason: "unused".into(),
                })
            }
        }

        let result = BatchLifecycle::connect_with_source(&Config::default(), Arc::new(NoTokens));
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[test]
    fn connect_rejects_invalid_config() {
        let tokens = Arc::new(crate::auth::StaticTokenSupplier::new("t"));
        let result = BatchLifecycle::connect(&Config::default(), tokens);
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
