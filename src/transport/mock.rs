//! Scriptable in-memory transport for unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BatchTransport, BlockPayload, RangeRequest, RangedResponse};
use crate::context::TransferContext;
use crate::error::{Error, Result, TransferStage, TransferTarget};
use crate::types::{BatchDescriptor, BatchId, BlockId, ByteRange, FileDescriptor, FileHash};

/// A call observed by [`MockTransport`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    CreateBatch,
    RegisterFile {
        file_name: String,
    },
    UploadBlock {
        file_name: String,
        block_id: BlockId,
        content_md5: String,
        len: usize,
    },
    CommitBlockList {
        file_name: String,
        block_ids: Vec<BlockId>,
    },
    CommitBatch {
        files: Vec<FileHash>,
    },
    GetStatus,
    RangedGet {
        uri: String,
        range: ByteRange,
        authorize: bool,
    },
}

/// Start or finish of one block upload, in the order they happened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockEvent {
    Started(u32),
    Finished(u32),
}

/// Scripted answer to a status request
#[derive(Clone, Copy, Debug)]
pub(crate) enum StatusReply {
    Status(&'static str),
    Fail(u16),
}

#[derive(Default)]
pub(crate) struct MockTransport {
    calls: Mutex<Vec<Call>>,
    /// Artificial latency per block ordinal
    block_delays: HashMap<u32, Duration>,
    /// Fail the upload of this block ordinal with this status
    failing_block: Option<(u32, u16)>,
    /// Fail a whole lifecycle stage with this status
    failing_stage: Option<(TransferStage, u16)>,
    /// Hold a lifecycle stage for this long before answering
    stage_delay: Option<(TransferStage, Duration)>,
    block_events: Mutex<Vec<BlockEvent>>,
    statuses: Mutex<VecDeque<StatusReply>>,
    /// Remote file served by ranged GETs
    content: Bytes,
    /// Ranged GET call index (0-based) -> redirect location
    redirects: HashMap<usize, String>,
    /// Ranged GET call index (0-based) -> failure status
    range_failures: HashMap<usize, u16>,
    ranged_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_block_delay(mut self, ordinal: u32, delay: Duration) -> Self {
        self.block_delays.insert(ordinal, delay);
        self
    }

    pub(crate) fn failing_block(mut self, ordinal: u32, status: u16) -> Self {
        self.failing_block = Some((ordinal, status));
        self
    }

    pub(crate) fn failing_stage(mut self, stage: TransferStage, status: u16) -> Self {
        self.failing_stage = Some((stage, status));
        self
    }

    pub(crate) fn delaying_stage(mut self, stage: TransferStage, delay: Duration) -> Self {
        self.stage_delay = Some((stage, delay));
        self
    }

    pub(crate) fn with_statuses(self, replies: impl IntoIterator<Item = StatusReply>) -> Self {
        self.statuses.lock().unwrap().extend(replies);
        self
    }

    pub(crate) fn serving(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    pub(crate) fn redirect_on_call(mut self, index: usize, location: &str) -> Self {
        self.redirects.insert(index, location.to_string());
        self
    }

    pub(crate) fn fail_range_call(mut self, index: usize, status: u16) -> Self {
        self.range_failures.insert(index, status);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn block_events(&self) -> Vec<BlockEvent> {
        self.block_events.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::GetStatus))
            .count()
    }

    pub(crate) fn ranged_gets(&self) -> Vec<(String, ByteRange, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RangedGet {
                    uri,
                    range,
                    authorize,
                } => Some((uri, range, authorize)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn committed_block_lists(&self) -> Vec<Vec<BlockId>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CommitBlockList { block_ids, .. } => Some(block_ids),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn stage_pause(&self, stage: TransferStage) {
        if let Some((delayed, delay)) = self.stage_delay {
            if delayed == stage {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn stage_result(&self, stage: TransferStage, target: TransferTarget) -> Result<()> {
        match self.failing_stage {
            Some((failing, status)) if failing == stage => {
                Err(Error::transfer(stage, target, Some(status), "scripted failure"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BatchTransport for MockTransport {
    async fn create_batch(
        &self,
        _ctx: &TransferContext,
        _descriptor: &BatchDescriptor,
    ) -> Result<BatchId> {
        self.record(Call::CreateBatch);
        self.stage_pause(TransferStage::Create).await;
        self.stage_result(TransferStage::Create, TransferTarget::default())?;
        Ok(BatchId::from("batch-1"))
    }

    async fn register_file(
        &self,
        _ctx: &TransferContext,
        batch_id: &BatchId,
        file: &FileDescriptor,
    ) -> Result<()> {
        self.record(Call::RegisterFile {
            file_name: file.name.clone(),
        });
        self.stage_pause(TransferStage::Register).await;
        self.stage_result(
            TransferStage::Register,
            TransferTarget::file(batch_id, &file.name),
        )
    }

    async fn upload_block(
        &self,
        _ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block: &BlockPayload,
    ) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let ordinal = block.block_id.ordinal().unwrap_or_default();
        self.block_events
            .lock()
            .unwrap()
            .push(BlockEvent::Started(ordinal));
        if let Some(delay) = self.block_delays.get(&ordinal) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.block_events
            .lock()
            .unwrap()
            .push(BlockEvent::Finished(ordinal));

        self.record(Call::UploadBlock {
            file_name: file_name.to_string(),
            block_id: block.block_id.clone(),
            content_md5: block.content_md5.clone(),
            len: block.content.len(),
        });
        match self.failing_block {
            Some((failing, status)) if failing == ordinal => Err(Error::transfer(
                TransferStage::Upload,
                TransferTarget::block(batch_id, file_name, &block.block_id),
                Some(status),
                "scripted failure",
            )),
            _ => Ok(()),
        }
    }

    async fn commit_block_list(
        &self,
        _ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block_ids: &[BlockId],
    ) -> Result<()> {
        self.record(Call::CommitBlockList {
            file_name: file_name.to_string(),
            block_ids: block_ids.to_vec(),
        });
        self.stage_result(
            TransferStage::CommitBlocks,
            TransferTarget::file(batch_id, file_name),
        )
    }

    async fn commit_batch(
        &self,
        _ctx: &TransferContext,
        batch_id: &BatchId,
        files: &[FileHash],
    ) -> Result<()> {
        self.record(Call::CommitBatch {
            files: files.to_vec(),
        });
        self.stage_pause(TransferStage::CommitBatch).await;
        self.stage_result(TransferStage::CommitBatch, TransferTarget::batch(batch_id))
    }

    async fn get_status(&self, _ctx: &TransferContext, batch_id: &BatchId) -> Result<String> {
        self.record(Call::GetStatus);
        let reply = self.statuses.lock().unwrap().pop_front();
        match reply {
            Some(StatusReply::Status(status)) => Ok(status.to_string()),
            Some(StatusReply::Fail(status)) => Err(Error::PollRequestFailed {
                batch_id: batch_id.clone(),
                status: Some(status),
                reason: "scripted failure".into(),
            }),
            None => Ok("Incomplete".to_string()),
        }
    }

    async fn ranged_get(
        &self,
        _ctx: &TransferContext,
        request: RangeRequest<'_>,
    ) -> Result<RangedResponse> {
        self.record(Call::RangedGet {
            uri: request.uri.to_string(),
            range: request.range,
            authorize: request.authorize,
        });
        let index = self.ranged_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(location) = self.redirects.get(&index) {
            return Ok(RangedResponse::Redirect(location.clone()));
        }
        if let Some(status) = self.range_failures.get(&index) {
            return Err(Error::DownloadFailed {
                file_name: request.file_name.to_string(),
                status: Some(*status),
                reason: "scripted failure".into(),
            });
        }

        let start = request.range.start as usize;
        let end = (request.range.end as usize + 1).min(self.content.len());
        Ok(RangedResponse::Content(self.content.slice(start..end)))
    }
}
