//! Chunked block upload.
//!
//! A file is split into fixed-size blocks ([`plan_blocks`]), each block is hashed and
//! uploaded on its own, and the block list is committed once every block has landed.
//! Uploads run in gated groups of at most `max_parallel_blocks`: a group is spawned,
//! joined completely, and only then is the next group admitted.

mod source;

pub use source::{BlockSource, FileBlockSource, MemoryBlockSource, content_hash, md5_base64};

use std::sync::Arc;
use tokio::task::JoinSet;

use crate::config::UploadConfig;
use crate::context::TransferContext;
use crate::error::{Error, Result, TransferStage, TransferTarget};
use crate::transport::{BatchTransport, BlockPayload};
use crate::types::{BatchId, Block, BlockId, FileHash};

/// Split `[0, len)` into consecutive blocks of `block_size` bytes, the last one shorter
///
/// Blocks are numbered from 1 and never overlap; their lengths sum to `len`. An empty
/// file yields no blocks.
pub fn plan_blocks(len: u64, block_size: u64) -> Vec<Block> {
    let block_size = block_size.max(1);
    let count = len.div_ceil(block_size);
    (0..count)
        .map(|index| {
            let offset = index * block_size;
            let ordinal = (index + 1) as u32;
            Block {
                ordinal,
                id: BlockId::from_ordinal(ordinal),
                offset,
                length: block_size.min(len - offset),
            }
        })
        .collect()
}

/// Result of uploading and committing one file's blocks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedFile {
    /// Whole-file hash to submit with the batch commit
    pub file_hash: FileHash,
    /// Number of blocks committed
    pub block_count: usize,
}

/// Uploads registered files block by block
#[derive(Clone)]
pub struct ChunkedUploadEngine {
    transport: Arc<dyn BatchTransport>,
    block_size: u64,
    parallelism: usize,
}

impl ChunkedUploadEngine {
    /// Create an engine; block size and parallelism are resolved from `config`
    pub fn new(transport: Arc<dyn BatchTransport>, config: &UploadConfig) -> Self {
        Self {
            transport,
            block_size: config.block_size_bytes(),
            parallelism: config.parallelism(),
        }
    }

    /// Effective block size in bytes
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Maximum block uploads in flight
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Upload every block of `source` and commit the ordinal-sorted block list
    ///
    /// The file must already be registered in the batch. The first failing block
    /// aborts the remaining uploads and no block list is committed. Blocks that did
    /// land are left for the service to expire with the batch.
    pub async fn upload(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        source: Arc<dyn BlockSource>,
    ) -> Result<UploadedFile> {
        ctx.ensure_active()?;

        let hash = content_hash(source.as_ref()).await?;
        let plan = plan_blocks(source.len(), self.block_size);
        let block_count = plan.len();

        tracing::debug!(
            batch_id = %batch_id,
            file_name,
            length = source.len(),
            block_size = self.block_size,
            blocks = block_count,
            parallelism = self.parallelism,
            "Starting chunked upload"
        );

        let file_name_shared: Arc<str> = Arc::from(file_name);
        let mut uploaded: Vec<Block> = Vec::with_capacity(block_count);

        for group in plan.chunks(self.parallelism) {
            // Stop admitting groups once cancelled
            ctx.ensure_active()?;

            let mut tasks = JoinSet::new();
            for block in group {
                tasks.spawn(upload_one(
                    Arc::clone(&self.transport),
                    ctx.clone(),
                    batch_id.clone(),
                    Arc::clone(&file_name_shared),
                    Arc::clone(&source),
                    block.clone(),
                ));
            }

            loop {
                let joined = tokio::select! {
                    _ = ctx.cancel_token().cancelled() => {
                        tasks.abort_all();
                        return Err(Error::Cancelled);
                    }
                    joined = tasks.join_next() => joined,
                };
                let Some(joined) = joined else { break };

                match joined {
                    Ok(Ok(block)) => uploaded.push(block),
                    Ok(Err(e)) => {
                        tasks.abort_all();
                        tracing::error!(
                            batch_id = %batch_id,
                            file_name,
                            error = %e,
                            "Block upload failed, abandoning file"
                        );
                        return Err(e);
                    }
                    Err(join_error) => {
                        tasks.abort_all();
                        return Err(Error::transfer(
                            TransferStage::Upload,
                            TransferTarget::file(batch_id, file_name),
                            None,
                            format!("block upload task failed: {join_error}"),
                        ));
                    }
                }
            }
        }

        // Completion order is arbitrary; the service assembles blocks in list order
        uploaded.sort_by_key(|block| block.ordinal);
        let block_ids: Vec<BlockId> = uploaded.into_iter().map(|block| block.id).collect();

        self.transport
            .commit_block_list(ctx, batch_id, file_name, &block_ids)
            .await?;

        tracing::info!(
            batch_id = %batch_id,
            file_name,
            blocks = block_count,
            "File blocks committed"
        );

        Ok(UploadedFile {
            file_hash: FileHash {
                filename: file_name.to_string(),
                hash,
            },
            block_count,
        })
    }
}

async fn upload_one(
    transport: Arc<dyn BatchTransport>,
    ctx: TransferContext,
    batch_id: BatchId,
    file_name: Arc<str>,
    source: Arc<dyn BlockSource>,
    block: Block,
) -> Result<Block> {
    let content = source.read_range(block.offset, block.length).await?;
    let payload = BlockPayload {
        block_id: block.id.clone(),
        content_md5: md5_base64(&content),
        content,
    };
    transport
        .upload_block(&ctx, &batch_id, &file_name, &payload)
        .await?;

    tracing::debug!(
        batch_id = %batch_id,
        file_name = %file_name,
        block_id = %block.id,
        offset = block.offset,
        length = block.length,
        "Block uploaded"
    );
    Ok(block)
}
