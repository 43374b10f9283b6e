//! reqwest implementation of the batch service wire protocol.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{BatchTransport, BlockPayload, RangeRequest, RangedResponse};
use crate::auth::TokenSupplier;
use crate::config::ServiceConfig;
use crate::context::TransferContext;
use crate::error::{Error, Result, TransferStage, TransferTarget};
use crate::types::{Attribute, BatchDescriptor, BatchId, BlockId, FileDescriptor, FileHash};

/// Header carrying the correlation id of the calling operation
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

const CONTENT_SIZE_HEADER: &str = "X-Content-Size";
const MIME_TYPE_HEADER: &str = "X-MIME-Type";
const CONTENT_MD5_HEADER: &str = "Content-MD5";

/// Longest slice of an error body kept in error messages
const MAX_ERROR_BODY: usize = 512;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBatchResponse {
    batch_id: String,
}

#[derive(Deserialize)]
struct BatchStatusResponse {
    status: String,
}

#[derive(Serialize)]
struct RegisterFileBody<'a> {
    attributes: &'a [Attribute],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitBlockListBody<'a> {
    block_ids: &'a [BlockId],
}

/// HTTP transport for the batch service
///
/// Redirects are never followed automatically; the ranged download engine decides
/// what to do with a redirect location.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    auth_resource: String,
    tokens: Arc<dyn TokenSupplier>,
}

impl HttpTransport {
    /// Build a transport from service settings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be constructed.
    pub fn new(config: &ServiceConfig, tokens: Arc<dyn TokenSupplier>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to build HTTP client: {e}"),
                key: None,
            })?;
        Ok(Self::with_client(
            client,
            &config.base_url,
            &config.auth_resource,
            tokens,
        ))
    }

    /// Use a preconfigured client
    ///
    /// The client must not follow redirects on its own or the redirect handling of
    /// ranged downloads is bypassed.
    pub fn with_client(
        client: Client,
        base_url: &str,
        auth_resource: &str,
        tokens: Arc<dyn TokenSupplier>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_resource: auth_resource.to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn file_path(batch_id: &BatchId, file_name: &str) -> String {
        format!(
            "/batch/{}/files/{}",
            urlencoding::encode(batch_id.as_str()),
            urlencoding::encode(file_name)
        )
    }

    fn resolve_uri(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else if uri.starts_with('/') {
            self.url(uri)
        } else {
            format!("{}/{}", self.base_url, uri)
        }
    }

    /// Attach bearer token and correlation id
    async fn authorized(
        &self,
        ctx: &TransferContext,
        request: RequestBuilder,
    ) -> Result<RequestBuilder> {
        let token = self.tokens.bearer_token(&self.auth_resource).await?;
        Ok(Self::correlated(ctx, request).bearer_auth(token))
    }

    fn correlated(ctx: &TransferContext, request: RequestBuilder) -> RequestBuilder {
        request.header(CORRELATION_ID_HEADER, ctx.correlation_id().as_str())
    }

    /// Send a lifecycle request, mapping transport errors and non-2xx responses
    async fn send_stage(
        &self,
        request: RequestBuilder,
        stage: TransferStage,
        target: impl Fn() -> TransferTarget,
    ) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::transfer(stage, target(), None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = error_body(response).await;
            return Err(Error::transfer(stage, target(), Some(status.as_u16()), reason));
        }
        Ok(response)
    }
}

async fn error_body(response: Response) -> String {
    let status = response.status();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        body
    }
}

#[async_trait]
impl BatchTransport for HttpTransport {
    async fn create_batch(
        &self,
        ctx: &TransferContext,
        descriptor: &BatchDescriptor,
    ) -> Result<BatchId> {
        let request = self
            .authorized(ctx, self.client.post(self.url("/batch")).json(descriptor))
            .await?;
        let response = self
            .send_stage(request, TransferStage::Create, TransferTarget::default)
            .await?;

        let status = response.status().as_u16();
        let body: CreateBatchResponse = response.json().await.map_err(|e| {
            Error::transfer(
                TransferStage::Create,
                TransferTarget::default(),
                Some(status),
                format!("invalid create batch response: {e}"),
            )
        })?;

        tracing::debug!(
            batch_id = %body.batch_id,
            correlation_id = %ctx.correlation_id(),
            "Batch created"
        );
        Ok(BatchId::new(body.batch_id))
    }

    async fn register_file(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file: &FileDescriptor,
    ) -> Result<()> {
        let request = self
            .client
            .post(self.url(&Self::file_path(batch_id, &file.name)))
            .header(CONTENT_SIZE_HEADER, file.length)
            .header(MIME_TYPE_HEADER, file.mime_type.as_str())
            .json(&RegisterFileBody {
                attributes: &file.attributes,
            });
        let request = self.authorized(ctx, request).await?;
        self.send_stage(request, TransferStage::Register, || {
            TransferTarget::file(batch_id, &file.name)
        })
        .await?;

        tracing::debug!(batch_id = %batch_id, file_name = %file.name, length = file.length, "File registered");
        Ok(())
    }

    async fn upload_block(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block: &BlockPayload,
    ) -> Result<()> {
        let path = format!(
            "{}/{}",
            Self::file_path(batch_id, file_name),
            block.block_id
        );
        let request = self
            .client
            .put(self.url(&path))
            .header(CONTENT_MD5_HEADER, block.content_md5.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(block.content.clone());
        let request = self.authorized(ctx, request).await?;
        self.send_stage(request, TransferStage::Upload, || {
            TransferTarget::block(batch_id, file_name, &block.block_id)
        })
        .await?;

        tracing::debug!(
            batch_id = %batch_id,
            file_name,
            block_id = %block.block_id,
            bytes = block.content.len(),
            "Block uploaded"
        );
        Ok(())
    }

    async fn commit_block_list(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        file_name: &str,
        block_ids: &[BlockId],
    ) -> Result<()> {
        let request = self
            .client
            .put(self.url(&Self::file_path(batch_id, file_name)))
            .json(&CommitBlockListBody { block_ids });
        let request = self.authorized(ctx, request).await?;
        self.send_stage(request, TransferStage::CommitBlocks, || {
            TransferTarget::file(batch_id, file_name)
        })
        .await?;
        Ok(())
    }

    async fn commit_batch(
        &self,
        ctx: &TransferContext,
        batch_id: &BatchId,
        files: &[FileHash],
    ) -> Result<()> {
        let path = format!("/batch/{}", urlencoding::encode(batch_id.as_str()));
        let request = self.client.put(self.url(&path)).json(files);
        let request = self.authorized(ctx, request).await?;
        self.send_stage(request, TransferStage::CommitBatch, || {
            TransferTarget::batch(batch_id)
        })
        .await?;
        Ok(())
    }

    async fn get_status(&self, ctx: &TransferContext, batch_id: &BatchId) -> Result<String> {
        let path = format!("/batch/{}/status", urlencoding::encode(batch_id.as_str()));
        let request = self.authorized(ctx, self.client.get(self.url(&path))).await?;

        let poll_failed = |status: Option<u16>, reason: String| Error::PollRequestFailed {
            batch_id: batch_id.clone(),
            status,
            reason,
        };

        let response = request
            .send()
            .await
            .map_err(|e| poll_failed(None, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let reason = error_body(response).await;
            return Err(poll_failed(Some(status.as_u16()), reason));
        }

        let body: BatchStatusResponse = response.json().await.map_err(|e| {
            poll_failed(
                Some(status.as_u16()),
                format!("invalid status response: {e}"),
            )
        })?;
        Ok(body.status)
    }

    async fn ranged_get(
        &self,
        ctx: &TransferContext,
        request: RangeRequest<'_>,
    ) -> Result<RangedResponse> {
        let url = self.resolve_uri(request.uri);
        let builder = self
            .client
            .get(&url)
            .header(RANGE, request.range.header_value());
        let builder = if request.authorize {
            self.authorized(ctx, builder).await?
        } else {
            Self::correlated(ctx, builder)
        };

        let download_failed = |status: Option<u16>, reason: String| Error::DownloadFailed {
            file_name: request.file_name.to_string(),
            status,
            reason,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| download_failed(None, e.to_string()))?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    download_failed(Some(status.as_u16()), "redirect without Location".into())
                })?;
            // Relative locations are resolved against the request URL
            let target = url::Url::parse(&url)
                .and_then(|base| base.join(location))
                .map_err(|e| {
                    download_failed(
                        Some(status.as_u16()),
                        format!("invalid redirect location '{location}': {e}"),
                    )
                })?;
            return Ok(RangedResponse::Redirect(target.to_string()));
        }

        if !status.is_success() {
            let reason = error_body(response).await;
            return Err(download_failed(Some(status.as_u16()), reason));
        }

        let content = response
            .bytes()
            .await
            .map_err(|e| download_failed(Some(status.as_u16()), e.to_string()))?;
        Ok(RangedResponse::Content(content))
    }
}
