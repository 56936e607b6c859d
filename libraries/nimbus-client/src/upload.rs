//! Chunked uploads.
//!
//! An [`UploadStream`] accepts bytes for a file of known size, cuts them
//! into fixed-size chunks and sends each chunk as soon as it is full. At
//! most one chunk is held in memory. Chunks are sent strictly in offset
//! order; a chunk that fails with a transport error is resent with the same
//! byte range after a backoff.

use crate::config::RetryPolicy;
use crate::error::{CloudError, Result};
use crate::http::{join_cloud_path, Decoded, RequestDescriptor, ResponseShape};
use crate::pipeline::RequestPipeline;
use crate::types::UploadReceipt;
use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Open,
    Completed,
    Aborted,
}

/// Byte range of one chunk within the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub len: u64,
    pub total: u64,
}

impl ChunkRange {
    /// Inclusive last byte of the range.
    pub fn end(&self) -> u64 {
        self.start + self.len.saturating_sub(1)
    }

    /// `Content-Range` header value, e.g. `bytes 0-3/10`.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end(), self.total)
    }
}

/// Wire shape of an upload.
///
/// Implementations only build descriptors; sending, retrying and ordering
/// are handled by [`UploadStream`].
pub trait UploadProtocol: Send + Sync {
    /// Request carrying one chunk.
    fn chunk_request(&self, path: &str, range: ChunkRange, chunk: Bytes)
        -> Result<RequestDescriptor>;

    /// Request that registers the finished file, if the service needs one.
    /// `last_ack` is the body of the last chunk acknowledgement.
    fn finalize_request(
        &self,
        path: &str,
        total: u64,
        last_ack: Option<&str>,
    ) -> Option<RequestDescriptor>;
}

/// `PUT {upload_url}/{path}` with a `Content-Range` header per chunk.
#[derive(Debug, Clone)]
pub struct RangedPutProtocol {
    upload_url: url::Url,
    finalize_endpoint: Option<String>,
}

impl RangedPutProtocol {
    pub fn new(upload_url: &str, finalize_endpoint: Option<String>) -> Result<Self> {
        Ok(Self {
            upload_url: crate::config::validate_url(upload_url)?,
            finalize_endpoint,
        })
    }
}

impl UploadProtocol for RangedPutProtocol {
    fn chunk_request(
        &self,
        path: &str,
        range: ChunkRange,
        chunk: Bytes,
    ) -> Result<RequestDescriptor> {
        Ok(RequestDescriptor::put(join_cloud_path(&self.upload_url, path)?.to_string())
            .header("content-range", range.content_range())
            .header("content-type", "application/octet-stream")
            .body(chunk)
            .expect(ResponseShape::Text))
    }

    fn finalize_request(
        &self,
        path: &str,
        total: u64,
        last_ack: Option<&str>,
    ) -> Option<RequestDescriptor> {
        let endpoint = self.finalize_endpoint.as_deref()?;
        let size = total.to_string();
        Some(
            RequestDescriptor::post(endpoint)
                .form([
                    ("home", path),
                    ("size", size.as_str()),
                    ("hash", last_ack.unwrap_or_default()),
                    ("conflict", "rename"),
                ])
                .expect(ResponseShape::Structured),
        )
    }
}

/// Progress of one upload.
#[derive(Debug)]
pub struct UploadSession {
    path: String,
    declared_size: u64,
    bytes_written: u64,
    acknowledged: u64,
    chunk_size: usize,
    buffer: BytesMut,
    attempt: u32,
    chunks: u64,
    state: UploadState,
}

impl UploadSession {
    fn new(path: String, declared_size: u64, chunk_size: usize) -> Self {
        let capacity = chunk_size.min(usize::try_from(declared_size).unwrap_or(usize::MAX));
        Self {
            path,
            declared_size,
            bytes_written: 0,
            acknowledged: 0,
            chunk_size,
            buffer: BytesMut::with_capacity(capacity),
            attempt: 0,
            chunks: 0,
            state: UploadState::Open,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    /// Bytes accepted by `write`, including the ones still buffered.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes the service has acknowledged.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Attempt number of the chunk currently being sent (0 when idle).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    fn release(&mut self, state: UploadState) {
        self.state = state;
        self.buffer = BytesMut::new();
        self.attempt = 0;
    }
}

/// Writable upload of a file with a size known up front.
pub struct UploadStream {
    pipeline: RequestPipeline,
    protocol: Arc<dyn UploadProtocol>,
    policy: RetryPolicy,
    session: UploadSession,
    last_ack: Option<String>,
    cancel: Option<CancellationToken>,
}

impl UploadStream {
    pub fn new(
        pipeline: RequestPipeline,
        protocol: Arc<dyn UploadProtocol>,
        path: impl Into<String>,
        declared_size: u64,
        chunk_size: usize,
        policy: RetryPolicy,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CloudError::InvalidRequest(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if policy.max_attempts == 0 {
            return Err(CloudError::InvalidRequest(
                "retry policy must allow at least one attempt".to_string(),
            ));
        }

        let path = path.into();
        debug!(path = %path, size = declared_size, chunk_size, "Opening upload stream");

        Ok(Self {
            pipeline,
            protocol,
            policy,
            session: UploadSession::new(path, declared_size, chunk_size),
            last_ack: None,
            cancel: None,
        })
    }

    /// Abort the upload with `Cancelled` once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn state(&self) -> UploadState {
        self.session.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.session.bytes_written
    }

    pub fn acknowledged(&self) -> u64 {
        self.session.acknowledged
    }

    /// Accept `data`, sending every chunk that fills up along the way.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let attempted = self.session.bytes_written + data.len() as u64;
        if attempted > self.session.declared_size {
            return Err(CloudError::SizeExceeded {
                declared: self.session.declared_size,
                attempted,
            });
        }

        let mut rest = data;
        while !rest.is_empty() {
            let room = self.session.chunk_size - self.session.buffer.len();
            let take = room.min(rest.len());
            self.session.buffer.extend_from_slice(&rest[..take]);
            self.session.bytes_written += take as u64;
            rest = &rest[take..];

            if self.session.buffer.len() == self.session.chunk_size {
                self.flush_chunk().await?;
            }
        }

        Ok(())
    }

    /// Feed the whole of `reader` into the stream. Returns the bytes read.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; self.session.chunk_size.min(64 * 1024)];
        let mut copied = 0u64;
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                return Ok(copied);
            }
            self.write(&buf[..read]).await?;
            copied += read as u64;
        }
    }

    /// Send the final partial chunk, run the finalize request if the
    /// protocol has one, and complete the session.
    pub async fn close(&mut self) -> Result<UploadReceipt> {
        self.ensure_open()?;

        if self.session.bytes_written != self.session.declared_size {
            let err = CloudError::SizeMismatch {
                declared: self.session.declared_size,
                written: self.session.bytes_written,
            };
            warn!(path = %self.session.path, error = %err, "Closing incomplete upload");
            self.session.release(UploadState::Aborted);
            return Err(err);
        }

        if !self.session.buffer.is_empty() {
            self.flush_chunk().await?;
        }

        let committed_path = self.finalize().await?;
        self.session.release(UploadState::Completed);

        info!(
            path = %self.session.path,
            size = self.session.declared_size,
            chunks = self.session.chunks,
            "Upload completed"
        );

        Ok(UploadReceipt {
            path: self.session.path.clone(),
            size: self.session.declared_size,
            chunks: self.session.chunks,
            last_ack: self.last_ack.clone(),
            committed_path,
        })
    }

    /// Drop buffered data and stop. Nothing is sent to the service.
    pub fn abort(&mut self) {
        if self.session.state == UploadState::Open {
            debug!(
                path = %self.session.path,
                acknowledged = self.session.acknowledged,
                "Upload aborted by caller"
            );
            self.session.release(UploadState::Aborted);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.session.state {
            UploadState::Open => Ok(()),
            _ => Err(CloudError::SessionClosed),
        }
    }

    /// Send the buffered bytes as one chunk.
    async fn flush_chunk(&mut self) -> Result<()> {
        let len = self.session.buffer.len();
        let chunk = self.session.buffer.split_to(len).freeze();
        let range = ChunkRange {
            start: self.session.acknowledged,
            len: len as u64,
            total: self.session.declared_size,
        };
        let descriptor =
            match self
                .protocol
                .chunk_request(&self.session.path, range, chunk)
            {
                Ok(descriptor) => descriptor,
                Err(err) => return Err(self.fail(err)),
            };

        let mut attempt = 1;
        loop {
            self.session.attempt = attempt;

            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() && self.cancellable(tokio::time::sleep(delay)).await.is_none() {
                return Err(self.cancelled());
            }

            debug!(
                path = %self.session.path,
                range = %range.content_range(),
                attempt,
                "Sending chunk"
            );

            let outcome = match self.cancellable(self.pipeline.execute(&descriptor)).await {
                Some(outcome) => outcome,
                None => return Err(self.cancelled()),
            };

            match outcome {
                Ok(ack) => {
                    self.session.acknowledged += range.len;
                    self.session.chunks += 1;
                    self.session.attempt = 0;
                    self.last_ack = acknowledgement(ack);
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    warn!(
                        path = %self.session.path,
                        range = %range.content_range(),
                        attempt,
                        error = %err,
                        "Chunk failed, retrying"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    async fn finalize(&mut self) -> Result<Option<String>> {
        let Some(descriptor) = self.protocol.finalize_request(
            &self.session.path,
            self.session.declared_size,
            self.last_ack.as_deref(),
        ) else {
            return Ok(None);
        };

        debug!(path = %self.session.path, "Finalizing upload");
        match self.cancellable(self.pipeline.execute(&descriptor)).await {
            Some(Ok(decoded)) => Ok(committed_path(decoded)),
            Some(Err(err)) => Err(self.fail(err)),
            None => Err(self.cancelled()),
        }
    }

    /// Run `future` unless the cancellation token fires first.
    async fn cancellable<F: Future>(&self, future: F) -> Option<F::Output> {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => None,
                output = future => Some(output),
            },
            None => Some(future.await),
        }
    }

    fn fail(&mut self, source: CloudError) -> CloudError {
        let acknowledged = self.session.acknowledged;
        warn!(path = %self.session.path, acknowledged, error = %source, "Upload aborted");
        self.session.release(UploadState::Aborted);
        CloudError::UploadAborted {
            acknowledged,
            source: Box::new(source),
        }
    }

    fn cancelled(&mut self) -> CloudError {
        let acknowledged = self.session.acknowledged;
        info!(path = %self.session.path, acknowledged, "Upload cancelled");
        self.session.release(UploadState::Aborted);
        CloudError::Cancelled { acknowledged }
    }
}

impl std::fmt::Debug for UploadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadStream")
            .field("session", &self.session)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn acknowledgement(decoded: Decoded) -> Option<String> {
    let text = decoded.into_text().ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn committed_path(decoded: Decoded) -> Option<String> {
    match decoded {
        Decoded::Structured(value) => value
            .get("body")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
