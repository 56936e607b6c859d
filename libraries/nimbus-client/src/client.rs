//! Main cloud client.

use crate::actions::{normalize, ActionClient};
use crate::config::ClientConfig;
use crate::download::DownloadClient;
use crate::error::Result;
use crate::pipeline::RequestPipeline;
use crate::token::{TokenManager, TokenPhase};
use crate::transport::{self, Transport};
use crate::types::{DownloadProgress, FolderListing, PublishedLink, UploadReceipt};
use crate::upload::{RangedPutProtocol, UploadProtocol, UploadStream};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// One authenticated session against the cloud service.
///
/// The client owns the transport, the token manager and the request
/// pipeline. It is cheap to share behind an `Arc`; every operation takes
/// `&self`.
///
/// # Example
///
/// ```ignore
/// use nimbus_client::{ClientConfig, CloudClient};
///
/// let config = ClientConfig::load(None)?;
/// let client = CloudClient::new(config)?;
///
/// let listing = client.list("/Music").await?;
/// println!("{} entries", listing.number_of_items());
///
/// let mut upload = client.open_upload_stream("/Music/set.flac", 10).await?;
/// upload.write(b"ABCDEFGHIJ").await?;
/// upload.close().await?;
/// ```
pub struct CloudClient {
    config: ClientConfig,
    tokens: Arc<TokenManager>,
    pipeline: RequestPipeline,
    protocol: Arc<dyn UploadProtocol>,
    download_url: url::Url,
}

impl CloudClient {
    /// Create a client using the transport backend named in `config`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport::from_config(&config)?;
        Self::with_transport(config, transport)
    }

    /// Create a client over an already-built transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenManager::from_config(&config, transport.clone())?);
        let pipeline = RequestPipeline::new(
            transport,
            tokens.clone(),
            config.api_url.clone(),
            config.request_timeout(),
        );
        let protocol = Arc::new(RangedPutProtocol::new(
            &config.upload_url,
            config.finalize_endpoint.clone(),
        )?);
        let download_url = crate::config::validate_url(&config.download_url)?;

        debug!(
            api = %config.api_url,
            transport = pipeline.transport_name(),
            "Cloud client created"
        );

        Ok(Self {
            config,
            tokens,
            pipeline,
            protocol,
            download_url,
        })
    }

    /// Replace the upload wire protocol.
    pub fn with_upload_protocol(mut self, protocol: Arc<dyn UploadProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub async fn auth_status(&self) -> TokenPhase {
        self.tokens.status().await
    }

    /// Supply a new refresh token, e.g. after the user signed in again.
    pub async fn set_refresh_token(&self, refresh_token: impl Into<String>) {
        self.tokens.set_refresh_token(refresh_token).await;
    }

    /// Metadata operations.
    pub fn actions(&self) -> ActionClient<'_> {
        ActionClient::new(&self.pipeline, &self.config.public_url)
    }

    /// File downloads.
    pub fn downloads(&self) -> DownloadClient<'_> {
        DownloadClient::new(&self.pipeline, &self.download_url)
    }

    pub async fn list(&self, path: &str) -> Result<FolderListing> {
        self.actions().list(path).await
    }

    pub async fn create_folder(&self, path: &str) -> Result<String> {
        self.actions().create_folder(path).await
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        self.actions().remove(path).await
    }

    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String> {
        self.actions().rename(path, new_name).await
    }

    pub async fn move_item(&self, path: &str, target_folder: &str) -> Result<String> {
        self.actions().move_item(path, target_folder).await
    }

    pub async fn publish(&self, path: &str) -> Result<PublishedLink> {
        self.actions().publish(path).await
    }

    pub async fn unpublish(&self, weblink: &str) -> Result<()> {
        self.actions().unpublish(weblink).await
    }

    pub async fn download<F>(&self, path: &str, dest_path: &Path, progress: F) -> Result<u64>
    where
        F: FnMut(DownloadProgress),
    {
        self.downloads().download(path, dest_path, progress).await
    }

    /// Open an upload of exactly `size` bytes to `path`.
    pub async fn open_upload_stream(&self, path: &str, size: u64) -> Result<UploadStream> {
        let path = normalize(path)?;
        UploadStream::new(
            self.pipeline.clone(),
            self.protocol.clone(),
            path,
            size,
            self.config.chunk_size,
            self.config.retry_policy(),
        )
    }

    /// Upload `size` bytes read from `reader`.
    pub async fn upload_reader<R>(
        &self,
        reader: &mut R,
        remote_path: &str,
        size: u64,
    ) -> Result<UploadReceipt>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut stream = self.open_upload_stream(remote_path, size).await?;
        if let Err(err) = stream.copy_from(reader).await {
            stream.abort();
            return Err(err);
        }
        stream.close().await
    }

    /// Upload a local file.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<UploadReceipt> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();
        debug!(file = %local_path.display(), remote = %remote_path, size, "Uploading file");

        let receipt = self.upload_reader(&mut file, remote_path, size).await?;
        info!(file = %local_path.display(), remote = %receipt.path, "File uploaded");
        Ok(receipt)
    }
}

impl std::fmt::Debug for CloudClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudClient")
            .field("api_url", &self.config.api_url)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}
