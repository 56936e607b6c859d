//! File downloads.

use crate::actions::normalize;
use crate::error::{CloudError, Result};
use crate::http::{join_cloud_path, RequestDescriptor, ResponseShape};
use crate::pipeline::RequestPipeline;
use crate::types::DownloadProgress;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Streams files from the cloud to local disk.
pub struct DownloadClient<'a> {
    pipeline: &'a RequestPipeline,
    download_url: &'a url::Url,
}

impl<'a> DownloadClient<'a> {
    pub(crate) fn new(pipeline: &'a RequestPipeline, download_url: &'a url::Url) -> Self {
        Self {
            pipeline,
            download_url,
        }
    }

    /// Download a file.
    ///
    /// # Arguments
    /// * `path` - Cloud path of the file
    /// * `dest_path` - Where to save the file
    /// * `progress_callback` - Called after every received chunk
    ///
    /// # Returns
    /// Number of bytes written.
    pub async fn download<F>(
        &self,
        path: &str,
        dest_path: &Path,
        mut progress_callback: F,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress),
    {
        let path = normalize(path)?;
        let url = join_cloud_path(self.download_url, &path)?;
        debug!(url = %url, dest = %dest_path.display(), "Downloading file");

        let descriptor = RequestDescriptor::get(url.to_string()).expect(ResponseShape::Raw);
        let response = self.pipeline.open(&descriptor).await?;

        let total_size = response.content_length();

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(dest_path).await?;
        let mut downloaded: u64 = 0;
        let mut body = response.body;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let progress = total_size
                .map(|total| downloaded as f32 / total as f32)
                .unwrap_or(0.0);

            progress_callback(DownloadProgress {
                path: path.clone(),
                bytes_received: downloaded,
                bytes_total: total_size,
                progress,
            });
        }

        file.flush().await?;

        if let Some(expected) = total_size {
            if downloaded != expected {
                return Err(CloudError::transport(
                    crate::error::TransportErrorKind::Io,
                    format!("body ended after {} of {} bytes", downloaded, expected),
                ));
            }
        }

        info!(
            path = %path,
            dest = %dest_path.display(),
            size = downloaded,
            "File downloaded"
        );

        Ok(downloaded)
    }

    /// Download several files one after another.
    ///
    /// `overall_progress` is called with (completed, total) after each file.
    pub async fn download_batch<F, G>(
        &self,
        downloads: Vec<(String, PathBuf)>,
        mut file_progress: F,
        mut overall_progress: G,
    ) -> Vec<Result<u64>>
    where
        F: FnMut(DownloadProgress),
        G: FnMut(usize, usize),
    {
        let total = downloads.len();
        let mut results = Vec::with_capacity(total);

        for (index, (path, dest_path)) in downloads.into_iter().enumerate() {
            let result = self.download(&path, &dest_path, &mut file_progress).await;
            overall_progress(index + 1, total);
            results.push(result);
        }

        results
    }
}
