//! Remote file operations.

use crate::error::{CloudError, Result};
use crate::http::RequestDescriptor;
use crate::pipeline::RequestPipeline;
use crate::types::{ApiResponse, FolderListing, PublishedLink};
use tracing::{debug, info};

/// Metadata operations on the cloud drive: listing, folders, moves and
/// public links.
pub struct ActionClient<'a> {
    pipeline: &'a RequestPipeline,
    public_url: &'a str,
}

impl<'a> ActionClient<'a> {
    pub(crate) fn new(pipeline: &'a RequestPipeline, public_url: &'a str) -> Self {
        Self {
            pipeline,
            public_url,
        }
    }

    /// List the direct children of a folder.
    pub async fn list(&self, path: &str) -> Result<FolderListing> {
        let path = normalize(path)?;
        debug!(path = %path, "Listing folder");

        let descriptor = RequestDescriptor::get("folder").query("home", path.as_str());
        let response: ApiResponse<FolderListing> = self.pipeline.execute_json(&descriptor).await?;

        debug!(
            path = %path,
            folders = response.body.count.folders,
            files = response.body.count.files,
            "Listed folder"
        );
        Ok(response.body)
    }

    /// Create a folder. Returns the path the service actually created,
    /// which differs from `path` when the name was taken.
    pub async fn create_folder(&self, path: &str) -> Result<String> {
        let path = normalize(path)?;
        let created = self
            .mutate("folder/add", &[("home", path.as_str()), ("conflict", "rename")])
            .await?;
        info!(path = %path, created = %created, "Folder created");
        Ok(created)
    }

    /// Delete a file or folder.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        self.mutate("file/remove", &[("home", path.as_str())]).await?;
        info!(path = %path, "Entry removed");
        Ok(())
    }

    /// Rename an entry in place. Returns the new path.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String> {
        let path = normalize(path)?;
        if new_name.is_empty() || new_name.contains('/') {
            return Err(CloudError::InvalidRequest(format!(
                "invalid entry name: {:?}",
                new_name
            )));
        }

        let renamed = self
            .mutate(
                "file/rename",
                &[("home", path.as_str()), ("name", new_name), ("conflict", "rename")],
            )
            .await?;
        info!(path = %path, renamed = %renamed, "Entry renamed");
        Ok(renamed)
    }

    /// Move an entry into `target_folder`. Returns the new path.
    pub async fn move_item(&self, path: &str, target_folder: &str) -> Result<String> {
        let path = normalize(path)?;
        let target = normalize(target_folder)?;

        let moved = self
            .mutate(
                "file/move",
                &[("home", path.as_str()), ("folder", target.as_str()), ("conflict", "rename")],
            )
            .await?;
        info!(path = %path, moved = %moved, "Entry moved");
        Ok(moved)
    }

    /// Make an entry publicly reachable.
    pub async fn publish(&self, path: &str) -> Result<PublishedLink> {
        let path = normalize(path)?;
        let weblink = self.mutate("file/publish", &[("home", path.as_str())]).await?;
        if weblink.is_empty() {
            return Err(CloudError::decode("publish response has no link"));
        }

        let url = format!("{}/{}", self.public_url.trim_end_matches('/'), weblink);
        info!(path = %path, url = %url, "Entry published");
        Ok(PublishedLink { path, weblink, url })
    }

    /// Revoke a public link.
    pub async fn unpublish(&self, weblink: &str) -> Result<()> {
        if weblink.is_empty() {
            return Err(CloudError::InvalidRequest("weblink is required".to_string()));
        }
        self.mutate("file/unpublish", &[("weblink", weblink)]).await?;
        info!(weblink = %weblink, "Link revoked");
        Ok(())
    }

    /// POST a form and return the string body of the answer.
    async fn mutate(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<String> {
        let descriptor = RequestDescriptor::post(endpoint).form(form.iter().copied());
        let response: ApiResponse<serde_json::Value> =
            self.pipeline.execute_json(&descriptor).await?;

        match response.body {
            serde_json::Value::String(value) => Ok(value),
            serde_json::Value::Null => Ok(String::new()),
            other => Ok(other.to_string()),
        }
    }
}

/// Cloud paths are absolute and use `/` separators.
pub(crate) fn normalize(path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(CloudError::InvalidRequest("path cannot be empty".to_string()));
    }
    if trimmed.split('/').any(|segment| segment == "..") {
        return Err(CloudError::InvalidRequest(format!(
            "path may not contain '..': {}",
            path
        )));
    }

    let joined = trimmed
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/");
    Ok(format!("/{}", joined))
}
