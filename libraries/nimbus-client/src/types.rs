//! Types for cloud API requests and responses.

use serde::{Deserialize, Serialize};

// =============================================================================
// Authentication Types
// =============================================================================

/// Response from the OAuth token endpoint.
///
/// The endpoint may answer 200 and still report a failure through `error`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Token validity in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Present when the endpoint rotates refresh tokens
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Human-readable failure, if the payload reports one.
    pub fn error_message(&self) -> Option<String> {
        let error = self.error.as_deref()?;
        let mut message = error.to_string();
        if let Some(code) = self.error_code {
            message.push_str(&format!(" (code {})", code));
        }
        if let Some(description) = self.error_description.as_deref() {
            message.push_str(": ");
            message.push_str(description);
        }
        Some(message)
    }
}

// =============================================================================
// API Envelope
// =============================================================================

/// Wrapper the metadata API puts around every payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub email: Option<String>,
    pub status: u16,
    pub body: T,
}

/// Error payload some endpoints return with a non-2xx status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<serde_json::Value>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Folder Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// A file or folder as returned by the service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudEntry {
    pub name: String,
    /// Full path of the entry
    pub home: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    /// Modification time, Unix seconds (files only)
    #[serde(default)]
    pub mtime: Option<i64>,
    /// Public link id when the entry is published
    #[serde(default)]
    pub weblink: Option<String>,
}

impl CloudEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ItemCount {
    #[serde(default)]
    pub folders: u64,
    #[serde(default)]
    pub files: u64,
}

/// Contents of one folder.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FolderListing {
    pub name: String,
    pub home: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub count: ItemCount,
    #[serde(default)]
    pub list: Vec<CloudEntry>,
}

impl FolderListing {
    pub fn number_of_items(&self) -> u64 {
        self.count.folders + self.count.files
    }

    pub fn folders(&self) -> impl Iterator<Item = &CloudEntry> {
        self.list.iter().filter(|e| e.is_folder())
    }

    pub fn files(&self) -> impl Iterator<Item = &CloudEntry> {
        self.list.iter().filter(|e| !e.is_folder())
    }

    /// Find a direct child by name.
    pub fn entry(&self, name: &str) -> Option<&CloudEntry> {
        self.list.iter().find(|e| e.name == name)
    }
}

/// Public link created by publishing an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedLink {
    pub path: String,
    /// Link id assigned by the service
    pub weblink: String,
    /// Shareable URL built from `weblink`
    pub url: String,
}

// =============================================================================
// Transfer Types
// =============================================================================

/// Outcome of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub path: String,
    pub size: u64,
    pub chunks: u64,
    /// Body of the last chunk acknowledgement (content hash on services that
    /// return one)
    pub last_ack: Option<String>,
    /// Final path reported by the finalize call, if one was made
    pub committed_path: Option<String>,
}

/// Download progress information.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub path: String,
    pub bytes_received: u64,
    pub bytes_total: Option<u64>,
    /// 0.0 to 1.0
    pub progress: f32,
}
