//! Nimbus Cloud Client
//!
//! Client access layer for a cloud storage service.
//!
//! # Features
//!
//! - **Request pipeline**: authenticated calls with typed decoding and typed errors
//! - **Token management**: lazy OAuth refresh shared by concurrent callers
//! - **Upload**: chunked, ranged uploads with bounded memory and retry
//! - **Transports**: pooled `reqwest` or per-request `hyper`, chosen by config
//! - **Actions**: list, create, move, rename, remove, publish, download
//!
//! # Example
//!
//! ```ignore
//! use nimbus_client::{ClientConfig, CloudClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default().with_tokens(None, "refresh-token");
//!     let client = CloudClient::new(config)?;
//!
//!     let listing = client.list("/").await?;
//!     for entry in &listing.list {
//!         println!("{} ({} bytes)", entry.home, entry.size);
//!     }
//!
//!     let receipt = client
//!         .upload_file("notes.txt".as_ref(), "/Docs/notes.txt")
//!         .await?;
//!     println!("Uploaded {} in {} chunks", receipt.path, receipt.chunks);
//!
//!     Ok(())
//! }
//! ```

mod actions;
mod client;
mod config;
mod download;
mod error;
mod http;
mod pipeline;
mod token;
pub mod transport;
mod types;
mod upload;

#[cfg(test)]
mod test_utils;

// Re-export main types
pub use client::CloudClient;
pub use config::{ClientConfig, RetryPolicy, TransportBackend};
pub use error::{CloudError, Result, TransportErrorKind};
pub use http::{
    BodyStream, Decoded, HeaderMap, HttpMethod, RequestDescriptor, ResponseEnvelope,
    ResponseShape, TransportRequest,
};
pub use pipeline::RequestPipeline;
pub use token::{TokenManager, TokenPhase, TokenSettings, TokenState};
pub use types::{
    ApiErrorBody, ApiResponse, CloudEntry, DownloadProgress, EntryKind, FolderListing, ItemCount,
    PublishedLink, TokenResponse, UploadReceipt,
};
pub use upload::{ChunkRange, RangedPutProtocol, UploadProtocol, UploadSession, UploadState, UploadStream};

// Re-export sub-clients for direct use if needed
pub use actions::ActionClient;
pub use download::DownloadClient;
pub use transport::{HyperTransport, ReqwestTransport, Transport, TransportOptions};
