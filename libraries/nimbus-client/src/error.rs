//! Error types for the Nimbus cloud client.

use std::fmt;
use thiserror::Error;

/// Classification of a network-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// TCP connect, DNS resolution or TLS handshake failed
    Connect,
    /// The exchange did not complete within its deadline
    Timeout,
    /// The connection broke while the request or response was in flight
    Io,
    /// The peer spoke malformed HTTP
    Protocol,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Errors that can occur when talking to the cloud service.
#[derive(Error, Debug)]
pub enum CloudError {
    /// Network-level failure; always transient
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// Token refresh rejected or exhausted; new credentials are required
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The service answered with a well-formed error
    #[error("Remote rejected request ({status}): {message}")]
    RemoteRejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Invalid service URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// A write would push the session past its declared size
    #[error("Upload of {declared} bytes cannot accept {attempted} bytes")]
    SizeExceeded { declared: u64, attempted: u64 },

    /// The stream was closed before the declared size was written
    #[error("Upload declared {declared} bytes but only {written} were written")]
    SizeMismatch { declared: u64, written: u64 },

    /// The upload session is no longer open
    #[error("Upload session is already closed")]
    SessionClosed,

    /// The upload gave up; `acknowledged` bytes were committed remotely
    #[error("Upload aborted at offset {acknowledged}: {source}")]
    UploadAborted {
        acknowledged: u64,
        #[source]
        source: Box<CloudError>,
    },

    /// The caller cancelled the upload
    #[error("Upload cancelled at offset {acknowledged}")]
    Cancelled { acknowledged: u64 },

    /// IO error during upload/download
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// Create a transport error
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Whether the failure may go away if the same request is sent again.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transport { .. })
    }

    /// Whether new credentials are needed before anything else can succeed.
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            CloudError::Auth(_) => true,
            CloudError::UploadAborted { source, .. } => source.requires_reauthentication(),
            _ => false,
        }
    }

    /// Last acknowledged offset reported by an aborted or cancelled upload.
    pub fn acknowledged_offset(&self) -> Option<u64> {
        match self {
            CloudError::UploadAborted { acknowledged, .. }
            | CloudError::Cancelled { acknowledged } => Some(*acknowledged),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CloudError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_builder() {
            return CloudError::InvalidRequest(err.to_string());
        } else if err.is_decode() {
            return CloudError::Decode(err.to_string());
        } else if err.is_body() || err.is_request() {
            TransportErrorKind::Io
        } else {
            TransportErrorKind::Protocol
        };
        CloudError::transport(kind, err.to_string())
    }
}

impl From<hyper::Error> for CloudError {
    fn from(err: hyper::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_parse() || err.is_user() {
            TransportErrorKind::Protocol
        } else {
            TransportErrorKind::Io
        };
        CloudError::transport(kind, err.to_string())
    }
}

impl From<url::ParseError> for CloudError {
    fn from(err: url::ParseError) -> Self {
        CloudError::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Decode(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CloudError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CloudError::transport(TransportErrorKind::Timeout, "deadline elapsed")
    }
}

/// Result type for cloud client operations.
pub type Result<T> = std::result::Result<T, CloudError>;
