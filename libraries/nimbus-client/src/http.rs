//! Request and response types shared by the pipeline and the transports.
//!
//! A [`RequestDescriptor`] says what to ask for: method, endpoint, query,
//! headers, body and the shape the answer should be decoded into. The
//! pipeline resolves it against a base URL into a [`TransportRequest`],
//! which is all a [`Transport`](crate::transport::Transport) ever sees.

use crate::error::{CloudError, Result};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a successful response body is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseShape {
    /// Bytes are passed through untouched
    Raw,
    /// Body is decoded as UTF-8 text
    Text,
    /// Body is decoded as JSON
    #[default]
    Structured,
}

/// Header and query maps keep one value per key.
pub type HeaderMap = BTreeMap<String, String>;

/// Description of a single call against the service.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: HttpMethod,
    endpoint: String,
    query: BTreeMap<String, String>,
    headers: HeaderMap,
    body: Option<Bytes>,
    shape: ResponseShape,
}

impl RequestDescriptor {
    /// Start a descriptor. `endpoint` is relative to the pipeline's base URL
    /// unless it is an absolute http(s) URL.
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: BTreeMap::new(),
            headers: HeaderMap::new(),
            body: None,
            shape: ResponseShape::default(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, endpoint)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Set a header. Names are stored lower-cased so a later call with the
    /// same name replaces the earlier value.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Form-encode `pairs` as the body.
    pub fn form<'a>(self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.header("content-type", "application/x-www-form-urlencoded")
            .body(encoded)
    }

    pub fn expect(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn query_pairs(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }

    /// Resolve against `base_url` into a request a transport can send.
    pub fn resolve(&self, base_url: &str) -> Result<TransportRequest> {
        let raw = if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")
        {
            self.endpoint.clone()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                self.endpoint.trim_start_matches('/')
            )
        };

        let mut url = url::Url::parse(&raw)?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(self.query.iter());
        }

        Ok(TransportRequest {
            method: self.method,
            url,
            headers: self.headers.clone(),
            body: self.body.clone(),
        })
    }
}

/// A fully resolved request handed to a transport.
///
/// The body is reference-counted `Bytes`; cloning the request for a retry
/// does not copy the payload.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn new(method: HttpMethod, url: url::Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }
}

/// Append the segments of a cloud path (`/a/b c`) to `base`, escaping each.
pub(crate) fn join_cloud_path(base: &url::Url, path: &str) -> Result<url::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CloudError::InvalidUrl(format!("{} cannot take a path", base)))?
        .pop_if_empty()
        .extend(path.split('/').filter(|segment| !segment.is_empty()));
    Ok(url)
}

/// Streaming response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Status, headers and a not-yet-consumed body.
///
/// Dropping the envelope before the body is read releases the connection.
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl ResponseEnvelope {
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Envelope around an in-memory body.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(
            status,
            headers,
            Box::pin(futures_util::stream::once(async move {
                Ok::<_, CloudError>(body)
            })),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.parse().ok())
    }

    /// Read the whole body into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Read the whole body as UTF-8 text.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| CloudError::decode(e.to_string()))
    }
}

impl fmt::Debug for ResponseEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEnvelope")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Raw(Bytes),
    Text(String),
    Structured(serde_json::Value),
}

impl Decoded {
    /// Decode `body` according to `shape`.
    pub fn from_body(shape: ResponseShape, body: Bytes) -> Result<Self> {
        match shape {
            ResponseShape::Raw => Ok(Decoded::Raw(body)),
            ResponseShape::Text => String::from_utf8(body.to_vec())
                .map(Decoded::Text)
                .map_err(|e| CloudError::decode(format!("response is not UTF-8: {}", e))),
            ResponseShape::Structured => {
                if body.is_empty() {
                    return Ok(Decoded::Structured(serde_json::Value::Null));
                }
                serde_json::from_slice(&body)
                    .map(Decoded::Structured)
                    .map_err(|e| CloudError::decode(format!("invalid JSON: {}", e)))
            }
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Decoded::Raw(bytes) => bytes,
            Decoded::Text(text) => Bytes::from(text),
            Decoded::Structured(value) => Bytes::from(value.to_string()),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Decoded::Raw(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| CloudError::decode(e.to_string())),
            Decoded::Text(text) => Ok(text),
            Decoded::Structured(value) => Ok(value.to_string()),
        }
    }

    /// Deserialize into a typed value.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            Decoded::Structured(value) => serde_json::from_value(value)
                .map_err(|e| CloudError::decode(format!("unexpected JSON layout: {}", e))),
            other => {
                let bytes = other.into_bytes();
                serde_json::from_slice(&bytes)
                    .map_err(|e| CloudError::decode(format!("invalid JSON: {}", e)))
            }
        }
    }
}
