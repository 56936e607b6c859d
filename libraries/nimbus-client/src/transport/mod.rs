//! Transport adapters.
//!
//! A [`Transport`] moves one [`TransportRequest`] over the network and hands
//! back the status, headers and a streaming body. It knows nothing about
//! tokens, retries or decoding.
//!
//! Two implementations exist:
//! - [`ReqwestTransport`]: a shared, connection-pooled `reqwest::Client`
//! - [`HyperTransport`]: a fresh hyper HTTP/1.1 connection per request
//!
//! Which one is used is decided once, from [`ClientConfig::transport`], or by
//! injecting any `Arc<dyn Transport>` into the client.

mod pooled;
mod socket;

pub use pooled::ReqwestTransport;
pub use socket::HyperTransport;

use crate::config::{ClientConfig, TransportBackend};
use crate::error::Result;
use crate::http::{HeaderMap, ResponseEnvelope, TransportRequest};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Sends fully-formed requests over HTTP.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return as soon as the response head has arrived.
    ///
    /// Every HTTP status is a successful send; only network-level failures
    /// are errors.
    async fn send(&self, request: TransportRequest) -> Result<ResponseEnvelope>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Protocol-level settings shared by both backends.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Allow `Expect: 100-continue` on requests with a body. Some endpoints
    /// reject it, so it is off unless asked for.
    pub expect_continue: bool,
    /// Send this `Host` instead of the one derived from the URL.
    pub host_override: Option<String>,
}

impl TransportOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            expect_continue: false,
            host_override: None,
        }
    }

    /// Final header set for `request`: explicit `Host` and `User-Agent`,
    /// and `Expect` only when allowed.
    pub fn headers_for(&self, request: &TransportRequest) -> HeaderMap {
        let mut headers = request.headers.clone();

        let host = match &self.host_override {
            Some(host) => Some(host.clone()),
            None => host_header(&request.url),
        };
        if let Some(host) = host {
            headers.insert("host".to_string(), host);
        }

        headers
            .entry("user-agent".to_string())
            .or_insert_with(|| self.user_agent.clone());

        if self.expect_continue && request.body_len() > 0 {
            headers.insert("expect".to_string(), "100-continue".to_string());
        } else {
            headers.remove("expect");
        }

        headers
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// `host[:port]` as it belongs in a `Host` header; default ports are omitted.
fn host_header(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Build the transport selected by `config`.
pub fn from_config(config: &ClientConfig) -> Result<Arc<dyn Transport>> {
    let options = TransportOptions::from_config(config);
    let transport: Arc<dyn Transport> = match config.transport {
        TransportBackend::Pooled => Arc::new(ReqwestTransport::new(options)?),
        TransportBackend::PerRequest => Arc::new(HyperTransport::new(options)?),
    };
    tracing::debug!(transport = transport.name(), "Transport selected");
    Ok(transport)
}
