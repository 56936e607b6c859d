//! Per-request transport over a raw hyper HTTP/1.1 connection.
//!
//! Each call opens its own TCP socket (wrapped in rustls for `https`), sends
//! exactly one request with `Connection: close`, and lets the socket go when
//! the response body has been read or dropped.

use super::{Transport, TransportOptions};
use crate::error::{CloudError, Result, TransportErrorKind};
use crate::http::{HeaderMap, HttpMethod, ResponseEnvelope, TransportRequest};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Transport that dials a new connection for every request.
#[derive(Clone)]
pub struct HyperTransport {
    options: TransportOptions,
    tls: TlsConnector,
}

impl HyperTransport {
    pub fn new(options: TransportOptions) -> Result<Self> {
        Ok(Self {
            options,
            tls: tls_connector()?,
        })
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        match timeout(self.options.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(CloudError::transport(
                TransportErrorKind::Connect,
                format!("{}:{}: {}", host, port, e),
            )),
            Err(_) => Err(CloudError::transport(
                TransportErrorKind::Timeout,
                format!("connecting to {}:{} timed out", host, port),
            )),
        }
    }

    async fn handshake_tls(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| CloudError::InvalidUrl(format!("{}: {}", host, e)))?;

        match timeout(
            self.options.connect_timeout,
            self.tls.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(CloudError::transport(
                TransportErrorKind::Connect,
                format!("TLS handshake with {} failed: {}", host, e),
            )),
            Err(_) => Err(CloudError::transport(
                TransportErrorKind::Timeout,
                format!("TLS handshake with {} timed out", host),
            )),
        }
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn tls_connector() -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        debug!(error = %error, "Skipping unreadable certificate source");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(added, ignored, "Loaded native root certificates");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CloudError::Config(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

fn method(method: HttpMethod) -> http::Method {
    match method {
        HttpMethod::Get => http::Method::GET,
        HttpMethod::Post => http::Method::POST,
        HttpMethod::Put => http::Method::PUT,
        HttpMethod::Delete => http::Method::DELETE,
    }
}

/// Origin-form request line target plus headers and body.
fn build_request(
    request: TransportRequest,
    headers: &HeaderMap,
) -> Result<http::Request<Full<Bytes>>> {
    let target = match request.url.query() {
        Some(query) => format!("{}?{}", request.url.path(), query),
        None => request.url.path().to_string(),
    };

    let mut builder = http::Request::builder()
        .method(method(request.method))
        .uri(target);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header(http::header::CONNECTION, "close");

    builder
        .body(Full::new(request.body.unwrap_or_default()))
        .map_err(|e| CloudError::InvalidRequest(e.to_string()))
}

async fn exchange<S>(io: S, request: http::Request<Full<Bytes>>) -> Result<ResponseEnvelope>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake::<_, Full<Bytes>>(TokioIo::new(io)).await?;

    // hyper needs the connection future polled for the exchange to progress.
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "Connection closed with error");
        }
    });

    let response = sender.send_request(request).await?;
    let (parts, body) = response.into_parts();

    let headers: HeaderMap = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = body.into_data_stream().map_err(CloudError::from);

    Ok(ResponseEnvelope::new(
        parts.status.as_u16(),
        headers,
        Box::pin(body),
    ))
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: TransportRequest) -> Result<ResponseEnvelope> {
        let host = request
            .url
            .host_str()
            .ok_or_else(|| CloudError::InvalidUrl(format!("{} has no host", request.url)))?
            .to_string();
        let port = request
            .url
            .port_or_known_default()
            .ok_or_else(|| CloudError::InvalidUrl(format!("{} has no port", request.url)))?;
        let secure = match request.url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(CloudError::InvalidUrl(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };

        debug!(
            method = %request.method,
            url = %request.url,
            body_len = request.body_len(),
            "Sending request on new connection"
        );

        let headers = self.options.headers_for(&request);
        let http_request = build_request(request, &headers)?;

        let stream = self.connect(&host, port).await?;
        let round_trip = async {
            if secure {
                let tls = self.handshake_tls(&host, stream).await?;
                exchange(tls, http_request).await
            } else {
                exchange(stream, http_request).await
            }
        };

        match timeout(self.options.request_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::transport(
                TransportErrorKind::Timeout,
                format!("no response from {} within {:?}", host, self.options.request_timeout),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "hyper"
    }
}
