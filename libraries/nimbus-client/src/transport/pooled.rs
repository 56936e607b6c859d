//! Connection-pooled transport over `reqwest`.

use super::{Transport, TransportOptions};
use crate::error::{CloudError, Result, TransportErrorKind};
use crate::http::{HeaderMap, HttpMethod, ResponseEnvelope, TransportRequest};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::Client;
use tokio::time::timeout;
use tracing::debug;

/// Transport backed by one shared `reqwest::Client` and its connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    options: TransportOptions,
}

impl ReqwestTransport {
    pub fn new(options: TransportOptions) -> Result<Self> {
        // Only connect and the response head are bounded here; bodies are
        // read at the caller's pace.
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(options.user_agent.clone())
            .build()?;

        Ok(Self { http, options })
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<ResponseEnvelope> {
        let headers = self.options.headers_for(&request);
        debug!(
            method = %request.method,
            url = %request.url,
            body_len = request.body_len(),
            "Sending pooled request"
        );

        let mut builder = self.http.request(method(request.method), request.url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = match timeout(self.options.request_timeout, builder.send()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CloudError::transport(
                    TransportErrorKind::Timeout,
                    format!("no response within {:?}", self.options.request_timeout),
                ))
            }
        };

        let status = response.status().as_u16();
        let headers: HeaderMap = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes_stream().map_err(CloudError::from);

        Ok(ResponseEnvelope::new(status, headers, Box::pin(body)))
    }

    fn name(&self) -> &'static str {
        "reqwest"
    }
}
