//! Authenticated request execution.
//!
//! Every call against the service goes through [`RequestPipeline`]: it
//! attaches the bearer token, sends the request over the configured
//! [`Transport`], recovers once from a rejected token and turns the answer
//! into a [`Decoded`] value or a typed [`CloudError`].

use crate::error::{CloudError, Result, TransportErrorKind};
use crate::http::{Decoded, RequestDescriptor, ResponseEnvelope, ResponseShape, TransportRequest};
use crate::token::TokenManager;
use crate::transport::Transport;
use crate::types::ApiErrorBody;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sends descriptors to the service on behalf of one session.
#[derive(Clone)]
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
    base_url: String,
    timeout: Duration,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenManager>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            tokens,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Send `descriptor` and hand back the successful response undecoded.
    ///
    /// Used for downloads, where the body is streamed by the caller.
    pub async fn open(&self, descriptor: &RequestDescriptor) -> Result<ResponseEnvelope> {
        let request = descriptor.resolve(&self.base_url)?;

        let token = self.tokens.valid_token().await?;
        let response = self.send_authorized(&request, &token).await?;
        if response.status != 401 {
            return self.check_status(response).await;
        }

        // Release the rejected connection before refreshing.
        drop(response);
        warn!(
            method = %request.method,
            url = %request.url,
            "Access token rejected, refreshing and retrying once"
        );

        let token = self.tokens.refresh_after_rejection(&token).await?;
        let response = self.send_authorized(&request, &token).await?;
        if response.status == 401 {
            return Err(CloudError::Auth(
                "request rejected again after token refresh".to_string(),
            ));
        }
        self.check_status(response).await
    }

    /// Send `descriptor` and decode the body by its response shape.
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Result<Decoded> {
        let response = self.open(descriptor).await?;
        let body = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| {
                CloudError::transport(TransportErrorKind::Timeout, "reading response body timed out")
            })??;
        Decoded::from_body(descriptor.shape(), body)
    }

    /// Send `descriptor` and deserialize the JSON answer into `T`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<T> {
        let descriptor = descriptor.clone().expect(ResponseShape::Structured);
        self.execute(&descriptor).await?.into_typed()
    }

    pub async fn execute_text(&self, descriptor: &RequestDescriptor) -> Result<String> {
        let descriptor = descriptor.clone().expect(ResponseShape::Text);
        self.execute(&descriptor).await?.into_text()
    }

    pub async fn execute_raw(&self, descriptor: &RequestDescriptor) -> Result<bytes::Bytes> {
        let descriptor = descriptor.clone().expect(ResponseShape::Raw);
        Ok(self.execute(&descriptor).await?.into_bytes())
    }

    async fn send_authorized(
        &self,
        request: &TransportRequest,
        token: &str,
    ) -> Result<ResponseEnvelope> {
        let mut request = request.clone();
        request.set_header("authorization", format!("Bearer {}", token));

        debug!(method = %request.method, url = %request.url, "Dispatching request");

        match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(CloudError::transport(
                TransportErrorKind::Timeout,
                format!("no response within {:?}", self.timeout),
            )),
        }
    }

    /// Pass a 2xx response through, otherwise turn it into `RemoteRejected`.
    async fn check_status(&self, response: ResponseEnvelope) -> Result<ResponseEnvelope> {
        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let text = match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                debug!(status, error = %e, "Could not read error body");
                String::new()
            }
            Err(_) => {
                debug!(status, "Reading error body timed out");
                String::new()
            }
        };
        let (code, message) = rejection_details(&text);
        debug!(status, code = ?code, "Request rejected");

        Err(CloudError::RemoteRejected {
            status,
            code,
            message,
        })
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("transport", &self.transport.name())
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Lift the code and message out of an error payload, falling back to the
/// raw text.
fn rejection_details(text: &str) -> (Option<String>, String) {
    let Ok(body) = serde_json::from_str::<ApiErrorBody>(text) else {
        return (None, text.trim().to_string());
    };

    let code = match body.error_code {
        Some(serde_json::Value::String(code)) => Some(code),
        Some(serde_json::Value::Null) | None => body.error.clone(),
        Some(other) => Some(other.to_string()),
    };
    let message = body
        .error_description
        .or(body.message)
        .or(body.error)
        .unwrap_or_else(|| text.trim().to_string());

    (code, message)
}
