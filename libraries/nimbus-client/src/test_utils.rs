//! In-memory transport for unit tests.

use crate::error::{CloudError, Result, TransportErrorKind};
use crate::http::{HeaderMap, ResponseEnvelope, TransportRequest};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Respond(u16, Bytes),
    Fail(TransportErrorKind),
    /// Head arrives, then reading the body fails.
    BrokenBody(u16),
    /// Head arrives, the body never does.
    StalledBody(u16),
}

/// Answers requests from a queue, falling back to a default response, and
/// records everything it was sent.
pub(crate) struct ScriptedTransport {
    queue: Mutex<VecDeque<Scripted>>,
    fallback: Mutex<Option<Scripted>>,
    requests: Mutex<Vec<TransportRequest>>,
    delay: Duration,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Hold every response for `delay` so concurrent callers overlap.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn push(&self, scripted: Scripted) {
        self.queue.lock().unwrap().push_back(scripted);
    }

    pub(crate) fn push_json(&self, status: u16, value: serde_json::Value) {
        self.push(Scripted::Respond(status, Bytes::from(value.to_string())));
    }

    pub(crate) fn push_text(&self, status: u16, text: &str) {
        self.push(Scripted::Respond(status, Bytes::from(text.to_string())));
    }

    pub(crate) fn push_failure(&self, kind: TransportErrorKind) {
        self.push(Scripted::Fail(kind));
    }

    pub(crate) fn respond_by_default(&self, status: u16, text: &str) {
        *self.fallback.lock().unwrap() =
            Some(Scripted::Respond(status, Bytes::from(text.to_string())));
    }

    pub(crate) fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests whose URL path starts with `prefix`.
    pub(crate) fn requests_to(&self, prefix: &str) -> Vec<TransportRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.path().starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: TransportRequest) -> Result<ResponseEnvelope> {
        self.requests.lock().unwrap().push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.queue.lock().unwrap().pop_front();
        let next = next.or_else(|| self.fallback.lock().unwrap().clone());

        match next {
            Some(Scripted::Respond(status, body)) => {
                Ok(ResponseEnvelope::from_bytes(status, HeaderMap::new(), body))
            }
            Some(Scripted::Fail(kind)) => Err(CloudError::transport(kind, "scripted failure")),
            Some(Scripted::BrokenBody(status)) => {
                let body = futures_util::stream::once(async {
                    Err::<Bytes, _>(CloudError::transport(
                        TransportErrorKind::Io,
                        "connection reset while reading body",
                    ))
                });
                Ok(ResponseEnvelope::new(status, HeaderMap::new(), Box::pin(body)))
            }
            Some(Scripted::StalledBody(status)) => Ok(ResponseEnvelope::new(
                status,
                HeaderMap::new(),
                Box::pin(futures_util::stream::pending::<Result<Bytes>>()),
            )),
            None => Err(CloudError::transport(
                TransportErrorKind::Protocol,
                "no scripted response left",
            )),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Pipeline over `transport` whose session holds a long-lived token, so
/// only the scripted service responses are consumed.
pub(crate) async fn authorized_pipeline(
    transport: std::sync::Arc<ScriptedTransport>,
) -> crate::pipeline::RequestPipeline {
    use crate::token::{TokenManager, TokenSettings};

    let settings = TokenSettings {
        token_url: url::Url::parse("https://auth.example.com/token").unwrap(),
        client_id: "test-client".into(),
        user_agent: "Nimbus/test".into(),
        safety_margin: Duration::from_secs(60),
        request_timeout: Duration::from_secs(5),
    };
    let tokens = std::sync::Arc::new(TokenManager::new(transport.clone(), settings));
    tokens
        .set_tokens(
            Some("token".into()),
            Some(chrono::Utc::now() + chrono::Duration::hours(1)),
            Some("refresh".into()),
        )
        .await;

    crate::pipeline::RequestPipeline::new(
        transport,
        tokens,
        "https://cloud.example.com/api/v2",
        Duration::from_secs(5),
    )
}
