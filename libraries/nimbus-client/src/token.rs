//! OAuth token lifecycle.
//!
//! [`TokenManager`] owns the access/refresh token pair for one session. A
//! token past its expiry is renewed lazily by the first caller that needs
//! it; callers arriving while that refresh is in flight wait for it and
//! share its outcome, so the token endpoint sees a single request.

use crate::config::ClientConfig;
use crate::error::{CloudError, Result};
use crate::http::{HttpMethod, TransportRequest};
use crate::transport::Transport;
use crate::types::TokenResponse;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Shortest lifetime given to a freshly refreshed token, whatever the
/// endpoint reported.
const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(5);

/// Where a session is in the token lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    /// No usable access token and no refresh token
    Unauthenticated,
    Valid,
    /// The access token is past its (margin-adjusted) expiry
    Expiring,
    Refreshing,
    /// The last refresh failed; stays here until a new refresh token is set
    Failed,
}

/// Current credentials of a session.
#[derive(Clone, Default)]
pub struct TokenState {
    pub access_token: Option<String>,
    /// Expiry with the safety margin already subtracted. `None` means the
    /// token is trusted until the service rejects it.
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    pub last_error: Option<String>,
    failed: bool,
    /// Bumped every time the credentials change.
    generation: u64,
}

impl TokenState {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_some() && self.expires_at.map_or(true, |at| at > now)
    }

    /// The token to use right now, `None` if a refresh is needed, or the
    /// sticky failure.
    fn usable(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        if self.failed {
            return Err(CloudError::Auth(self.failure_message()));
        }
        if self.is_fresh(now) {
            return Ok(self.access_token.clone());
        }
        Ok(None)
    }

    fn failure_message(&self) -> String {
        format!(
            "re-authentication required: {}",
            self.last_error.as_deref().unwrap_or("token refresh failed")
        )
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Outcome of a refresh that completed after `seen` was read, if any.
    fn settled_since(&self, seen: u64) -> Result<Option<String>> {
        if self.generation == seen {
            return Ok(None);
        }
        if self.failed {
            return Err(CloudError::Auth(self.failure_message()));
        }
        Ok(self.access_token.clone())
    }
}

/// Expiry for a token valid for `lifetime` seconds, minus `margin`. `None`
/// when the lifetime is too large to represent.
fn expiry_after(lifetime: u64, margin: Duration) -> Option<DateTime<Utc>> {
    let usable = Duration::from_secs(lifetime)
        .saturating_sub(margin)
        .max(MIN_TOKEN_LIFETIME);
    let usable = chrono::Duration::from_std(usable).ok()?;
    Utc::now().checked_add_signed(usable)
}

impl fmt::Debug for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenState")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("last_error", &self.last_error)
            .field("failed", &self.failed)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Token endpoint settings.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub token_url: url::Url,
    pub client_id: String,
    pub user_agent: String,
    pub safety_margin: Duration,
    pub request_timeout: Duration,
}

impl TokenSettings {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            token_url: crate::config::validate_url(&config.token_url)?,
            client_id: config.client_id.clone(),
            user_agent: config.user_agent.clone(),
            safety_margin: config.token_safety_margin(),
            request_timeout: config.request_timeout(),
        })
    }
}

/// Owns and renews the credentials of one session.
pub struct TokenManager {
    transport: Arc<dyn Transport>,
    settings: TokenSettings,
    state: RwLock<TokenState>,
    /// Held for the whole duration of a refresh.
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(transport: Arc<dyn Transport>, settings: TokenSettings) -> Self {
        Self {
            transport,
            settings,
            state: RwLock::new(TokenState::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Build a manager seeded with the tokens in `config`.
    pub fn from_config(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let manager = Self::new(transport, TokenSettings::from_config(config)?);
        let seeded = TokenState {
            access_token: config.access_token.clone(),
            refresh_token: config.refresh_token.clone(),
            ..TokenState::default()
        };
        Ok(Self {
            state: RwLock::new(seeded),
            ..manager
        })
    }

    /// Replace the whole credential set (e.g. after an interactive sign-in).
    pub async fn set_tokens(
        &self,
        access_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        refresh_token: Option<String>,
    ) {
        let mut state = self.state.write().await;
        *state = TokenState {
            access_token,
            expires_at,
            refresh_token,
            last_error: None,
            failed: false,
            generation: state.generation + 1,
        };
    }

    /// Supply a new refresh token. Clears a sticky failure and forces the
    /// next call to refresh.
    pub async fn set_refresh_token(&self, refresh_token: impl Into<String>) {
        let mut state = self.state.write().await;
        state.refresh_token = Some(refresh_token.into());
        state.access_token = None;
        state.expires_at = None;
        state.last_error = None;
        state.failed = false;
        state.generation += 1;
        debug!("Refresh token replaced");
    }

    /// Forget all credentials.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = TokenState {
            generation: state.generation + 1,
            ..TokenState::default()
        };
        info!("Credentials cleared");
    }

    pub async fn snapshot(&self) -> TokenState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> TokenPhase {
        if self.refresh_lock.try_lock().is_err() {
            return TokenPhase::Refreshing;
        }
        let state = self.state.read().await;
        if state.failed {
            TokenPhase::Failed
        } else if state.is_fresh(Utc::now()) {
            TokenPhase::Valid
        } else if state.access_token.is_some() || state.refresh_token.is_some() {
            TokenPhase::Expiring
        } else {
            TokenPhase::Unauthenticated
        }
    }

    /// Return a usable access token, refreshing it first if needed.
    pub async fn valid_token(&self) -> Result<String> {
        let seen = {
            let state = self.state.read().await;
            if let Some(token) = state.usable(Utc::now())? {
                return Ok(token);
            }
            state.generation
        };

        let _guard = self.refresh_lock.lock().await;

        // Whoever held the lock before us may already have refreshed; take
        // that result even if it is already close to expiry.
        {
            let state = self.state.read().await;
            if let Some(token) = state.settled_since(seen)? {
                return Ok(token);
            }
            if let Some(token) = state.usable(Utc::now())? {
                return Ok(token);
            }
        }

        self.refresh_locked().await
    }

    /// Called when the service rejected `rejected`. Refreshes unless another
    /// caller already replaced that token.
    pub async fn refresh_after_rejection(&self, rejected: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.failed {
                return Err(CloudError::Auth(state.failure_message()));
            }
            if state.access_token.as_deref() != Some(rejected) && state.is_fresh(Utc::now()) {
                if let Some(token) = state.access_token.clone() {
                    return Ok(token);
                }
            }
        }

        self.refresh_locked().await
    }

    /// Perform the refresh. Caller must hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<String> {
        let refresh_token = self.state.read().await.refresh_token.clone().ok_or_else(|| {
            CloudError::Auth("no refresh token available; sign in again".to_string())
        })?;

        debug!(url = %self.settings.token_url, "Refreshing access token");
        let outcome = self.request_refresh(&refresh_token).await;

        let mut state = self.state.write().await;
        state.generation += 1;
        match outcome {
            Ok(response) => {
                let access_token = response.access_token.unwrap_or_default();
                let lifetime = response.expires_in.unwrap_or(0);
                let expires_at = expiry_after(lifetime, self.settings.safety_margin);
                if expires_at.is_none() {
                    debug!(
                        expires_in = lifetime,
                        "Token lifetime out of range, keeping it until rejected"
                    );
                }

                state.access_token = Some(access_token.clone());
                state.expires_at = expires_at;
                if let Some(rotated) = response.refresh_token {
                    state.refresh_token = Some(rotated);
                }
                state.last_error = None;
                state.failed = false;

                info!(expires_in = lifetime, "Access token refreshed");
                Ok(access_token)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "Token refresh failed");
                state.failed = true;
                state.last_error = Some(message);
                Err(CloudError::Auth(state.failure_message()))
            }
        }
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", refresh_token)
            .finish();

        let mut request = TransportRequest::new(HttpMethod::Post, self.settings.token_url.clone());
        request.set_header("content-type", "application/x-www-form-urlencoded");
        request.set_header("accept", "*/*");
        request.set_header("user-agent", self.settings.user_agent.clone());
        request.body = Some(Bytes::from(body));

        let (status, body) = tokio::time::timeout(self.settings.request_timeout, async {
            let response = self.transport.send(request).await?;
            let status = response.status;
            let body = response.bytes().await?;
            Ok::<_, CloudError>((status, body))
        })
        .await??;

        let success = (200..300).contains(&status);
        match serde_json::from_slice::<TokenResponse>(&body) {
            Ok(payload) => {
                if let Some(message) = payload.error_message() {
                    return Err(CloudError::Auth(message));
                }
                if !success {
                    return Err(CloudError::Auth(format!(
                        "token endpoint returned {}",
                        status
                    )));
                }
                match payload.access_token.as_deref() {
                    Some(token) if !token.is_empty() => Ok(payload),
                    _ => Err(CloudError::decode("token response has no access_token")),
                }
            }
            Err(e) if success => Err(CloudError::decode(format!(
                "invalid token response: {}",
                e
            ))),
            Err(_) => Err(CloudError::Auth(format!(
                "token endpoint returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("transport", &self.transport.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
