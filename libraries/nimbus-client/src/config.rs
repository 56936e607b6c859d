/// Client configuration
use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which transport implementation carries requests.
///
/// Chosen once per deployment; every pipeline call made through a client
/// uses the same backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportBackend {
    /// Connection-pooled `reqwest` client
    #[default]
    Pooled,
    /// One hyper connection per request
    PerRequest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Base URL of the metadata API (list, move, publish, ...)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL chunks are uploaded to
    #[serde(default = "default_upload_url")]
    pub upload_url: String,

    /// Base URL files are downloaded from
    #[serde(default = "default_download_url")]
    pub download_url: String,

    /// Prefix of shareable links for published entries
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// OAuth token endpoint
    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub transport: TransportBackend,

    /// Upload chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Attempts per chunk, including the first one
    #[serde(default = "default_max_chunk_attempts")]
    pub max_chunk_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Subtracted from the reported token lifetime
    #[serde(default = "default_token_safety_margin_secs")]
    pub token_safety_margin_secs: u64,

    /// Endpoint that registers an uploaded file, relative to `api_url`.
    /// Uploads skip the finalize call when unset.
    #[serde(default)]
    pub finalize_endpoint: Option<String>,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl ClientConfig {
    /// Create a config pointing every endpoint at one host, e.g. a test server.
    pub fn for_host(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self {
            api_url: format!("{}/api/v2", base),
            upload_url: format!("{}/upload", base),
            download_url: format!("{}/get", base),
            public_url: format!("{}/public", base),
            token_url: format!("{}/token", base),
            ..Self::default()
        }
    }

    /// Attach existing credentials.
    pub fn with_tokens(
        mut self,
        access_token: Option<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        self.access_token = access_token;
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = path {
            settings = settings.add_source(config::File::from(path));
        }

        // Override with environment variables (prefixed with NIMBUS_)
        settings = settings.add_source(config::Environment::with_prefix("NIMBUS").try_parsing(true));

        let config = settings
            .build()
            .map_err(|e| CloudError::Config(e.to_string()))?;

        let config: Self = config
            .try_deserialize()
            .map_err(|e| CloudError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("api_url", &self.api_url),
            ("upload_url", &self.upload_url),
            ("download_url", &self.download_url),
            ("public_url", &self.public_url),
            ("token_url", &self.token_url),
        ] {
            validate_url(value).map_err(|e| CloudError::Config(format!("{}: {}", name, e)))?;
        }

        if self.client_id.is_empty() {
            return Err(CloudError::Config("client_id is required".to_string()));
        }

        if self.chunk_size == 0 {
            return Err(CloudError::Config(
                "chunk_size must be greater than zero".to_string(),
            ));
        }

        if self.max_chunk_attempts == 0 {
            return Err(CloudError::Config(
                "max_chunk_attempts must be at least 1".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(CloudError::Config("timeouts must be non-zero".to_string()));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token_safety_margin_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_chunk_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

/// Check that a URL is absolute http(s).
pub(crate) fn validate_url(value: &str) -> Result<url::Url> {
    if value.is_empty() {
        return Err(CloudError::InvalidUrl("URL cannot be empty".into()));
    }
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(CloudError::InvalidUrl(
            "URL must start with http:// or https://".into(),
        ));
    }
    Ok(url::Url::parse(value)?)
}

/// Bounded exponential backoff for chunk retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before `attempt` (1-based; the first attempt has no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        ClientConfig::default().retry_policy()
    }
}

// Default values
fn default_api_url() -> String {
    "https://cloud.mail.ru/api/v2".to_string()
}

fn default_upload_url() -> String {
    "https://cloud.mail.ru/upload".to_string()
}

fn default_download_url() -> String {
    "https://cloud.mail.ru/get".to_string()
}

fn default_public_url() -> String {
    "https://cloud.mail.ru/public".to_string()
}

fn default_token_url() -> String {
    "https://o2.mail.ru/token".to_string()
}

fn default_client_id() -> String {
    "cloud-win".to_string()
}

fn default_user_agent() -> String {
    format!("Nimbus/{}", env!("CARGO_PKG_VERSION"))
}

fn default_chunk_size() -> usize {
    4 * 1024 * 1024
}

fn default_max_chunk_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    8_000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_token_safety_margin_secs() -> u64 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            upload_url: default_upload_url(),
            download_url: default_download_url(),
            public_url: default_public_url(),
            token_url: default_token_url(),
            client_id: default_client_id(),
            user_agent: default_user_agent(),
            transport: TransportBackend::default(),
            chunk_size: default_chunk_size(),
            max_chunk_attempts: default_max_chunk_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            token_safety_margin_secs: default_token_safety_margin_secs(),
            finalize_endpoint: None,
            access_token: None,
            refresh_token: None,
        }
    }
}
