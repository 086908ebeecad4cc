//! Relay configuration
//!
//! Settings are read once at process start and handed to the invoker and the
//! transcript recorder by reference. Nothing reads the environment while a
//! job runs; a missing setting only fails the path that needs it.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{RelayError, Result};

pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEYSPACE: &str = "flow_app_prod";
pub const DEFAULT_TRANSCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Execution service settings
#[derive(Debug, Clone)]
pub struct FlowApiConfig {
    /// Base address, e.g. `https://flows.example.com/api/v1`
    pub base_url: Option<String>,
    /// Bearer token sent on every run request
    pub token: Option<SecretString>,
    /// Longest tolerated silence while reading the streamed response
    pub stream_idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for FlowApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl FlowApiConfig {
    /// Check that both the base address and the token are present.
    ///
    /// Returns the trimmed base address (without trailing `/`) and the token.
    pub fn validate(&self) -> Result<(&str, &SecretString)> {
        let base_url = self
            .base_url
            .as_deref()
            .map(|u| u.trim().trim_end_matches('/'))
            .filter(|u| !u.is_empty());
        let token = self
            .token
            .as_ref()
            .filter(|t| !t.expose_secret().trim().is_empty());

        match (base_url, token) {
            (Some(url), Some(token)) => Ok((url, token)),
            (None, _) => Err(RelayError::Configuration(
                "Flow API URL is not configured".to_string(),
            )),
            (_, None) => Err(RelayError::Configuration(
                "Flow API token is not configured".to_string(),
            )),
        }
    }
}

/// Transcript persistence settings
#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    pub enabled: bool,
    pub db_id: Option<String>,
    pub region: Option<String>,
    pub keyspace: String,
    pub token: Option<SecretString>,
    /// Explicit REST endpoint; overrides the one derived from id and region
    pub endpoint: Option<String>,
    pub request_timeout: Duration,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_id: None,
            region: None,
            keyspace: DEFAULT_KEYSPACE.to_string(),
            token: None,
            endpoint: None,
            request_timeout: DEFAULT_TRANSCRIPT_TIMEOUT,
        }
    }
}

impl TranscriptConfig {
    /// Keyspace-level REST endpoint of the document store.
    pub fn rest_endpoint(&self) -> Result<String> {
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            return Ok(endpoint.trim().trim_end_matches('/').to_string());
        }
        match (self.db_id.as_deref(), self.region.as_deref()) {
            (Some(id), Some(region)) if !id.is_empty() && !region.is_empty() => Ok(format!(
                "https://{id}-{region}.apps.astra.datastax.com/api/rest/v2/keyspaces/{}",
                self.keyspace
            )),
            _ => Err(RelayError::Configuration(
                "Document store id or region is not configured".to_string(),
            )),
        }
    }

    /// Document store token.
    pub fn token(&self) -> Result<&SecretString> {
        self.token
            .as_ref()
            .filter(|t| !t.expose_secret().is_empty())
            .ok_or_else(|| {
                RelayError::Configuration("Document store token is not configured".to_string())
            })
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub flow_api: FlowApiConfig,
    pub transcript: TranscriptConfig,
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Load the configuration from process environment variables.
    ///
    /// - `LANGFLOW_API_URL`, `LANGFLOW_API_TOKEN`
    /// - `FLOW_STREAM_IDLE_TIMEOUT_SECS`
    /// - `SAVE_MESSAGES_ENABLED`
    /// - `ASTRA_DB_ID`, `ASTRA_DB_REGION`, `ASTRA_DB_KEYSPACE`,
    ///   `ASTRA_DB_APPLICATION_TOKEN`, `ASTRA_DB_ENDPOINT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut builder = Self::builder();

        if let Some(url) = get("LANGFLOW_API_URL") {
            builder = builder.flow_api_url(url);
        }
        if let Some(token) = get("LANGFLOW_API_TOKEN") {
            builder = builder.flow_api_token(token);
        }
        if let Some(secs) = get("FLOW_STREAM_IDLE_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                RelayError::Configuration(format!(
                    "Invalid FLOW_STREAM_IDLE_TIMEOUT_SECS: {secs}"
                ))
            })?;
            builder = builder.stream_idle_timeout(Duration::from_secs(secs));
        }

        let enabled = get("SAVE_MESSAGES_ENABLED")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        builder = builder.save_messages(enabled);

        if let Some(id) = get("ASTRA_DB_ID") {
            builder = builder.document_store_id(id);
        }
        if let Some(region) = get("ASTRA_DB_REGION") {
            builder = builder.document_store_region(region);
        }
        if let Some(keyspace) = get("ASTRA_DB_KEYSPACE") {
            builder = builder.document_store_keyspace(keyspace);
        }
        if let Some(token) = get("ASTRA_DB_APPLICATION_TOKEN") {
            builder = builder.document_store_token(token);
        }
        if let Some(endpoint) = get("ASTRA_DB_ENDPOINT") {
            builder = builder.document_store_endpoint(endpoint);
        }

        Ok(builder.build())
    }
}

/// Builder for `RelayConfig`
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Set the execution service base URL
    pub fn flow_api_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.flow_api.base_url = Some(url.into());
        self
    }

    /// Set the execution service bearer token
    pub fn flow_api_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.flow_api.token = Some(SecretString::from(token.into()));
        self
    }

    /// Set the tolerated silence on the upstream stream
    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.flow_api.stream_idle_timeout = timeout;
        self
    }

    /// Set the connection timeout for the upstream call
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.flow_api.connect_timeout = timeout;
        self
    }

    /// Enable or disable transcript persistence
    pub fn save_messages(mut self, enabled: bool) -> Self {
        self.config.transcript.enabled = enabled;
        self
    }

    pub fn document_store_id<S: Into<String>>(mut self, id: S) -> Self {
        self.config.transcript.db_id = Some(id.into());
        self
    }

    pub fn document_store_region<S: Into<String>>(mut self, region: S) -> Self {
        self.config.transcript.region = Some(region.into());
        self
    }

    pub fn document_store_keyspace<S: Into<String>>(mut self, keyspace: S) -> Self {
        self.config.transcript.keyspace = keyspace.into();
        self
    }

    pub fn document_store_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.transcript.token = Some(SecretString::from(token.into()));
        self
    }

    pub fn document_store_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.config.transcript.endpoint = Some(endpoint.into());
        self
    }

    pub fn build(self) -> RelayConfig {
        self.config
    }
}
