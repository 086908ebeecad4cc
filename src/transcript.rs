//! Transcript persistence
//!
//! Writes are best-effort: the event stream a consumer sees never depends on
//! whether a transcript write succeeded. [`TranscriptRecorder`] wraps a
//! [`TranscriptStore`] and swallows (after logging) every failure.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::TranscriptConfig;
use crate::error::{RelayError, Result};

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Error,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Error => "error",
        }
    }
}

/// One message of a conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Map<String, Value>,
}

/// Storage backend for transcript messages
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn write(&self, message: &TranscriptMessage) -> Result<()>;
}

/// Store that drops every message
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTranscriptStore;

#[async_trait]
impl TranscriptStore for NoopTranscriptStore {
    async fn write(&self, _message: &TranscriptMessage) -> Result<()> {
        Ok(())
    }
}

/// Store that keeps messages in memory
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    messages: Mutex<Vec<TranscriptMessage>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<TranscriptMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn write(&self, message: &TranscriptMessage) -> Result<()> {
        self.messages
            .lock()
            .map_err(|_| RelayError::Persistence("transcript store poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

/// Document store backend speaking the collections REST API.
///
/// Each message becomes one document:
/// `PUT {endpoint}/collections/messages/{id}` with `{"data": {...}}`.
pub struct DocumentStoreRecorder {
    http: reqwest::Client,
    config: TranscriptConfig,
}

impl DocumentStoreRecorder {
    pub fn new(config: TranscriptConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    fn document(message: &TranscriptMessage, id: &str) -> Value {
        serde_json::json!({
            "data": {
                "id": id,
                "conversation_id": message.conversation_id,
                "user_id": message.user_id,
                "role": message.role,
                "content": message.content,
                "metadata": message.metadata,
                "created_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            }
        })
    }
}

#[async_trait]
impl TranscriptStore for DocumentStoreRecorder {
    async fn write(&self, message: &TranscriptMessage) -> Result<()> {
        let endpoint = self.config.rest_endpoint()?;
        let token = self.config.token()?;

        let id = Uuid::new_v4().to_string();
        let url = format!("{endpoint}/collections/messages/{id}");

        let response = self
            .http
            .put(&url)
            .bearer_auth(token.expose_secret())
            .timeout(self.config.request_timeout)
            .json(&Self::document(message, &id))
            .send()
            .await
            .map_err(|e| RelayError::Persistence(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(RelayError::Persistence(format!(
                "document store returned HTTP {}: {snippet}",
                status.as_u16()
            )));
        }

        tracing::debug!(
            target: "flow_relay::transcript",
            conversation_id=%message.conversation_id,
            role=%message.role.as_str(),
            message_id=%id,
            "transcript message stored"
        );
        Ok(())
    }
}

/// Best-effort transcript writer used by the relay.
///
/// Every operation is a no-op when persistence is disabled or the job has no
/// conversation id.
#[derive(Clone)]
pub struct TranscriptRecorder {
    store: Arc<dyn TranscriptStore>,
    enabled: bool,
}

impl TranscriptRecorder {
    pub fn new(store: Arc<dyn TranscriptStore>, enabled: bool) -> Self {
        Self { store, enabled }
    }

    /// Recorder that never writes anything.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopTranscriptStore), false)
    }

    /// Recorder backed by the document store described in `config`.
    pub fn from_config(config: &TranscriptConfig, http: reqwest::Client) -> Self {
        Self::new(
            Arc::new(DocumentStoreRecorder::new(config.clone(), http)),
            config.enabled,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn record_user_turn(&self, turn: &TurnContext<'_>, text: &str) {
        self.record(turn, Role::User, text).await;
    }

    pub async fn record_assistant_turn(&self, turn: &TurnContext<'_>, text: &str) {
        self.record(turn, Role::Assistant, text).await;
    }

    pub async fn record_error_turn(&self, turn: &TurnContext<'_>, text: &str) {
        self.record(turn, Role::Error, text).await;
    }

    async fn record(&self, turn: &TurnContext<'_>, role: Role, text: &str) {
        let Some(conversation_id) = turn.conversation_id else {
            return;
        };
        if !self.enabled {
            return;
        }

        let message = TranscriptMessage {
            conversation_id: conversation_id.to_string(),
            user_id: turn.user_id.to_string(),
            role,
            content: text.to_string(),
            metadata: turn.metadata.clone(),
        };

        if let Err(e) = self.store.write(&message).await {
            tracing::warn!(
                target: "flow_relay::transcript",
                conversation_id=%conversation_id,
                role=%role.as_str(),
                error=%e,
                "Failed to save transcript message"
            );
        }
    }
}

/// Identity shared by the transcript writes of one job
#[derive(Debug, Clone)]
pub struct TurnContext<'a> {
    pub conversation_id: Option<&'a str>,
    pub user_id: &'a str,
    pub metadata: Map<String, Value>,
}
