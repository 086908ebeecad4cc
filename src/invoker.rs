//! Flow invocation
//!
//! Issues the single streaming `POST {base}/run/{flow_id}?stream=true` call of
//! a job and exposes the response body as a byte stream. Nothing is buffered:
//! chunks are handed on as they arrive so events can be relayed before the
//! upstream call finishes.

use std::time::Duration;

use futures_util::StreamExt;
use secrecy::ExposeSecret;
use serde_json::{Map, Value};

use crate::config::FlowApiConfig;
use crate::error::{RelayError, Result};
use crate::frame::ByteStream;
use crate::job::Job;
use crate::telemetry::mask_secret;

/// Longest error detail kept from a non-JSON error body, in characters.
const MAX_DETAIL_CHARS: usize = 500;

/// Body field carrying the job inputs.
const INPUT_VALUE_FIELD: &str = "input_value";

/// Calls the flow execution service
#[derive(Clone)]
pub struct FlowInvoker {
    http: reqwest::Client,
    config: FlowApiConfig,
}

impl FlowInvoker {
    pub fn new(config: FlowApiConfig, http: reqwest::Client) -> Self {
        Self { http, config }
    }

    /// Build an HTTP client suited to long-lived streaming calls.
    pub fn build_http_client(config: &FlowApiConfig) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| RelayError::Configuration(format!("failed to build HTTP client: {e}")))
    }

    pub fn config(&self) -> &FlowApiConfig {
        &self.config
    }

    /// Open the streaming call for `job`.
    ///
    /// Fails with `Configuration` before any network activity when the base
    /// address or token is missing, and with `Transport` when the call cannot
    /// be made or the service answers with a non-2xx status.
    pub async fn invoke(&self, job: &Job) -> Result<ByteStream> {
        let (base_url, token) = self.config.validate()?;
        let url = run_url(base_url, &job.flow_id);
        let body = request_body(job);
        let idle = self.config.stream_idle_timeout;

        tracing::debug!(
            target: "flow_relay::invoker",
            execution_id=%job.execution_id,
            url=%url,
            authorization=%mask_secret(token.expose_secret()),
            credential_fields=?job.credentials.keys().collect::<Vec<_>>(),
            "Calling flow API"
        );

        let request = self
            .http
            .post(&url)
            .bearer_auth(token.expose_secret())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .json(&body)
            .send();

        let response = match tokio::time::timeout(idle, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(transport_error(&e)),
            Err(_) => return Err(idle_timeout_error(idle)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = match tokio::time::timeout(idle, response.text()).await {
                Ok(Ok(text)) => text,
                _ => String::new(),
            };
            tracing::warn!(
                target: "flow_relay::invoker",
                execution_id=%job.execution_id,
                status_code=status.as_u16(),
                "Flow API returned an error status"
            );
            return Err(RelayError::Transport {
                message: format!("HTTP status {status}"),
                status_code: Some(status.as_u16()),
                detail: error_detail(&body),
            });
        }

        let mut chunks = Box::pin(response.bytes_stream());
        let out = async_stream::stream! {
            loop {
                match tokio::time::timeout(idle, chunks.next()).await {
                    Ok(Some(Ok(chunk))) => yield Ok(chunk),
                    Ok(Some(Err(e))) => {
                        yield Err(transport_error(&e));
                        return;
                    }
                    Ok(None) => return,
                    Err(_) => {
                        yield Err(idle_timeout_error(idle));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Run URL for a flow: `{base}/run/{flow_id}?stream=true`.
pub fn run_url(base_url: &str, flow_id: &str) -> String {
    format!(
        "{}/run/{}?stream=true",
        base_url.trim_end_matches('/'),
        urlencoding::encode(flow_id)
    )
}

/// Request body of a run: `{"input_value": <inputs>}` with the credentials
/// spread at the top level.
///
/// A credential named `input_value` replaces the inputs.
pub fn request_body(job: &Job) -> Value {
    let mut body = Map::new();
    body.insert(INPUT_VALUE_FIELD.to_string(), Value::Object(job.inputs.clone()));
    for (key, secret) in &job.credentials {
        if key == INPUT_VALUE_FIELD {
            tracing::warn!(
                target: "flow_relay::invoker",
                execution_id=%job.execution_id,
                field=%key,
                "credential overrides the run inputs"
            );
        }
        body.insert(key.clone(), Value::String(secret.clone()));
    }
    Value::Object(body)
}

/// Upstream error detail from an error response body.
///
/// A JSON body contributes its `detail` field (or the whole document when it
/// has none); any other body is cut to its first 500 characters.
pub fn error_detail(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(mut map)) => match map.remove("detail") {
            Some(detail) => Some(detail),
            None => Some(Value::Object(map)),
        },
        Ok(other) => Some(other),
        Err(_) => Some(Value::String(body.chars().take(MAX_DETAIL_CHARS).collect())),
    }
}

fn transport_error(err: &reqwest::Error) -> RelayError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("request failed: {err}")
    };
    RelayError::Transport {
        message,
        status_code: err.status().map(|s| s.as_u16()),
        detail: None,
    }
}

fn idle_timeout_error(idle: Duration) -> RelayError {
    RelayError::transport(format!(
        "timed out after {idle:?} without data from the flow API"
    ))
}
