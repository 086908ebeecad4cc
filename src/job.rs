//! Inbound job decoding
//!
//! Turns an inbound request body into a typed [`Job`]. The body arrives either
//! as an already-decoded JSON value or as raw bytes holding JSON.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::error::RelayError;

/// Execution id echoed on events when the inbound job has none.
pub const UNKNOWN_EXECUTION_ID: &str = "unknown_execution";

/// Input fields probed, in order, for the user's message text.
const USER_TEXT_FIELDS: &[&str] = &["input_value", "input", "query", "text"];

/// Input fields probed, in order, for the conversation identifier.
const CONVERSATION_FIELDS: &[&str] = &["conversation_id", "conversationId"];

/// Inbound job body as delivered by the messaging platform
#[derive(Debug, Clone)]
pub enum RawJob {
    Json(Value),
    Bytes(Bytes),
}

impl From<Value> for RawJob {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<u8>> for RawJob {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for RawJob {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&str> for RawJob {
    fn from(text: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(text.as_bytes()))
    }
}

/// One request to execute a flow and relay its output
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub execution_id: String,
    pub user_id: String,
    pub flow_id: String,
    pub agent_id: Option<String>,
    pub inputs: Map<String, Value>,
    pub credentials: BTreeMap<String, String>,
}

impl Job {
    /// Conversation this job belongs to, taken from the inputs.
    pub fn conversation_id(&self) -> Option<&str> {
        CONVERSATION_FIELDS
            .iter()
            .filter_map(|key| self.inputs.get(*key))
            .filter_map(Value::as_str)
            .find(|id| !id.is_empty())
    }

    /// The user's message text, taken from the first populated text input.
    pub fn user_text(&self) -> Option<&str> {
        USER_TEXT_FIELDS
            .iter()
            .filter_map(|key| self.inputs.get(*key))
            .filter_map(Value::as_str)
            .find(|text| !text.is_empty())
    }
}

/// Failure to decode a job.
///
/// Keeps the execution id when it could be read, so the error event can still
/// be correlated.
#[derive(Debug, Clone)]
pub struct JobDecodeFailure {
    pub execution_id: Option<String>,
    pub error: RelayError,
}

impl JobDecodeFailure {
    fn new(execution_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            error: RelayError::Decode(message.into()),
        }
    }

    /// Execution id to echo, falling back to [`UNKNOWN_EXECUTION_ID`].
    pub fn echo_id(&self) -> &str {
        self.execution_id.as_deref().unwrap_or(UNKNOWN_EXECUTION_ID)
    }
}

/// Decode and normalize an inbound job. Has no side effects.
pub fn decode_job(raw: RawJob) -> std::result::Result<Job, JobDecodeFailure> {
    let value = match raw {
        RawJob::Json(value) => value,
        RawJob::Bytes(bytes) => {
            let text = std::str::from_utf8(&bytes).map_err(|e| {
                JobDecodeFailure::new(None, format!("job body is not valid UTF-8: {e}"))
            })?;
            serde_json::from_str(text).map_err(|e| {
                JobDecodeFailure::new(None, format!("job body is not valid JSON: {e}"))
            })?
        }
    };

    let mut fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(JobDecodeFailure::new(
                None,
                format!("expected a JSON object, got {}", type_name(&other)),
            ));
        }
    };

    let execution_id = required_string(&fields, "executionId")
        .map_err(|msg| JobDecodeFailure::new(None, msg))?;
    let fail = |msg: String| JobDecodeFailure::new(Some(execution_id.clone()), msg);

    let user_id = required_string(&fields, "userId").map_err(fail)?;
    let flow_id = required_string(&fields, "flowId")
        .or_else(|_| required_string(&fields, "langflowFlowId"))
        .map_err(|_| fail("missing required field: flowId".to_string()))?;
    let agent_id = fields
        .get("agentId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let inputs = match fields.remove("inputs") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(fail(format!(
                "field 'inputs' must be an object, got {}",
                type_name(&other)
            )));
        }
    };

    let credentials = match fields.remove("credentials") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => {
            let mut out = BTreeMap::new();
            for (key, value) in map {
                let Value::String(secret) = value else {
                    return Err(fail(format!("credential '{key}' must be a string")));
                };
                out.insert(key, secret);
            }
            out
        }
        Some(other) => {
            return Err(fail(format!(
                "field 'credentials' must be an object, got {}",
                type_name(&other)
            )));
        }
    };

    Ok(Job {
        execution_id,
        user_id,
        flow_id,
        agent_id,
        inputs,
        credentials,
    })
}

fn required_string(fields: &Map<String, Value>, key: &str) -> std::result::Result<String, String> {
    match fields.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(format!("missing required field: {key}"))
        }
        Some(other) => Err(format!(
            "field '{key}' must be a string, got {}",
            type_name(other)
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convenience for callers that only need the error.
impl From<JobDecodeFailure> for RelayError {
    fn from(failure: JobDecodeFailure) -> Self {
        failure.error
    }
}
