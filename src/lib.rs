//! # flow-relay
//!
//! Streaming job bridge: accepts one job request, opens a long-lived streaming
//! call to a flow execution service, decodes the server-sent event stream it
//! answers with, and relays every decoded frame downstream as a typed event.
//! Each job ends with exactly one `end` or `error` event. Assistant output can
//! optionally be archived as a conversation transcript.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flow_relay::{ChannelPublisher, FlowRelay, RelayConfig};
//!
//! let config = RelayConfig::from_env()?;
//! let (publisher, mut events) = ChannelPublisher::channel();
//! let relay = FlowRelay::from_config(&config, Arc::new(publisher))?;
//!
//! let report = relay.handle(serde_json::json!({
//!     "executionId": "e1",
//!     "userId": "u1",
//!     "flowId": "f1",
//!     "inputs": {"input_value": "hi"}
//! })).await;
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod event;
pub mod extract;
pub mod frame;
pub mod invoker;
pub mod job;
pub mod relay;
pub mod telemetry;
pub mod transcript;

pub use config::{FlowApiConfig, RelayConfig, TranscriptConfig};
pub use error::{RelayError, Result};
pub use event::{
    ChannelPublisher, EventEmitter, EventKind, EventPublisher, JsonLinesPublisher, OutboundEvent,
    TerminalKind,
};
pub use extract::{TranscriptBuffer, extract_text};
pub use frame::{Frame, decode_frames};
pub use invoker::FlowInvoker;
pub use job::{Job, RawJob, UNKNOWN_EXECUTION_ID, decode_job};
pub use relay::{FlowRelay, JobReport, JobState};
pub use transcript::{
    DocumentStoreRecorder, MemoryTranscriptStore, NoopTranscriptStore, Role, TranscriptMessage,
    TranscriptRecorder, TranscriptStore,
};
