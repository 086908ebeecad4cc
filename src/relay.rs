//! Job orchestration
//!
//! [`FlowRelay`] runs one job from its inbound payload to its terminal event:
//!
//! ```text
//! Decoding -> Invoking -> Streaming -> Terminated(End | Error)
//! ```
//!
//! A failure in any state goes straight to `Terminated(Error)`. Frames already
//! relayed stay relayed; exactly one terminal event is attempted per job.
//! Transcript writes happen around the run and never influence it.

use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::event::{EventEmitter, EventPublisher, TerminalKind};
use crate::extract::TranscriptBuffer;
use crate::frame::{FrameStream, decode_frames};
use crate::invoker::FlowInvoker;
use crate::job::{Job, RawJob, decode_job};
use crate::transcript::{TranscriptRecorder, TurnContext};

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Decoding,
    Invoking,
    Streaming,
    Terminated(TerminalKind),
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoding => f.write_str("decoding"),
            Self::Invoking => f.write_str("invoking"),
            Self::Streaming => f.write_str("streaming"),
            Self::Terminated(TerminalKind::End) => f.write_str("terminated(end)"),
            Self::Terminated(TerminalKind::Error) => f.write_str("terminated(error)"),
        }
    }
}

/// What happened to a job
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Id echoed on the job's events (the sentinel when it could not be read)
    pub execution_id: String,
    pub terminal: TerminalKind,
    /// `stream` events emitted before the terminal event
    pub stream_events: usize,
    /// Frames dropped because their payload was not valid JSON
    pub skipped_frames: usize,
    /// Text accumulated from the relayed frames
    pub transcript: String,
    /// The error behind an `Error` terminal
    pub error: Option<RelayError>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.terminal == TerminalKind::End
    }
}

/// Streaming job bridge
#[derive(Clone)]
pub struct FlowRelay {
    invoker: FlowInvoker,
    transcript: TranscriptRecorder,
    publisher: Arc<dyn EventPublisher>,
}

impl FlowRelay {
    pub fn new(
        invoker: FlowInvoker,
        transcript: TranscriptRecorder,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            invoker,
            transcript,
            publisher,
        }
    }

    /// Wire a relay from configuration: one shared HTTP client for the flow
    /// API and the document store.
    pub fn from_config(config: &RelayConfig, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let http = FlowInvoker::build_http_client(&config.flow_api)?;
        let invoker = FlowInvoker::new(config.flow_api.clone(), http.clone());
        let transcript = TranscriptRecorder::from_config(&config.transcript, http);
        Ok(Self::new(invoker, transcript, publisher))
    }

    /// Process one inbound job to completion.
    ///
    /// Always returns once a terminal event has been attempted; the caller
    /// acknowledges the inbound message whatever the outcome.
    ///
    /// The user-turn transcript write runs in the background while the flow
    /// is invoked. It is joined before the closing turn is written, so the
    /// returned report implies both writes were attempted.
    pub async fn handle(&self, raw: impl Into<RawJob>) -> JobReport {
        let job = match decode_job(raw.into()) {
            Ok(job) => job,
            Err(failure) => {
                let execution_id = failure.echo_id().to_string();
                tracing::error!(
                    target: "flow_relay::relay",
                    execution_id=%execution_id,
                    state=%JobState::Decoding,
                    error=%failure.error,
                    "Rejected inbound job"
                );
                let mut emitter = EventEmitter::new(self.publisher.clone(), execution_id.clone());
                emitter.error(&failure.error).await;
                return JobReport {
                    execution_id,
                    terminal: TerminalKind::Error,
                    stream_events: 0,
                    skipped_frames: 0,
                    transcript: String::new(),
                    error: Some(failure.error),
                };
            }
        };

        let span = tracing::info_span!(
            "job",
            execution_id = %job.execution_id,
            flow_id = %job.flow_id
        );
        self.run(job).instrument(span).await
    }

    async fn run(&self, job: Job) -> JobReport {
        tracing::info!(target: "flow_relay::relay", user_id=%job.user_id, "Received job");

        let mut emitter = EventEmitter::new(self.publisher.clone(), job.execution_id.clone());
        let mut buffer = TranscriptBuffer::new();
        let mut skipped_frames = 0usize;

        let turn = TurnContext {
            conversation_id: job.conversation_id(),
            user_id: &job.user_id,
            metadata: transcript_metadata(&job),
        };
        let user_turn = self.spawn_user_turn(&job);

        let mut state = JobState::Invoking;
        tracing::debug!(target: "flow_relay::relay", state=%state, "state transition");

        let outcome = match self.invoker.invoke(&job).await {
            Ok(bytes) => {
                state = JobState::Streaming;
                tracing::debug!(target: "flow_relay::relay", state=%state, "state transition");
                self.relay_frames(
                    decode_frames(bytes),
                    &mut emitter,
                    &mut buffer,
                    &mut skipped_frames,
                )
                .await
            }
            Err(e) => Err(e),
        };

        let terminal = match &outcome {
            Ok(()) => {
                tracing::info!(
                    target: "flow_relay::relay",
                    stream_events=emitter.stream_events(),
                    skipped_frames,
                    "Flow stream finished"
                );
                emitter.end().await;
                TerminalKind::End
            }
            Err(e) => {
                tracing::error!(
                    target: "flow_relay::relay",
                    state=%state,
                    stream_events=emitter.stream_events(),
                    status_code=?e.status_code(),
                    error=%e,
                    "Job failed"
                );
                emitter.error(e).await;
                TerminalKind::Error
            }
        };
        tracing::debug!(target: "flow_relay::relay", state=%JobState::Terminated(terminal), "state transition");

        if let Some(handle) = user_turn {
            if let Err(e) = handle.await {
                tracing::warn!(target: "flow_relay::relay", error=%e, "User turn write task failed");
            }
        }

        match &outcome {
            Ok(()) => {
                if !buffer.is_empty() {
                    self.transcript
                        .record_assistant_turn(&turn, buffer.as_str())
                        .await;
                }
            }
            Err(e) => {
                let payload = serde_json::to_string(&e.to_error_payload())
                    .unwrap_or_else(|_| e.to_string());
                self.transcript.record_error_turn(&turn, &payload).await;
            }
        }

        JobReport {
            execution_id: job.execution_id.clone(),
            terminal,
            stream_events: emitter.stream_events(),
            skipped_frames,
            transcript: buffer.into_string(),
            error: outcome.err(),
        }
    }

    /// Start the user-turn write without waiting for it.
    fn spawn_user_turn(&self, job: &Job) -> Option<JoinHandle<()>> {
        let text = job.user_text()?.to_string();
        let recorder = self.transcript.clone();
        let conversation_id = job.conversation_id().map(str::to_string);
        let user_id = job.user_id.clone();
        let metadata = transcript_metadata(job);

        let write = async move {
            let turn = TurnContext {
                conversation_id: conversation_id.as_deref(),
                user_id: &user_id,
                metadata,
            };
            recorder.record_user_turn(&turn, &text).await;
        };
        Some(tokio::spawn(write.in_current_span()))
    }

    /// Relay every decoded frame until the stream ends or fails.
    async fn relay_frames(
        &self,
        mut frames: FrameStream,
        emitter: &mut EventEmitter,
        buffer: &mut TranscriptBuffer,
        skipped_frames: &mut usize,
    ) -> Result<()> {
        while let Some(item) = frames.next().await {
            let frame = item?;
            let Some(value) = frame.decoded else {
                *skipped_frames += 1;
                continue;
            };
            buffer.absorb(&value);
            emitter.stream(&value).await?;
        }
        Ok(())
    }
}

fn transcript_metadata(job: &Job) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "executionId".to_string(),
        Value::String(job.execution_id.clone()),
    );
    if let Some(agent_id) = &job.agent_id {
        metadata.insert("agentId".to_string(), Value::String(agent_id.clone()));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowApiConfig;
    use crate::event::{ChannelPublisher, EventKind, OutboundEvent};
    use crate::job::UNKNOWN_EXECUTION_ID;
    use crate::transcript::{MemoryTranscriptStore, TranscriptMessage, TranscriptStore};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn relay_without_api() -> (FlowRelay, mpsc::UnboundedReceiver<OutboundEvent>, Arc<MemoryTranscriptStore>) {
        let (publisher, rx) = ChannelPublisher::channel();
        let store = Arc::new(MemoryTranscriptStore::new());
        let relay = FlowRelay::new(
            FlowInvoker::new(FlowApiConfig::default(), reqwest::Client::new()),
            TranscriptRecorder::new(store.clone(), true),
            Arc::new(publisher),
        );
        (relay, rx, store)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn undecodable_job_reports_sentinel_id() {
        let (relay, mut rx, _) = relay_without_api();
        let report = relay.handle(json!({"userId": "u", "flowId": "f"})).await;

        assert_eq!(report.execution_id, UNKNOWN_EXECUTION_ID);
        assert_eq!(report.terminal, TerminalKind::Error);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].execution_id, UNKNOWN_EXECUTION_ID);
        assert_eq!(events[0].kind, EventKind::Error);
    }

    #[tokio::test]
    async fn missing_configuration_is_an_error_terminal() {
        let (relay, mut rx, store) = relay_without_api();
        let report = relay
            .handle(json!({
                "executionId": "e9",
                "userId": "u",
                "flowId": "f",
                "inputs": {"input_value": "hi", "conversation_id": "c1"}
            }))
            .await;

        assert!(matches!(report.error, Some(RelayError::Configuration(_))));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].execution_id, "e9");
        assert_eq!(events[0].kind, EventKind::Error);
        let payload = events[0].payload_json().unwrap();
        assert!(payload["message"].as_str().unwrap().contains("Configuration error"));
        assert!(payload.get("status_code").is_none());

        let roles: Vec<_> = store.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![crate::transcript::Role::User, crate::transcript::Role::Error]
        );
    }

    #[tokio::test]
    async fn relays_frames_and_skips_undecoded_ones() {
        let (relay, mut rx, _) = relay_without_api();
        let mut emitter = EventEmitter::new(relay.publisher.clone(), "e1");
        let mut buffer = TranscriptBuffer::new();
        let mut skipped = 0;

        let bytes: Vec<std::result::Result<&'static [u8], RelayError>> = vec![Ok(
            b"data: {\"chunk\":\"a\"}\ndata: nope\ndata: {\"text\":\"b\"}\n".as_slice(),
        )];
        relay
            .relay_frames(
                decode_frames(futures_util::stream::iter(bytes)),
                &mut emitter,
                &mut buffer,
                &mut skipped,
            )
            .await
            .unwrap();

        assert_eq!(skipped, 1);
        assert_eq!(buffer.as_str(), "ab");
        assert_eq!(drain(&mut rx).len(), 2);
    }

    /// Holds every write until a permit is released.
    struct GatedStore {
        gate: tokio::sync::Semaphore,
        inner: MemoryTranscriptStore,
    }

    #[async_trait::async_trait]
    impl TranscriptStore for GatedStore {
        async fn write(&self, message: &TranscriptMessage) -> Result<()> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| RelayError::Persistence(e.to_string()))?;
            self.inner.write(message).await
        }
    }

    #[tokio::test]
    async fn slow_user_turn_write_does_not_hold_back_the_job() {
        let (publisher, mut rx) = ChannelPublisher::channel();
        let store = Arc::new(GatedStore {
            gate: tokio::sync::Semaphore::new(0),
            inner: MemoryTranscriptStore::new(),
        });
        let relay = FlowRelay::new(
            FlowInvoker::new(FlowApiConfig::default(), reqwest::Client::new()),
            TranscriptRecorder::new(store.clone(), true),
            Arc::new(publisher),
        );

        let job = json!({
            "executionId": "e5",
            "userId": "u",
            "flowId": "f",
            "inputs": {"input_value": "hi", "conversation_id": "c1"}
        });
        let task = tokio::spawn(async move { relay.handle(job).await });

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("terminal event while the user turn is still pending")
            .unwrap();
        assert_eq!(event.kind, EventKind::Error);
        assert!(store.inner.messages().is_empty());

        store.gate.add_permits(2);
        let report = task.await.unwrap();
        assert_eq!(report.terminal, TerminalKind::Error);

        let roles: Vec<_> = store.inner.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![crate::transcript::Role::User, crate::transcript::Role::Error]
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(JobState::Streaming.to_string(), "streaming");
        assert_eq!(
            JobState::Terminated(TerminalKind::Error).to_string(),
            "terminated(error)"
        );
    }
}
