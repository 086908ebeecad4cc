//! Outbound events
//!
//! Every job produces zero or more `stream` events followed by exactly one
//! terminal `end` or `error` event. [`EventEmitter`] owns that contract for a
//! single job; [`EventPublisher`] is the seam to the messaging platform.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use crate::error::{RelayError, Result};

/// Kind of outbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Stream,
    End,
    Error,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }
}

/// Outbound event envelope: `{executionId, type, payload}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEvent {
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Serialized JSON text
    pub payload: String,
}

impl OutboundEvent {
    /// Payload parsed back into JSON.
    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Destination for outbound events.
///
/// Implementations must preserve the order of events published for one job.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<()>;
}

/// Publishes into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self { tx }
    }

    /// Create a publisher together with its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| RelayError::Publish("event channel closed".to_string()))
    }
}

/// Writes each event as one JSON line to an async writer
pub struct JsonLinesPublisher<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> EventPublisher for JsonLinesPublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&line)
            .await
            .map_err(|e| RelayError::Publish(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| RelayError::Publish(format!("flush failed: {e}")))
    }
}

/// Outcome of a finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    End,
    Error,
}

/// Emits the events of one job.
///
/// Publish failures are logged and never stop processing. Once a terminal
/// event has been attempted, later emissions are refused.
pub struct EventEmitter {
    publisher: Arc<dyn EventPublisher>,
    execution_id: String,
    stream_events: usize,
    publish_failures: usize,
    terminal: Option<TerminalKind>,
}

impl EventEmitter {
    pub fn new(publisher: Arc<dyn EventPublisher>, execution_id: impl Into<String>) -> Self {
        Self {
            publisher,
            execution_id: execution_id.into(),
            stream_events: 0,
            publish_failures: 0,
            terminal: None,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Number of `stream` events emitted so far.
    pub fn stream_events(&self) -> usize {
        self.stream_events
    }

    pub fn publish_failures(&self) -> usize {
        self.publish_failures
    }

    pub fn terminal(&self) -> Option<TerminalKind> {
        self.terminal
    }

    /// Emit one decoded frame as a `stream` event.
    pub async fn stream(&mut self, value: &Value) -> Result<()> {
        if let Some(terminal) = self.terminal {
            return Err(RelayError::Internal(format!(
                "stream event after {terminal:?} terminal event"
            )));
        }
        let payload = serde_json::to_string(value)?;
        self.stream_events += 1;
        self.send(EventKind::Stream, payload).await;
        Ok(())
    }

    /// Emit the `end` terminal event. Returns `false` if the job was already terminated.
    pub async fn end(&mut self) -> bool {
        if !self.claim_terminal(TerminalKind::End) {
            return false;
        }
        let payload = json!({"status": "completed"}).to_string();
        self.send(EventKind::End, payload).await;
        true
    }

    /// Emit the `error` terminal event. Returns `false` if the job was already terminated.
    pub async fn error(&mut self, err: &RelayError) -> bool {
        if !self.claim_terminal(TerminalKind::Error) {
            return false;
        }
        let payload = match serde_json::to_string(&err.to_error_payload()) {
            Ok(payload) => payload,
            Err(_) => json!({"message": err.to_string()}).to_string(),
        };
        self.send(EventKind::Error, payload).await;
        true
    }

    fn claim_terminal(&mut self, kind: TerminalKind) -> bool {
        if let Some(existing) = self.terminal {
            tracing::warn!(
                target: "flow_relay::event",
                execution_id=%self.execution_id,
                existing=?existing,
                rejected=?kind,
                "terminal event already emitted"
            );
            return false;
        }
        self.terminal = Some(kind);
        true
    }

    async fn send(&mut self, kind: EventKind, payload: String) {
        let event = OutboundEvent {
            execution_id: self.execution_id.clone(),
            kind,
            payload,
        };
        if let Err(e) = self.publisher.publish(&event).await {
            self.publish_failures += 1;
            if kind.is_terminal() {
                tracing::error!(target: "flow_relay::event", execution_id=%self.execution_id, kind=?kind, error=%e, "Failed to publish terminal event");
            } else {
                tracing::warn!(target: "flow_relay::event", execution_id=%self.execution_id, error=%e, "Failed to publish stream event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct FailingPublisher;

    #[async_trait]
    impl EventPublisher for FailingPublisher {
        async fn publish(&self, _event: &OutboundEvent) -> Result<()> {
            Err(RelayError::Publish("broker unavailable".into()))
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn envelope_wire_format() {
        let event = OutboundEvent {
            execution_id: "e1".into(),
            kind: EventKind::Stream,
            payload: r#"{"chunk":"Hel"}"#.into(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(
            wire,
            json!({"executionId": "e1", "type": "stream", "payload": "{\"chunk\":\"Hel\"}"})
        );
    }

    #[tokio::test]
    async fn stream_then_end() {
        let (publisher, mut rx) = ChannelPublisher::channel();
        let mut emitter = EventEmitter::new(Arc::new(publisher), "e1");

        emitter.stream(&json!({"chunk": "Hel"})).await.unwrap();
        assert!(emitter.end().await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Stream);
        assert_eq!(events[0].payload, r#"{"chunk":"Hel"}"#);
        assert_eq!(events[1].kind, EventKind::End);
        assert_eq!(events[1].payload_json().unwrap(), json!({"status": "completed"}));
        assert_eq!(emitter.stream_events(), 1);
    }

    #[tokio::test]
    async fn terminal_is_emitted_at_most_once() {
        let (publisher, mut rx) = ChannelPublisher::channel();
        let mut emitter = EventEmitter::new(Arc::new(publisher), "e1");

        assert!(emitter.error(&RelayError::transport("connection reset")).await);
        assert!(!emitter.end().await);
        assert!(!emitter.error(&RelayError::Internal("again".into())).await);
        assert!(emitter.stream(&json!({"late": true})).await.is_err());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(emitter.terminal(), Some(TerminalKind::Error));
    }

    #[tokio::test]
    #[traced_test]
    async fn publish_failures_are_logged_not_fatal() {
        let mut emitter = EventEmitter::new(Arc::new(FailingPublisher), "e1");
        emitter.stream(&json!({"chunk": "x"})).await.unwrap();
        assert!(emitter.end().await);

        assert_eq!(emitter.publish_failures(), 2);
        assert!(logs_contain("Failed to publish stream event"));
        assert!(logs_contain("Failed to publish terminal event"));
    }

    #[tokio::test]
    async fn json_lines_publisher_writes_one_line_per_event() {
        let publisher = JsonLinesPublisher::new(Vec::<u8>::new());
        for kind in [EventKind::Stream, EventKind::End] {
            publisher
                .publish(&OutboundEvent {
                    execution_id: "e1".into(),
                    kind,
                    payload: "{}".into(),
                })
                .await
                .unwrap();
        }

        let written = String::from_utf8(publisher.into_inner()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let last: OutboundEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last.kind, EventKind::End);
    }
}
