//! SSE frame decoding
//!
//! The execution service answers with newline-delimited server-sent events.
//! Only single-line `data:` frames are recognised: every non-empty `data:`
//! line becomes one [`Frame`], everything else (blank lines, `event:`/`id:`
//! fields, comments) is ignored. A payload that is not valid JSON still
//! produces a frame, with `decoded` left empty, so one bad line never ends an
//! otherwise healthy stream.

use std::pin::Pin;

use bytes::{Buf, Bytes};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;

use crate::error::RelayError;

const DATA_PREFIX: &[u8] = b"data:";

/// One unit of the upstream stream
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Trimmed payload of the `data:` line
    pub raw: String,
    /// Payload decoded as JSON, absent when decoding failed
    pub decoded: Option<Value>,
}

impl Frame {
    pub fn is_decoded(&self) -> bool {
        self.decoded.is_some()
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, RelayError>> + Send>>;

/// Payload bytes of a `data:` line, or `None` for any other line.
pub fn data_payload(line: &[u8]) -> Option<&[u8]> {
    line.strip_prefix(DATA_PREFIX)
}

/// Build a frame from one raw line.
///
/// A trailing `\r` is dropped. Returns `None` for lines that carry no frame
/// (non-data lines and data lines whose payload is blank).
pub fn frame_from_line(line: &[u8]) -> Option<Frame> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = data_payload(line)?;

    let text = match std::str::from_utf8(payload) {
        Ok(text) => text.trim(),
        Err(e) => {
            let raw = String::from_utf8_lossy(payload).trim().to_string();
            tracing::warn!(target: "flow_relay::frame", error=%e, "SSE data line is not valid UTF-8");
            return Some(Frame { raw, decoded: None });
        }
    };
    if text.is_empty() {
        return None;
    }

    let decoded = match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(value),
        Err(e) => {
            let err = RelayError::FrameDecode(e.to_string());
            tracing::warn!(target: "flow_relay::frame", frame=%text, error=%err, "Failed to decode SSE data JSON");
            None
        }
    };

    Some(Frame {
        raw: text.to_string(),
        decoded,
    })
}

/// Convert a byte stream into a lazy stream of frames.
///
/// Lines are split on `\n` as bytes, so a line that is not valid UTF-8 only
/// spoils its own frame. A final unterminated line is still decoded. A
/// transport error from the byte stream is yielded once and ends the frame
/// stream.
pub fn decode_frames<S, B>(byte_stream: S) -> FrameStream
where
    S: Stream<Item = Result<B, RelayError>> + Send + 'static,
    B: Buf + Send + 'static,
{
    let reader = StreamReader::new(Box::pin(
        byte_stream.map(|chunk| chunk.map_err(std::io::Error::other)),
    ));
    let mut lines = Box::pin(FramedRead::new(
        reader,
        AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new()),
    ));

    let out = async_stream::stream! {
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Some(frame) = frame_from_line(&line) {
                        yield Ok(frame);
                    }
                }
                Err(e) => {
                    yield Err(line_error(e));
                    return;
                }
            }
        }
    };

    Box::pin(out)
}

/// Recover the error that interrupted line reading.
fn line_error(err: AnyDelimiterCodecError) -> RelayError {
    match err {
        AnyDelimiterCodecError::Io(io) => {
            let message = io.to_string();
            match io.into_inner().map(|inner| inner.downcast::<RelayError>()) {
                Some(Ok(relay)) => *relay,
                _ => RelayError::transport(message),
            }
        }
        other => RelayError::transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    async fn collect(
        chunks: Vec<std::result::Result<&'static [u8], RelayError>>,
    ) -> Vec<std::result::Result<Frame, RelayError>> {
        decode_frames(futures_util::stream::iter(chunks))
            .collect()
            .await
    }

    #[tokio::test]
    async fn strips_crlf_and_keeps_final_unterminated_line() {
        let frames = collect(vec![
            Ok(b"data: {\"a\"".as_slice()),
            Ok(b":1}\r\n\r\ndata: {\"b\":2}".as_slice()),
        ])
        .await;

        let values: Vec<Value> = frames
            .into_iter()
            .map(|f| f.unwrap().decoded.unwrap())
            .collect();
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn trailing_carriage_return_is_not_part_of_payload() {
        let frame = frame_from_line(b"data: \"x\"\r").unwrap();
        assert_eq!(frame.raw, "\"x\"");
        assert!(frame_from_line(b"\r").is_none());
    }

    #[test]
    fn ignores_non_data_lines() {
        assert!(frame_from_line(b"").is_none());
        assert!(frame_from_line(b": keep-alive").is_none());
        assert!(frame_from_line(b"event: token").is_none());
        assert!(frame_from_line(b" data: {}").is_none());
        assert!(frame_from_line(b"data:   ").is_none());
    }

    #[test]
    fn trims_payload_and_decodes_scalars() {
        let frame = frame_from_line(b"data:   \"hello\"  ").unwrap();
        assert_eq!(frame.raw, "\"hello\"");
        assert_eq!(frame.decoded, Some(json!("hello")));

        let frame = frame_from_line(b"data:[1,2]").unwrap();
        assert_eq!(frame.decoded, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn yields_frames_across_chunk_boundaries() {
        let frames = collect(vec![
            Ok(b"event: message\ndata: {\"chu".as_slice()),
            Ok(b"nk\":\"Hel\"}\n\n".as_slice()),
            Ok(b"data: {\"chunk\":\"lo\"}".as_slice()),
        ])
        .await;

        let values: Vec<Value> = frames
            .into_iter()
            .map(|f| f.unwrap().decoded.unwrap())
            .collect();
        assert_eq!(values, vec![json!({"chunk": "Hel"}), json!({"chunk": "lo"})]);
    }

    #[tokio::test]
    async fn consecutive_data_lines_are_separate_frames() {
        let frames = collect(vec![Ok(b"data: 1\ndata: 2\n\n".as_slice())]).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().decoded, Some(json!(1)));
        assert_eq!(frames[1].as_ref().unwrap().decoded, Some(json!(2)));
    }

    #[tokio::test]
    #[traced_test]
    async fn malformed_frame_is_kept_undecoded_and_stream_continues() {
        let frames = collect(vec![Ok(
            b"data: {not-json}\n\ndata: {\"ok\":true}\n\n".as_slice(),
        )])
        .await;

        assert_eq!(frames.len(), 2);
        let bad = frames[0].as_ref().unwrap();
        assert_eq!(bad.raw, "{not-json}");
        assert!(!bad.is_decoded());
        assert!(frames[1].as_ref().unwrap().is_decoded());
        assert!(logs_contain("Failed to decode SSE data JSON"));
    }

    #[tokio::test]
    async fn transport_error_ends_stream_after_earlier_frames() {
        let frames = collect(vec![
            Ok(b"data: {\"n\":1}\n".as_slice()),
            Err(RelayError::transport("connection reset")),
            Ok(b"data: {\"n\":2}\n".as_slice()),
        ])
        .await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        match &frames[1] {
            Err(err @ RelayError::Transport { .. }) => {
                assert!(err.to_string().contains("connection reset"))
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_payload_is_undecoded() {
        let frames = collect(vec![Ok(b"data: \xff\xfe\n".as_slice())]).await;
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].as_ref().unwrap().is_decoded());
    }
}
