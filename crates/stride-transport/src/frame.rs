//! Server-sent-event framing for the session stream.
//!
//! Each frame is a block of `field: value` lines terminated by a blank
//! line. `id` carries the event sequence, `event` the kind and `data` a
//! JSON payload. Bytes after the last blank line are an incomplete frame
//! and are never decoded.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use stride_core::{CallId, MessageId, StreamErrorReason, StreamEvent};
use tracing::debug;

/// One raw frame before payload decoding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Split a complete frame block into its fields. Comment lines (`:`) and
/// unknown fields are skipped; repeated `data` lines are joined with `\n`.
pub fn parse_frame(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => frame.id = Some(value.to_string()),
            "event" => frame.event = value.to_string(),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    frame.data = data_lines.join("\n");
    if frame.event.is_empty() && frame.data.is_empty() {
        return None;
    }
    if frame.event.is_empty() {
        frame.event = "message".into();
    }
    Some(frame)
}

#[derive(Deserialize)]
struct DeltaPayload {
    message_id: MessageId,
    part_index: usize,
    text: String,
}

#[derive(Deserialize)]
struct ToolCallPayload {
    message_id: MessageId,
    call_id: CallId,
    tool_name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
struct ToolResultPayload {
    message_id: MessageId,
    call_id: CallId,
    tool_name: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct CompletePayload {
    message_id: MessageId,
}

#[derive(Deserialize)]
struct ErrorPayload {
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

/// Map a server-reported error kind onto the transport taxonomy.
fn error_reason(payload: ErrorPayload) -> StreamErrorReason {
    match payload.kind.as_str() {
        "network" => StreamErrorReason::Network(payload.message),
        "server_unavailable" => StreamErrorReason::ServerUnavailable(payload.message),
        "rate_limited" => StreamErrorReason::RateLimited {
            retry_after: payload.retry_after_ms.map(Duration::from_millis),
        },
        "auth_expired" => StreamErrorReason::AuthExpired(payload.message),
        other => StreamErrorReason::MalformedFrame(format!(
            "unknown error kind {other:?}: {}",
            payload.message
        )),
    }
}

fn payload<T: for<'de> Deserialize<'de>>(frame: &SseFrame) -> Result<T, StreamErrorReason> {
    serde_json::from_str(&frame.data).map_err(|e| {
        StreamErrorReason::MalformedFrame(format!("bad {} payload: {e}", frame.event))
    })
}

fn sequence(frame: &SseFrame) -> Result<u64, StreamErrorReason> {
    frame
        .id
        .as_deref()
        .and_then(|id| id.trim().parse::<u64>().ok())
        // The resume point is `seq + 1`, so the top id is unusable.
        .filter(|seq| *seq < u64::MAX)
        .ok_or_else(|| {
            StreamErrorReason::MalformedFrame(format!(
                "{} frame without a usable sequence id: {:?}",
                frame.event, frame.id
            ))
        })
}

/// Decode one frame. `Ok(None)` for keep-alives.
pub fn decode_frame(frame: &SseFrame) -> Result<Option<StreamEvent>, StreamErrorReason> {
    let event = match frame.event.as_str() {
        "ping" => return Ok(None),
        "delta" => {
            let p: DeltaPayload = payload(frame)?;
            StreamEvent::Delta {
                seq: sequence(frame)?,
                message_id: p.message_id,
                part_index: p.part_index,
                text_chunk: p.text,
            }
        }
        "tool_call" => {
            let p: ToolCallPayload = payload(frame)?;
            StreamEvent::ToolCall {
                seq: sequence(frame)?,
                message_id: p.message_id,
                call_id: p.call_id,
                tool_name: p.tool_name,
                args: p.args,
            }
        }
        "tool_result" => {
            let p: ToolResultPayload = payload(frame)?;
            StreamEvent::ToolResult {
                seq: sequence(frame)?,
                message_id: p.message_id,
                call_id: p.call_id,
                tool_name: p.tool_name,
                result: p.result,
            }
        }
        "message_complete" => {
            let p: CompletePayload = payload(frame)?;
            StreamEvent::MessageComplete {
                seq: sequence(frame)?,
                message_id: p.message_id,
            }
        }
        "end" => StreamEvent::StreamEnd,
        "error" => StreamEvent::StreamError {
            reason: error_reason(payload(frame)?),
        },
        other => {
            return Err(StreamErrorReason::MalformedFrame(format!(
                "unknown event kind {other:?}"
            )))
        }
    };
    Ok(Some(event))
}

/// Incremental decoder over raw bytes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and decode every frame they complete. A malformed frame
    /// yields a terminal `StreamError` and nothing after it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, sep_len)) = find_frame_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).collect();
            let text = match std::str::from_utf8(&block[..end]) {
                Ok(text) => text,
                Err(err) => {
                    events.push(StreamEvent::StreamError {
                        reason: StreamErrorReason::MalformedFrame(format!(
                            "frame is not valid UTF-8: {err}"
                        )),
                    });
                    self.buffer.clear();
                    break;
                }
            };
            let Some(frame) = parse_frame(text) else {
                continue;
            };
            match decode_frame(&frame) {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        self.buffer.clear();
                        break;
                    }
                }
                Ok(None) => {}
                Err(reason) => {
                    events.push(StreamEvent::StreamError { reason });
                    self.buffer.clear();
                    break;
                }
            }
        }
        events
    }

    /// Bytes waiting for a frame terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// End of input: drop any incomplete trailing frame.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            debug!(bytes = self.buffer.len(), "discarding partial frame at stream end");
            self.buffer.clear();
        }
    }
}

/// Position of the first blank-line terminator and its length.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELTA: &str = "id: 1\nevent: delta\ndata: {\"message_id\":\"m1\",\"part_index\":0,\"text\":\"Hi\"}\n\n";

    #[test]
    fn parse_frame_fields() {
        let frame = parse_frame("id: 7\nevent: delta\ndata: {}\n").unwrap();
        assert_eq!(frame.id.as_deref(), Some("7"));
        assert_eq!(frame.event, "delta");
        assert_eq!(frame.data, "{}");
    }

    #[test]
    fn parse_frame_joins_data_and_skips_comments() {
        let frame = parse_frame(": keep-alive\nevent: x\ndata: a\ndata: b\n").unwrap();
        assert_eq!(frame.data, "a\nb");
        assert!(parse_frame(": only a comment\n").is_none());
    }

    #[test]
    fn decodes_all_kinds() {
        let mut decoder = FrameDecoder::new();
        let raw = format!(
            "{DELTA}\
             id: 2\nevent: tool_call\ndata: {{\"message_id\":\"m1\",\"call_id\":\"c1\",\"tool_name\":\"plan\",\"args\":{{\"weeks\":8}}}}\n\n\
             id: 3\nevent: tool_result\ndata: {{\"message_id\":\"m1\",\"call_id\":\"c1\",\"tool_name\":\"plan\",\"result\":\"ok\"}}\n\n\
             id: 4\nevent: message_complete\ndata: {{\"message_id\":\"m1\"}}\n\n\
             event: end\ndata: {{}}\n\n"
        );
        let events = decoder.push(raw.as_bytes());
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["delta", "tool_call", "tool_result", "message_complete", "end"]
        );
        assert_eq!(events[3].seq(), Some(4));
    }

    #[test]
    fn frames_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        let (a, b) = DELTA.as_bytes().split_at(20);
        assert!(decoder.push(a).is_empty());
        assert!(decoder.pending_bytes() > 0);
        let events = decoder.push(b);
        assert_eq!(events.len(), 1);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn multibyte_text_split_mid_character() {
        let raw = "id: 1\nevent: delta\ndata: {\"message_id\":\"m1\",\"part_index\":0,\"text\":\"🏃\"}\n\n";
        let bytes = raw.as_bytes();
        let cut = raw.find('🏃').unwrap() + 2;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..cut]).is_empty());
        let events = decoder.push(&bytes[cut..]);
        assert!(matches!(&events[0], StreamEvent::Delta { text_chunk, .. } if text_chunk == "🏃"));
    }

    #[test]
    fn partial_frame_at_end_is_discarded() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"id: 1\nevent: delta\ndata: {\"message_id\":\"m1\"");
        assert!(events.is_empty());
        decoder.finish();
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn crlf_terminators() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"event: end\r\ndata: {}\r\n\r\n");
        assert_eq!(events, vec![StreamEvent::StreamEnd]);
    }

    #[test]
    fn ping_is_ignored() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"event: ping\ndata: {}\n\n").is_empty());
    }

    #[test]
    fn bad_json_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"id: 1\nevent: delta\ndata: {oops\n\nevent: end\n\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::StreamError { reason: StreamErrorReason::MalformedFrame(_) }
        ));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"id: 1\nevent: telepathy\ndata: {}\n\n");
        assert!(matches!(
            &events[0],
            StreamEvent::StreamError { reason: StreamErrorReason::MalformedFrame(msg) } if msg.contains("telepathy")
        ));
    }

    #[test]
    fn missing_sequence_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"event: message_complete\ndata: {\"message_id\":\"m1\"}\n\n");
        assert!(matches!(
            &events[0],
            StreamEvent::StreamError { reason: StreamErrorReason::MalformedFrame(_) }
        ));
    }

    #[test]
    fn top_sequence_id_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let raw = format!(
            "id: {}\nevent: message_complete\ndata: {{\"message_id\":\"m1\"}}\n\n",
            u64::MAX
        );
        let events = decoder.push(raw.as_bytes());
        assert!(matches!(
            &events[0],
            StreamEvent::StreamError { reason: StreamErrorReason::MalformedFrame(_) }
        ));

        let raw = format!(
            "id: {}\nevent: message_complete\ndata: {{\"message_id\":\"m1\"}}\n\n",
            u64::MAX - 1
        );
        assert_eq!(FrameDecoder::new().push(raw.as_bytes())[0].seq(), Some(u64::MAX - 1));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut decoder = FrameDecoder::new();
        let mut raw = b"id: 1\nevent: delta\ndata: {\"message_id\":\"m1\",\"part_index\":0,\"text\":\"".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe]);
        raw.extend_from_slice(b"\"}\n\n");
        raw.extend_from_slice(DELTA.as_bytes());
        let events = decoder.push(&raw);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            StreamEvent::StreamError { reason: StreamErrorReason::MalformedFrame(msg) } if msg.contains("UTF-8")
        ));
    }

    #[test]
    fn server_error_kinds() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(
            b"event: error\ndata: {\"kind\":\"rate_limited\",\"retry_after_ms\":3000}\n\n",
        );
        assert_eq!(
            events,
            vec![StreamEvent::StreamError {
                reason: StreamErrorReason::RateLimited {
                    retry_after: Some(Duration::from_secs(3))
                }
            }]
        );

        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"event: error\ndata: {\"kind\":\"auth_expired\",\"message\":\"token\"}\n\n");
        assert!(matches!(
            &events[0],
            StreamEvent::StreamError { reason: StreamErrorReason::AuthExpired(_) }
        ));
    }

    #[test]
    fn nothing_decoded_after_terminal() {
        let mut decoder = FrameDecoder::new();
        let raw = format!("event: end\ndata: {{}}\n\n{DELTA}");
        assert_eq!(decoder.push(raw.as_bytes()), vec![StreamEvent::StreamEnd]);
    }
}
