use serde_json::Value;

use crate::errors::StreamErrorReason;
use crate::ids::{CallId, MessageId};

/// Events decoded from one transport stream.
///
/// Data events carry the server-assigned sequence number used for ordering
/// and resume. `StreamEnd` and `StreamError` terminate the stream and are
/// never sequenced.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Delta {
        seq: u64,
        message_id: MessageId,
        part_index: usize,
        text_chunk: String,
    },
    ToolCall {
        seq: u64,
        message_id: MessageId,
        call_id: CallId,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        seq: u64,
        message_id: MessageId,
        call_id: CallId,
        tool_name: String,
        result: Value,
    },
    MessageComplete {
        seq: u64,
        message_id: MessageId,
    },
    StreamEnd,
    StreamError {
        reason: StreamErrorReason,
    },
}

impl StreamEvent {
    pub fn seq(&self) -> Option<u64> {
        match self {
            Self::Delta { seq, .. }
            | Self::ToolCall { seq, .. }
            | Self::ToolResult { seq, .. }
            | Self::MessageComplete { seq, .. } => Some(*seq),
            Self::StreamEnd | Self::StreamError { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StreamEnd | Self::StreamError { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::MessageComplete { .. } => "message_complete",
            Self::StreamEnd => "end",
            Self::StreamError { .. } => "error",
        }
    }
}
