use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CallId, MessageId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        call_id: CallId,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        call_id: CallId,
        tool_name: String,
        result: Value,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
    pub is_complete: bool,
    /// Set on user messages that have not yet reached the server.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_send: bool,
}

impl Message {
    /// A complete user message awaiting delivery.
    pub fn user_text(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            parts: vec![MessagePart::Text { text: text.into() }],
            created_at,
            is_complete: true,
            pending_send: true,
        }
    }

    /// An empty, in-progress message opened by the first event that names it.
    pub fn opened(id: MessageId, role: Role, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            parts: Vec::new(),
            created_at,
            is_complete: false,
            pending_send: false,
        }
    }

    /// Concatenated text of all text parts.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_call(&self, call_id: &CallId) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolCall { call_id: id, .. } if id == call_id))
    }

    pub fn has_tool_result(&self, call_id: &CallId) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolResult { call_id: id, .. } if id == call_id))
    }
}
