//! Conversation session state and the reducer that folds stream events into it.
//!
//! [`SessionState::apply_event`] is deterministic: it performs no IO and the
//! only clock input is the `received_at` timestamp supplied by the caller.
//! Events are applied strictly in ascending sequence order. Events that
//! arrive ahead of a gap wait in a bounded reorder buffer; when the buffer
//! grows past the window, the gap is logged and skipped.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::StreamEvent;
use crate::ids::{CallId, MessageId, SessionId};
use crate::messages::{Message, MessagePart, Role};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Between turns; nothing expected from the server.
    #[default]
    Active,
    /// A user message was sent and the reply is still streaming.
    AwaitingReply,
    /// Terminal. The conversation is over and its persisted state may be dropped.
    Completed,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A tool result whose matching tool call has not been applied yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnmatchedToolResult {
    pub message_id: MessageId,
    pub call_id: CallId,
    pub tool_name: String,
    pub result: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PartAlias {
    message_id: MessageId,
    server_index: usize,
    local_index: usize,
}

/// Observable effect of applying one event.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// A part was appended or extended. For text parts `part` carries only
    /// the newly appended chunk; `opened` is true when the part is new.
    PartReceived {
        message_id: MessageId,
        part_index: usize,
        part: MessagePart,
        opened: bool,
    },
    MessageComplete {
        message_id: MessageId,
    },
    /// Sequences `from_seq..=to_seq` never arrived within the reorder window.
    GapSkipped {
        from_seq: u64,
        to_seq: u64,
    },
}

impl Applied {
    /// True for plain text growth that may be batched before persisting.
    pub fn is_text_delta(&self) -> bool {
        matches!(
            self,
            Self::PartReceived {
                part: MessagePart::Text { .. },
                opened: false,
                ..
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
    /// Highest contiguous sequence applied; 0 when nothing has been applied.
    pub last_applied_event_seq: u64,
    pub phase: SessionPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmatched_results: Vec<UnmatchedToolResult>,
    /// Server part indexes that arrived past the end of their message,
    /// mapped to the local part they opened.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    part_aliases: Vec<PartAlias>,
    #[serde(skip)]
    reorder_buffer: BTreeMap<u64, StreamEvent>,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            last_applied_event_seq: 0,
            phase: SessionPhase::Active,
            unmatched_results: Vec::new(),
            part_aliases: Vec::new(),
            reorder_buffer: BTreeMap::new(),
        }
    }

    /// Sequence number to request when (re)opening the stream.
    pub fn resume_from_seq(&self) -> u64 {
        self.last_applied_event_seq.saturating_add(1)
    }

    pub fn buffered_events(&self) -> usize {
        self.reorder_buffer.len()
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// User messages not yet delivered, oldest first.
    pub fn pending_messages(&self) -> Vec<Message> {
        self.messages.iter().filter(|m| m.pending_send).cloned().collect()
    }

    pub fn has_pending_send(&self) -> bool {
        self.messages.iter().any(|m| m.pending_send)
    }

    /// Append a complete user message marked `pending_send`.
    pub fn push_user_message(&mut self, text: impl Into<String>, at: DateTime<Utc>) -> MessageId {
        self.push_message(Message::user_text(text, at))
    }

    /// Append a locally authored message; a reply is now expected.
    pub fn push_message(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        self.messages.push(message);
        self.phase = SessionPhase::AwaitingReply;
        id
    }

    /// Clear the `pending_send` marker once the server accepted the messages.
    pub fn mark_delivered(&mut self, ids: &[MessageId]) {
        for message in self.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
            message.pending_send = false;
        }
    }

    /// Fold one event into the state, returning what changed.
    pub fn apply_event(
        &mut self,
        event: StreamEvent,
        reorder_window: usize,
        received_at: DateTime<Utc>,
    ) -> Vec<Applied> {
        let mut applied = Vec::new();

        let Some(seq) = event.seq() else {
            if matches!(event, StreamEvent::StreamEnd) && self.phase == SessionPhase::AwaitingReply
            {
                self.phase = SessionPhase::Active;
            }
            return applied;
        };

        if seq <= self.last_applied_event_seq {
            debug!(session_id = %self.session_id, seq, "dropping already-applied event");
            return applied;
        }

        let expected = self.last_applied_event_seq.saturating_add(1);
        if seq == expected {
            self.apply_in_order(seq, event, received_at, &mut applied);
        } else {
            self.reorder_buffer.entry(seq).or_insert(event);
            if self.reorder_buffer.len() <= reorder_window {
                debug!(
                    session_id = %self.session_id,
                    seq,
                    expected,
                    buffered = self.reorder_buffer.len(),
                    "buffering out-of-order event"
                );
                return applied;
            }
            let Some(&lowest) = self.reorder_buffer.keys().next() else {
                return applied;
            };
            warn!(
                session_id = %self.session_id,
                expected,
                resumed_at = lowest,
                window = reorder_window,
                "sequence gap exceeded reorder window, skipping"
            );
            applied.push(Applied::GapSkipped {
                from_seq: expected,
                to_seq: lowest - 1,
            });
            self.last_applied_event_seq = lowest - 1;
        }

        loop {
            let next_seq = self.last_applied_event_seq.saturating_add(1);
            let Some(next) = self.reorder_buffer.remove(&next_seq) else {
                break;
            };
            self.apply_in_order(next_seq, next, received_at, &mut applied);
        }

        applied
    }

    /// Owned variant of [`apply_event`](Self::apply_event).
    pub fn applied(
        mut self,
        event: StreamEvent,
        reorder_window: usize,
        received_at: DateTime<Utc>,
    ) -> Self {
        let _ = self.apply_event(event, reorder_window, received_at);
        self
    }

    fn apply_in_order(
        &mut self,
        seq: u64,
        event: StreamEvent,
        received_at: DateTime<Utc>,
        applied: &mut Vec<Applied>,
    ) {
        self.last_applied_event_seq = seq;

        match event {
            StreamEvent::Delta {
                message_id,
                part_index,
                text_chunk,
                ..
            } => {
                let local = self
                    .part_aliases
                    .iter()
                    .find(|a| a.message_id == message_id && a.server_index == part_index)
                    .map_or(part_index, |a| a.local_index);
                let Some(message) = self.open_message(&message_id, received_at) else {
                    return;
                };
                let (index, opened) = match message.parts.get_mut(local) {
                    Some(MessagePart::Text { text }) => {
                        text.push_str(&text_chunk);
                        (local, false)
                    }
                    Some(_) => {
                        warn!(%message_id, part_index, seq, "text delta targets a non-text part, ignoring");
                        return;
                    }
                    None => {
                        message.parts.push(MessagePart::Text {
                            text: text_chunk.clone(),
                        });
                        let index = message.parts.len() - 1;
                        if part_index != index {
                            debug!(%message_id, part_index, local_index = index, "delta part index past end, aliasing");
                            self.part_aliases.push(PartAlias {
                                message_id: message_id.clone(),
                                server_index: part_index,
                                local_index: index,
                            });
                        }
                        (index, true)
                    }
                };
                applied.push(Applied::PartReceived {
                    message_id,
                    part_index: index,
                    part: MessagePart::Text { text: text_chunk },
                    opened,
                });
            }

            StreamEvent::ToolCall {
                message_id,
                call_id,
                tool_name,
                args,
                ..
            } => {
                if self.messages.iter().any(|m| m.has_tool_call(&call_id)) {
                    debug!(%call_id, "tool call already applied");
                    return;
                }
                let Some(message) = self.open_message(&message_id, received_at) else {
                    return;
                };
                let part = MessagePart::ToolCall {
                    call_id: call_id.clone(),
                    tool_name,
                    args,
                };
                message.parts.push(part.clone());
                applied.push(Applied::PartReceived {
                    message_id,
                    part_index: message.parts.len() - 1,
                    part,
                    opened: true,
                });

                let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.unmatched_results)
                    .into_iter()
                    .partition(|r| r.call_id == call_id);
                self.unmatched_results = waiting;
                for result in ready {
                    self.apply_tool_result(result, received_at, applied);
                }
            }

            StreamEvent::ToolResult {
                message_id,
                call_id,
                tool_name,
                result,
                ..
            } => {
                self.apply_tool_result(
                    UnmatchedToolResult {
                        message_id,
                        call_id,
                        tool_name,
                        result,
                    },
                    received_at,
                    applied,
                );
            }

            StreamEvent::MessageComplete { message_id, .. } => {
                match self.messages.iter_mut().find(|m| m.id == message_id) {
                    Some(message) if !message.is_complete => {
                        message.is_complete = true;
                        applied.push(Applied::MessageComplete { message_id });
                    }
                    Some(_) => {}
                    None => warn!(%message_id, seq, "completion for unknown message, ignoring"),
                }
            }

            StreamEvent::StreamEnd | StreamEvent::StreamError { .. } => {}
        }
    }

    fn apply_tool_result(
        &mut self,
        result: UnmatchedToolResult,
        received_at: DateTime<Utc>,
        applied: &mut Vec<Applied>,
    ) {
        let call_id = &result.call_id;
        if self.messages.iter().any(|m| m.has_tool_result(call_id))
            || self.unmatched_results.iter().any(|r| &r.call_id == call_id)
        {
            debug!(%call_id, "tool result already applied");
            return;
        }

        if !self.messages.iter().any(|m| m.has_tool_call(call_id)) {
            debug!(%call_id, "tool result before its call, holding");
            self.unmatched_results.push(result);
            return;
        }

        let UnmatchedToolResult {
            message_id,
            call_id,
            tool_name,
            result,
        } = result;
        let Some(message) = self.open_message(&message_id, received_at) else {
            return;
        };
        let part = MessagePart::ToolResult {
            call_id,
            tool_name,
            result,
        };
        message.parts.push(part.clone());
        applied.push(Applied::PartReceived {
            message_id,
            part_index: message.parts.len() - 1,
            part,
            opened: true,
        });
    }

    /// Find the message, opening an assistant message on first sight.
    /// Returns `None` for complete messages, which are immutable.
    fn open_message(&mut self, id: &MessageId, received_at: DateTime<Utc>) -> Option<&mut Message> {
        let index = match self.messages.iter().position(|m| &m.id == id) {
            Some(index) => index,
            None => {
                self.messages
                    .push(Message::opened(id.clone(), Role::Assistant, received_at));
                self.messages.len() - 1
            }
        };
        let message = &mut self.messages[index];
        if message.is_complete {
            warn!(message_id = %id, "event targets a completed message, dropping");
            return None;
        }
        Some(message)
    }
}
