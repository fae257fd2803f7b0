use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use secrecy::SecretString;
use stride_core::{Message, SessionId, StreamErrorReason, StreamEvent};
use tokio_util::sync::CancellationToken;

/// Decoded events of one open stream.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Everything needed to (re)open a session stream.
#[derive(Clone, Debug)]
pub struct OpenRequest {
    pub session_id: SessionId,
    /// First sequence the server should deliver (`last applied + 1`).
    pub resume_from_seq: u64,
    pub auth_token: SecretString,
    /// User messages the server has not acknowledged yet.
    pub outgoing: Vec<Message>,
}

/// Opens one framed event stream. Not retryable by itself: a failed or
/// finished stream is replaced by calling `open` again.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Perform the handshake. An error here is a failed handshake; failures
    /// after the handshake arrive as a terminal `StreamError` event.
    async fn open(&self, request: OpenRequest) -> Result<StreamHandle, StreamErrorReason>;
}

/// A live stream plus the token that cancels it.
///
/// After `cancel()` (or drop) no further events are delivered, even if
/// the underlying stream had more buffered.
pub struct StreamHandle {
    events: EventStream,
    cancel: CancellationToken,
    finished: bool,
}

impl StreamHandle {
    pub fn new(events: EventStream) -> Self {
        Self {
            events,
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// Next event, or `None` once the stream finished or was cancelled.
    /// A terminal event (`StreamEnd` / `StreamError`) is always the last.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.finished || self.cancel.is_cancelled() {
            return None;
        }
        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.next() => event,
        };
        match &event {
            Some(e) if !e.is_terminal() => {}
            _ => self.finished = true,
        }
        event
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token observed by the transport; cancelled when the handle is.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("finished", &self.finished)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride_core::MessageId;

    fn delta(seq: u64) -> StreamEvent {
        StreamEvent::Delta {
            seq,
            message_id: MessageId::from_raw("m1"),
            part_index: 0,
            text_chunk: "x".into(),
        }
    }

    #[tokio::test]
    async fn yields_until_terminal() {
        let events = futures::stream::iter(vec![delta(1), StreamEvent::StreamEnd, delta(2)]);
        let mut handle = StreamHandle::new(Box::pin(events));
        assert_eq!(handle.next().await, Some(delta(1)));
        assert_eq!(handle.next().await, Some(StreamEvent::StreamEnd));
        assert_eq!(handle.next().await, None);
    }

    #[tokio::test]
    async fn nothing_after_cancel() {
        let events = futures::stream::iter(vec![delta(1), delta(2)]);
        let mut handle = StreamHandle::new(Box::pin(events));
        assert_eq!(handle.next().await, Some(delta(1)));
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.next().await, None);
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_read() {
        let mut handle = StreamHandle::new(Box::pin(futures::stream::pending()));
        let token = handle.cancel_token();
        let reader = tokio::spawn(async move { handle.next().await });
        token.cancel();
        assert_eq!(reader.await.unwrap(), None);
    }

    #[test]
    fn drop_cancels_token() {
        let handle = StreamHandle::new(Box::pin(futures::stream::empty()));
        let token = handle.cancel_token();
        drop(handle);
        assert!(token.is_cancelled());
    }
}
