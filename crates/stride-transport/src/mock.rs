use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use stride_core::{MessageId, SessionId, StreamErrorReason, StreamEvent};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::handle::{EventStream, OpenRequest, StreamHandle, StreamTransport};

/// Pre-programmed outcome of one `open` call.
pub enum ScriptedOpen {
    /// Handshake succeeds and these events follow. Without a terminal
    /// event at the end the stream then stays open and silent.
    Events(Vec<StreamEvent>),
    /// Handshake succeeds; events are pushed through the paired sender.
    /// Dropping the sender ends the stream without a terminal event.
    Live(mpsc::UnboundedReceiver<StreamEvent>),
    /// Handshake fails.
    Reject(StreamErrorReason),
    /// Handshake never completes.
    Hang,
    /// Wait, then resolve the inner outcome.
    Delay(Duration, Box<ScriptedOpen>),
}

impl ScriptedOpen {
    /// A live stream plus the sender that feeds it.
    pub fn live() -> (mpsc::UnboundedSender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::Live(rx))
    }

    pub fn delayed(delay: Duration, inner: ScriptedOpen) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What the transport was asked to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRecord {
    pub session_id: SessionId,
    pub resume_from_seq: u64,
    pub token: String,
    pub outgoing: Vec<MessageId>,
}

/// Transport that replays scripted outcomes in order and records every open.
/// Once the script runs out, opens fail with `ServerUnavailable`.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedOpen>>,
    opens: Mutex<Vec<OpenRecord>>,
    handles: Mutex<Vec<CancellationToken>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ScriptedOpen>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Append an outcome for a later `open`.
    pub fn push(&self, outcome: ScriptedOpen) {
        self.script.lock().push_back(outcome);
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        self.opens.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    /// Handles handed out that are neither cancelled nor dropped.
    pub fn live_handles(&self) -> usize {
        self.handles.lock().iter().filter(|t| !t.is_cancelled()).count()
    }
}

fn scripted_stream(events: Vec<StreamEvent>) -> EventStream {
    let ends = events.last().is_some_and(StreamEvent::is_terminal);
    if ends {
        Box::pin(stream::iter(events))
    } else {
        Box::pin(stream::iter(events).chain(stream::pending()))
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, request: OpenRequest) -> Result<StreamHandle, StreamErrorReason> {
        self.opens.lock().push(OpenRecord {
            session_id: request.session_id.clone(),
            resume_from_seq: request.resume_from_seq,
            token: request.auth_token.expose_secret().to_string(),
            outgoing: request.outgoing.iter().map(|m| m.id.clone()).collect(),
        });

        let mut outcome = self.script.lock().pop_front();
        loop {
            let events: EventStream = match outcome {
                None => {
                    return Err(StreamErrorReason::ServerUnavailable(
                        "no scripted response".into(),
                    ))
                }
                Some(ScriptedOpen::Events(events)) => scripted_stream(events),
                Some(ScriptedOpen::Live(rx)) => Box::pin(UnboundedReceiverStream::new(rx)),
                Some(ScriptedOpen::Reject(reason)) => return Err(reason),
                Some(ScriptedOpen::Hang) => futures::future::pending().await,
                Some(ScriptedOpen::Delay(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    outcome = Some(*inner);
                    continue;
                }
            };
            let handle = StreamHandle::new(events);
            self.handles.lock().push(handle.cancel_token());
            return Ok(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn request(seq: u64) -> OpenRequest {
        OpenRequest {
            session_id: SessionId::from_raw("s1"),
            resume_from_seq: seq,
            auth_token: SecretString::from("t".to_string()),
            outgoing: Vec::new(),
        }
    }

    #[tokio::test]
    async fn replays_in_order_and_records() {
        let transport = ScriptedTransport::new(vec![
            ScriptedOpen::Reject(StreamErrorReason::Network("down".into())),
            ScriptedOpen::Events(vec![StreamEvent::StreamEnd]),
        ]);
        assert!(transport.open(request(1)).await.is_err());
        let mut handle = transport.open(request(4)).await.unwrap();
        assert_eq!(handle.next().await, Some(StreamEvent::StreamEnd));

        let seqs: Vec<_> = transport.opens().iter().map(|o| o.resume_from_seq).collect();
        assert_eq!(seqs, vec![1, 4]);
        assert!(matches!(
            transport.open(request(4)).await,
            Err(StreamErrorReason::ServerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn live_handles_tracks_cancellation() {
        let (_tx, live) = ScriptedOpen::live();
        let transport = ScriptedTransport::new(vec![live]);
        let handle = transport.open(request(1)).await.unwrap();
        assert_eq!(transport.live_handles(), 1);
        handle.cancel();
        assert_eq!(transport.live_handles(), 0);
    }

    #[tokio::test]
    async fn delayed_open() {
        tokio::time::pause();
        let transport = ScriptedTransport::new(vec![ScriptedOpen::delayed(
            Duration::from_secs(3),
            ScriptedOpen::Events(vec![]),
        )]);
        let start = tokio::time::Instant::now();
        let _handle = transport.open(request(1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
