use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use stride_core::{Message, StreamErrorReason, StreamEvent};
use stride_settings::TransportSettings;
use tracing::{debug, instrument, warn};

use crate::frame::FrameDecoder;
use crate::handle::{OpenRequest, StreamHandle, StreamTransport};

#[derive(Serialize)]
struct OpenBody<'a> {
    resume_from_seq: u64,
    messages: &'a [Message],
}

/// Streams a session over `POST {base_url}/sessions/{id}/stream`.
pub struct HttpTransport {
    client: Client,
    base_url: String,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout,
        })
    }

    pub fn from_settings(settings: &TransportSettings) -> Result<Self, reqwest::Error> {
        Self::new(
            settings.base_url.clone(),
            settings.connect_timeout(),
            settings.idle_timeout(),
        )
    }

    pub fn stream_url(&self, request: &OpenRequest) -> String {
        format!("{}/sessions/{}/stream", self.base_url, request.session_id)
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl StreamTransport for HttpTransport {
    #[instrument(skip_all, fields(session_id = %request.session_id, resume_from = request.resume_from_seq))]
    async fn open(&self, request: OpenRequest) -> Result<StreamHandle, StreamErrorReason> {
        if request.session_id.is_empty() {
            return Err(StreamErrorReason::MalformedFrame("empty session id".into()));
        }

        let body = OpenBody {
            resume_from_seq: request.resume_from_seq,
            messages: &request.outgoing,
        };
        let resp = self
            .client
            .post(self.stream_url(&request))
            .header(
                AUTHORIZATION,
                format!("Bearer {}", request.auth_token.expose_secret()),
            )
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamErrorReason::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            let reason = match StreamErrorReason::from_status(status.as_u16(), body) {
                StreamErrorReason::RateLimited { .. } => StreamErrorReason::RateLimited { retry_after },
                other => other,
            };
            warn!(status = status.as_u16(), kind = reason.error_kind(), "stream handshake rejected");
            return Err(reason);
        }

        debug!("stream handshake accepted");
        let stream = SseStream::with_idle_timeout(resp.bytes_stream(), self.idle_timeout);
        Ok(StreamHandle::new(Box::pin(stream)))
    }
}

/// Byte stream to [`StreamEvent`]s with an idle timeout. Always ends with
/// exactly one terminal event.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: FrameDecoder,
    pending: std::collections::VecDeque<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: FrameDecoder::new(),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    fn terminate(&mut self, reason: StreamErrorReason) -> Poll<Option<StreamEvent>> {
        self.done = true;
        self.pending.clear();
        Poll::Ready(Some(StreamEvent::StreamError { reason }))
    }
}

impl Stream for SseStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending.pop_front() {
            if event.is_terminal() {
                self.done = true;
            }
            return Poll::Ready(Some(event));
        }
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let events = self.decoder.push(&bytes);
                    self.pending.extend(events);
                    if let Some(event) = self.pending.pop_front() {
                        if event.is_terminal() {
                            self.done = true;
                        }
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.terminate(StreamErrorReason::Network(e.to_string()));
                }
                Poll::Ready(None) => {
                    self.decoder.finish();
                    return self.terminate(StreamErrorReason::Network(
                        "stream closed before end".into(),
                    ));
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs_f64();
                        return self.terminate(StreamErrorReason::Network(format!(
                            "idle timeout after {secs}s"
                        )));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
