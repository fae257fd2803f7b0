use std::time::Duration;

/// Classified reason a stream attempt ended abnormally.
/// Transient reasons are retried by the reconnect controller; fatal ones
/// are surfaced to the rendering layer and wait for explicit action.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamErrorReason {
    // Transient
    #[error("network error: {0}")]
    Network(String),
    #[error("server unavailable: {0}")]
    ServerUnavailable(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    // Fatal
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl StreamErrorReason {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::ServerUnavailable(_) | Self::RateLimited { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthExpired(_) | Self::MalformedFrame(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::ServerUnavailable(_) => "server_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthExpired(_) => "auth_expired",
            Self::MalformedFrame(_) => "malformed_frame",
        }
    }

    /// Classify a non-2xx handshake status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthExpired(body),
            429 => Self::RateLimited { retry_after: None },
            408 | 500..=599 => Self::ServerUnavailable(format!("status {status}: {body}")),
            _ => Self::MalformedFrame(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Misuse of the conversation client API.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("session id must not be empty")]
    EmptySessionId,
    #[error("no conversation session is running")]
    NotStarted,
    #[error("a conversation session is already running")]
    AlreadyStarted,
    #[error("conversation session has stopped")]
    Stopped,
}
