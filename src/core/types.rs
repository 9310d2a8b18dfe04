use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors surfaced synchronously by the client façade.
///
/// Request outcomes that happen later (transport failures, timeouts, decode errors) are never
/// returned here; they are reported through [`FailureReason`] on request events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Too many pending requests (max={max})")]
    CapacityExceeded { max: usize },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

/// Opaque identifier of a tracked request. Unique among pending requests for the lifetime of a
/// client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Token linking one transport invocation to its completion.
///
/// A fresh key is allocated for every attempt, so a late completion of an aborted attempt can
/// never be mistaken for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(u64);

impl CorrelationKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr-{}", self.0)
    }
}

/// Who issued a request. Only `Application` requests produce request events; the other kinds
/// drive the connection state machine and quality scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Application,
    Availability,
    Heartbeat,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Application => "application",
            RequestKind::Availability => "availability",
            RequestKind::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    ConnectionRefused,
    Dns,
    Tls,
    Io,
    Other,
}

/// Why a request attempt (or the whole request) failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FailureReason {
    #[error("transport error ({kind:?}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("protocol error: status={status}, {message}")]
    Protocol { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("expired after {}ms", .age.as_millis())]
    Expired { age: Duration },
}

impl FailureReason {
    /// Transport, timeout and protocol failures may succeed on a later attempt; everything else
    /// is terminal on first sight.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::Transport { .. }
                | FailureReason::Timeout { .. }
                | FailureReason::Protocol { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Transport { .. } => "transport",
            FailureReason::Timeout { .. } => "timeout",
            FailureReason::Protocol { .. } => "protocol",
            FailureReason::Decode(_) => "decode",
            FailureReason::Cancelled(_) => "cancelled",
            FailureReason::Expired { .. } => "expired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_like_failures_are_retryable() {
        assert!(
            FailureReason::Transport {
                kind: TransportErrorKind::ConnectionRefused,
                message: "refused".into(),
            }
            .is_retryable()
        );
        assert!(
            FailureReason::Timeout {
                after: Duration::from_secs(30)
            }
            .is_retryable()
        );
        assert!(
            FailureReason::Protocol {
                status: 503,
                message: "unavailable".into(),
            }
            .is_retryable()
        );

        assert!(!FailureReason::Decode("bad json".into()).is_retryable());
        assert!(!FailureReason::Cancelled("disconnected".into()).is_retryable());
        assert!(
            !FailureReason::Expired {
                age: Duration::from_secs(301)
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_formats_are_stable() {
        assert_eq!(RequestId::new(7).to_string(), "req-7");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            FailureReason::Timeout {
                after: Duration::from_millis(1500)
            }
            .to_string(),
            "timed out after 1500ms"
        );
    }
}
