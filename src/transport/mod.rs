use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, Uri};
use thiserror::Error;

use crate::core::{CorrelationKey, FailureReason, RequestId, RequestKind, TransportErrorKind};

/// One invocation handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportCall {
    pub correlation: CorrelationKey,
    pub request_id: RequestId,
    pub kind: RequestKind,
    /// 1 for the initial attempt, incremented per retry.
    pub attempt: u32,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A response the transport managed to receive. Status classification happens in the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
    /// Throughput measured while receiving, if the transport can tell.
    pub bandwidth_kbps: Option<u64>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            bandwidth_kbps: None,
        }
    }

    pub fn ok_json(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    pub fn with_bandwidth(mut self, kbps: u64) -> Self {
        self.bandwidth_kbps = Some(kbps);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures before a response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportFailure {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl TransportFailure {
    pub fn kind(&self) -> TransportErrorKind {
        match self {
            TransportFailure::ConnectionRefused(_) => TransportErrorKind::ConnectionRefused,
            TransportFailure::Dns(_) => TransportErrorKind::Dns,
            TransportFailure::Tls(_) => TransportErrorKind::Tls,
            TransportFailure::Io(_) => TransportErrorKind::Io,
            TransportFailure::Other(_) => TransportErrorKind::Other,
        }
    }
}

impl From<TransportFailure> for FailureReason {
    fn from(failure: TransportFailure) -> Self {
        FailureReason::Transport {
            kind: failure.kind(),
            message: failure.to_string(),
        }
    }
}

pub type TransportFuture = BoxFuture<'static, Result<TransportResponse, TransportFailure>>;

/// Transport boundary for request/response IO.
///
/// The link actor spawns each returned future as its own task under the request timeout and
/// aborts that task to cancel, so every invocation completes exactly once from the actor's
/// point of view. Implementations only need to be cancel-safe at await points.
pub trait LinkTransport: Send + Sync + 'static {
    fn invoke(&self, call: TransportCall) -> TransportFuture;
}

impl<T: LinkTransport + ?Sized> LinkTransport for std::sync::Arc<T> {
    fn invoke(&self, call: TransportCall) -> TransportFuture {
        (**self).invoke(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_map_to_retryable_reasons() {
        let reason: FailureReason = TransportFailure::Dns("no such host".into()).into();
        assert!(reason.is_retryable());
        assert_eq!(
            reason,
            FailureReason::Transport {
                kind: TransportErrorKind::Dns,
                message: "dns resolution failed: no such host".to_string(),
            }
        );
    }

    #[test]
    fn success_is_any_2xx() {
        assert!(TransportResponse::new(204, Bytes::new()).is_success());
        assert!(!TransportResponse::new(301, Bytes::new()).is_success());
        assert!(!TransportResponse::new(500, Bytes::new()).is_success());
    }
}
