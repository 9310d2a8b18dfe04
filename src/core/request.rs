use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use http::{Method, Uri};
use sonic_rs::Value;
use tokio::time::Instant;

use super::types::{LinkError, LinkResult, RequestId, RequestKind};

/// Caller-owned key/value bag carried alongside a request and echoed back on its events.
pub type RequestContext = BTreeMap<String, Value>;

const USER_AGENT_VALUE: &str = concat!("shared-net/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Bytes(Bytes),
    Json(Value),
}

impl Payload {
    pub fn into_body(self) -> LinkResult<Bytes> {
        match self {
            Payload::Empty => Ok(Bytes::new()),
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Json(value) => sonic_rs::to_vec(&value)
                .map(Bytes::from)
                .map_err(|err| {
                    LinkError::Validation(format!("payload is not serializable: {err}"))
                }),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

/// What a caller submits: an operation tag, an endpoint relative to the server, and a payload.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub operation: String,
    pub endpoint: String,
    pub method: Method,
    pub payload: Payload,
    pub context: RequestContext,
    /// Start connecting first if the client is disconnected.
    pub require_connection: bool,
    /// Overrides the configured retry budget for this request.
    pub max_retries: Option<u32>,
}

impl RequestSpec {
    pub fn new(operation: impl Into<String>, endpoint: impl Into<String>, method: Method) -> Self {
        Self {
            operation: operation.into(),
            endpoint: endpoint.into(),
            method,
            payload: Payload::Empty,
            context: RequestContext::new(),
            require_connection: false,
            max_retries: None,
        }
    }

    pub fn get(operation: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(operation, endpoint, Method::GET)
    }

    pub fn post(
        operation: impl Into<String>,
        endpoint: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::new(operation, endpoint, Method::POST).with_payload(payload)
    }

    pub fn put(
        operation: impl Into<String>,
        endpoint: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::new(operation, endpoint, Method::PUT).with_payload(payload)
    }

    pub fn delete(operation: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self::new(operation, endpoint, Method::DELETE)
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn requiring_connection(mut self) -> Self {
        self.require_connection = true;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn validate(&self) -> LinkResult<()> {
        if self.operation.trim().is_empty() {
            return Err(LinkError::Validation("operation must not be empty".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(LinkError::Validation("endpoint must not be empty".to_string()));
        }
        let supported = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
        if !supported.contains(&self.method) {
            return Err(LinkError::Validation(format!(
                "unsupported HTTP method: {}",
                self.method
            )));
        }
        Ok(())
    }
}

/// Turns endpoints into absolute URIs.
///
/// Passthrough endpoints (health/info style probes) hang directly off the server URL; all others
/// are placed under the API base path.
#[derive(Debug, Clone)]
pub struct UrlResolver {
    server: String,
    api_base_path: String,
    passthrough: Vec<String>,
}

fn with_leading_slash(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl UrlResolver {
    pub fn new(server_url: &str, api_base_path: &str, passthrough: &[String]) -> LinkResult<Self> {
        let server = server_url.trim().trim_end_matches('/');
        if server.is_empty() {
            return Err(LinkError::Validation("server URL is not configured".to_string()));
        }

        let uri: Uri = server
            .parse()
            .map_err(|err| LinkError::Validation(format!("invalid server URL {server:?}: {err}")))?;
        match uri.scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(LinkError::Validation(format!(
                    "server URL must use http or https (got {other:?})"
                )));
            }
        }
        if uri.authority().is_none() {
            return Err(LinkError::Validation(format!(
                "server URL {server:?} has no host"
            )));
        }

        let base = api_base_path.trim().trim_end_matches('/');
        let api_base_path = if base.is_empty() {
            String::new()
        } else {
            with_leading_slash(base)
        };

        Ok(Self {
            server: server.to_string(),
            api_base_path,
            passthrough: passthrough.iter().map(|p| with_leading_slash(p)).collect(),
        })
    }

    pub fn resolve(&self, endpoint: &str) -> LinkResult<Uri> {
        let endpoint = with_leading_slash(endpoint);
        let path = endpoint.split('?').next().unwrap_or_default();
        let url = if self.passthrough.iter().any(|p| p == path) {
            format!("{}{}", self.server, endpoint)
        } else {
            format!("{}{}{}", self.server, self.api_base_path, endpoint)
        };
        url.parse()
            .map_err(|err| LinkError::Validation(format!("invalid request URL {url:?}: {err}")))
    }
}

pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
    headers
}

/// A request owned by the pending table.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub operation: Arc<str>,
    pub endpoint: Arc<str>,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub context: Arc<RequestContext>,
    pub created_at: Instant,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl TrackedRequest {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}
