use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use tokio::time::Instant;

use super::types::{LinkError, LinkResult};

pub const X_AUTH_TOKEN: HeaderName = HeaderName::from_static("x-auth-token");

/// Lifetime assumed for bearer tokens issued without an explicit expiry.
pub const DEFAULT_BEARER_TTL: Duration = Duration::from_secs(3600);

/// Credentials attached to every request while set.
#[derive(Clone)]
pub enum Credentials {
    Bearer { token: String, expires_at: Instant },
    Basic { username: String, password: String },
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer { expires_at, .. } => f
                .debug_struct("Bearer")
                .field("expires_at", expires_at)
                .finish_non_exhaustive(),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Token(_) => f.write_str("Token(..)"),
        }
    }
}

impl Credentials {
    pub fn bearer(token: impl Into<String>, ttl: Duration) -> Self {
        Credentials::Bearer {
            token: token.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Bearer token valid for [`DEFAULT_BEARER_TTL`].
    pub fn jwt(token: impl Into<String>) -> Self {
        Self::bearer(token, DEFAULT_BEARER_TTL)
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Credentials::Token(token.into())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Credentials::Bearer { expires_at, .. } if now >= *expires_at)
    }

    /// Add the auth header for these credentials. Expired bearer tokens add nothing.
    pub fn apply(&self, headers: &mut HeaderMap, now: Instant) -> LinkResult<()> {
        match self {
            Credentials::Bearer { token, expires_at } => {
                if now < *expires_at {
                    headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
                }
            }
            Credentials::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                headers.insert(AUTHORIZATION, header_value(&format!("Basic {encoded}"))?);
            }
            Credentials::Token(token) => {
                headers.insert(X_AUTH_TOKEN, header_value(token)?);
            }
        }
        Ok(())
    }
}

fn header_value(raw: &str) -> LinkResult<HeaderValue> {
    let mut value = HeaderValue::from_str(raw)
        .map_err(|err| LinkError::Validation(format!("invalid credential header: {err}")))?;
    value.set_sensitive(true);
    Ok(value)
}
