//! Basic-auth credentials and the middleware that enforces them.

use crate::server::{error_response, ErrorCode};
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tracing::debug;

pub(crate) const REALM: &str = "Registry Realm";

/// A username/password pair accepted by an auth-enabled fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Random credentials, unique per call.
    pub fn generate() -> Self {
        let user = uuid::Uuid::new_v4().simple().to_string();
        let password = uuid::Uuid::new_v4().simple().to_string();
        Self::new(format!("user-{}", &user[..8]), password)
    }

    /// `base64(username:password)`, as used in both the header and auth files.
    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let raw = BASE64.decode(encoded.trim()).ok()?;
        let raw = String::from_utf8(raw).ok()?;
        let (username, password) = raw.split_once(':')?;
        Some(Self::new(username, password))
    }

    pub fn basic_header(&self) -> String {
        format!("Basic {}", self.encode())
    }

    /// The `--creds` value understood by registry clients.
    pub fn creds_arg(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }

    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        Self::decode(encoded)
    }
}

pub(crate) async fn require_basic_auth(
    State(expected): State<Arc<Credentials>>,
    request: Request,
    next: Next,
) -> Response {
    match Credentials::from_headers(request.headers()) {
        Some(given) if given == *expected => next.run(request).await,
        given => {
            debug!(
                "Rejecting {} {} (credentials supplied: {})",
                request.method(),
                request.uri().path(),
                given.is_some()
            );
            let mut response = error_response(ErrorCode::Unauthorized, request.uri().path());
            if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", REALM)) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, challenge);
            }
            response
        }
    }
}
