//! Access checks applied to WebSocket upgrades.
//!
//! A browser page on any site can open a WebSocket to a server on localhost
//! (CSWSH), so upgrades carrying an `Origin` header must either match the
//! configured pattern or, without one, come from the page the server itself
//! serves. Requests without an `Origin` header are non-browser clients and
//! pass. Basic authentication is optional and compared in constant time.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use regex::Regex;
use subtle::ConstantTimeEq;

const BASIC_CHALLENGE: &str = r#"Basic realm="webtty""#;

/// Rejection returned by the access middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// 401 - No usable credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but wrong.
    AuthInvalid,
    /// 403 - Upgrade from a page on another origin.
    OriginNotAllowed,
}

impl AccessError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AccessError::AuthRequired => StatusCode::UNAUTHORIZED,
            AccessError::AuthInvalid | AccessError::OriginNotAllowed => StatusCode::FORBIDDEN,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AccessError::AuthRequired => "auth_required",
            AccessError::AuthInvalid => "auth_invalid",
            AccessError::OriginNotAllowed => "origin_not_allowed",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AccessError::AuthRequired => "Authentication required.",
            AccessError::AuthInvalid => "Invalid credentials.",
            AccessError::OriginNotAllowed => "WebSocket origin not allowed.",
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        let mut response = (self.status_code(), Json(body)).into_response();
        if self == AccessError::AuthRequired {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(BASIC_CHALLENGE),
            );
        }
        response
    }
}

fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// `host[:port]` part of an origin such as `http://127.0.0.1:8080`.
fn origin_authority(origin: &str) -> Option<&str> {
    let (_, rest) = origin.split_once("://")?;
    rest.split('/').next().filter(|authority| !authority.is_empty())
}

fn origin_allowed(req: &Request, origin: &str, pattern: Option<&Regex>) -> bool {
    match pattern {
        Some(pattern) => pattern.is_match(origin),
        None => {
            let host = req.headers().get(header::HOST).and_then(|v| v.to_str().ok());
            match (origin_authority(origin), host) {
                (Some(authority), Some(host)) => authority.eq_ignore_ascii_case(host),
                _ => false,
            }
        }
    }
}

/// Check the Origin header on WebSocket upgrade requests.
///
/// - Non-WebSocket requests pass through.
/// - No Origin header passes (curl, scripts, the test client).
/// - With `pattern`, the origin must match it.
/// - Without, the origin's host must equal the request's `Host`.
pub async fn check_ws_origin(
    pattern: Option<Regex>,
    req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    if !is_ws_upgrade(&req) {
        return Ok(next.run(req).await);
    }

    let origin = match req.headers().get(header::ORIGIN).map(|v| v.to_str()) {
        None => return Ok(next.run(req).await),
        Some(Ok(origin)) => origin.to_string(),
        Some(Err(_)) => return Err(AccessError::OriginNotAllowed),
    };

    if origin_allowed(&req, &origin, pattern.as_ref()) {
        return Ok(next.run(req).await);
    }

    tracing::warn!(%origin, "rejecting cross-origin websocket upgrade");
    Err(AccessError::OriginNotAllowed)
}

/// Decoded `user:password` from a `Basic` Authorization header.
fn extract_basic(req: &Request) -> Option<Vec<u8>> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
}

/// Require `credential` (`user:password`) via HTTP basic authentication.
pub async fn require_basic_auth(
    credential: Arc<str>,
    req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    match extract_basic(&req) {
        Some(given) if bool::from(given.as_slice().ct_eq(credential.as_bytes())) => {
            Ok(next.run(req).await)
        }
        Some(_) => Err(AccessError::AuthInvalid),
        None => Err(AccessError::AuthRequired),
    }
}
