//! Shared-secret authentication of the proxy's own callers.
//!
//! Callers send `Authorization: Bearer <BUDDYRELAY_PASSWORD>`. The check is a
//! constant-time comparison; there is no key store.

#![forbid(unsafe_code)]

use actix_web::http::header;
use actix_web::{HttpRequest, HttpResponse, ResponseError};

use crate::error::ProxyError;
use crate::util::error_response;

/// Outcome of checking a caller's bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    /// No `Authorization` header, or not a bearer token.
    Missing,
    Mismatch,
    /// No secret configured on the server side.
    NotConfigured,
}

impl Verification {
    /// HTTP rejection for anything but `Valid`.
    pub fn rejection(&self) -> Option<HttpResponse> {
        match self {
            Verification::Valid => None,
            Verification::Missing => Some(error_response(
                http::StatusCode::UNAUTHORIZED,
                "Missing Authorization bearer",
            )),
            Verification::Mismatch => Some(error_response(
                http::StatusCode::FORBIDDEN,
                "Incorrect password",
            )),
            Verification::NotConfigured => Some(
                ProxyError::Configuration("server password is not configured".into())
                    .error_response(),
            ),
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(auth_header: Option<&str>) -> Option<&str> {
    let s = auth_header?.trim();
    if s.len() < 7 {
        return None;
    }
    let scheme = s.get(..6)?;
    let rest = &s[6..];
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let t = rest.trim();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

pub fn verify_bearer(expected: Option<&str>, auth_header: Option<&str>) -> Verification {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return Verification::NotConfigured;
    };
    match bearer_token(auth_header) {
        None => Verification::Missing,
        Some(token) if ct_eq(token.as_bytes(), expected.as_bytes()) => Verification::Valid,
        Some(_) => Verification::Mismatch,
    }
}

/// Check an incoming request against the configured secret.
pub fn verify_request(req: &HttpRequest, expected: Option<&str>) -> Verification {
    let auth = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    verify_bearer(expected, auth)
}

/// Constant-time equality for two byte slices.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b) {
        acc |= x ^ y;
    }
    acc == 0
}
