//! Request-scoped error taxonomy and its HTTP mapping.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::Value;
use thiserror::Error;

use crate::credentials::StoreError;
use crate::rotation::RotationError;
use crate::stream::AggregateError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no valid credentials available")]
    CredentialUnavailable,
    #[error("invalid credential index {index} (pool size {len})")]
    InvalidIndex { index: usize, len: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("backend request timed out")]
    UpstreamTimeout,
    #[error("network error: {0}")]
    UpstreamTransport(String),
    /// Non-success status or in-stream `error` event. `status` is `None` for
    /// in-stream errors.
    #[error("backend error: {message}")]
    UpstreamDeclared {
        status: Option<u16>,
        message: String,
        body: Option<Value>,
    },
    #[error("no valid response received from backend")]
    EmptyStream,
    #[error("credential store error: {0}")]
    Store(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::CredentialUnavailable => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidIndex { .. } => StatusCode::BAD_REQUEST,
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamDeclared { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            ProxyError::EmptyStream => StatusCode::BAD_GATEWAY,
            ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        if let ProxyError::UpstreamDeclared {
            body: Some(body), ..
        } = self
        {
            return HttpResponse::build(self.status()).json(body);
        }
        let body = serde_json::json!({ "error": { "message": self.to_string() } });
        HttpResponse::build(self.status()).json(body)
    }
}

impl From<RotationError> for ProxyError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::Unavailable => ProxyError::CredentialUnavailable,
            RotationError::InvalidIndex { index, len } => ProxyError::InvalidIndex { index, len },
            RotationError::NotFound(handle) => ProxyError::NotFound(handle),
            RotationError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ProxyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidHandle(h) => ProxyError::BadRequest(format!("invalid handle: {}", h)),
            StoreError::NotFound(h) => ProxyError::NotFound(h),
            other => ProxyError::Store(other.to_string()),
        }
    }
}

impl From<AggregateError> for ProxyError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::Declared { message, payload } => ProxyError::UpstreamDeclared {
                status: None,
                message,
                body: Some(payload),
            },
            AggregateError::Empty => ProxyError::EmptyStream,
            AggregateError::Transport(msg) => ProxyError::UpstreamTransport(msg),
        }
    }
}
