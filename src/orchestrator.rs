//! Per-request coordination: credential selection, translation, the backend
//! call, and response shaping.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{Stream, TryStreamExt};
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::conversion::{MessageTranslator, DEFAULT_MIN_MESSAGES};
use crate::credentials::Credential;
use crate::error::ProxyError;
use crate::models::chat::ChatCompletionRequest;
use crate::rotation::CredentialRotator;
use crate::stream::{fold_stream, passthrough};
use crate::usage::UsageRecorder;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub const IDE_VERSION: &str = "1.0.7";
pub const CLIENT_USER_AGENT: &str = "CLI/1.0.7 CodeBuddy/1.0.7";
/// Sent as `X-User-Id` when the credential carries no user id.
pub const PLACEHOLDER_USER_ID: &str = "b5be3a67-237e-4ee6-9b9a-0b9ecd7b454b";

/// Fully prepared backend call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Transport to the backend. Returns the response body as a byte stream once
/// a success status has been received.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn open(&self, request: OutboundRequest) -> Result<ByteStream, ProxyError>;
}

/// reqwest-backed transport.
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn open(&self, request: OutboundRequest) -> Result<ByteStream, ProxyError> {
        let payload = serde_json::to_vec(&request.body)
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        let mut builder = self.client.post(&request.url).body(payload);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::UpstreamTimeout
            } else {
                error!("Backend network error: {}", e);
                ProxyError::UpstreamTransport(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            error!("Backend returned {}: {}", status.as_u16(), text);
            let body = serde_json::from_str::<Value>(&text).ok();
            return Err(ProxyError::UpstreamDeclared {
                status: Some(status.as_u16()),
                message: text,
                body,
            });
        }

        Ok(Box::pin(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::other(e.to_string())),
        ))
    }
}

/// Client-supplied conversation identifiers, forwarded when present.
#[derive(Debug, Clone, Default)]
pub struct ConversationHints {
    pub conversation_id: Option<String>,
    pub conversation_request_id: Option<String>,
    pub conversation_message_id: Option<String>,
    pub request_id: Option<String>,
}

fn simple_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
    hex::encode(buf)
}

/// Headers the backend expects on every chat call.
pub fn backend_headers(
    credential: &Credential,
    hints: &ConversationHints,
    default_domain: &str,
) -> Vec<(String, String)> {
    let pick = |v: &Option<String>, fallback: fn() -> String| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(fallback)
    };

    vec![
        (
            "Authorization".into(),
            format!("Bearer {}", credential.bearer_token()),
        ),
        ("Accept".into(), "application/json".into()),
        ("Content-Type".into(), "application/json".into()),
        (
            "X-Conversation-ID".into(),
            pick(&hints.conversation_id, || uuid::Uuid::new_v4().to_string()),
        ),
        (
            "X-Conversation-Request-ID".into(),
            pick(&hints.conversation_request_id, || random_hex(16)),
        ),
        (
            "X-Conversation-Message-ID".into(),
            pick(&hints.conversation_message_id, simple_uuid),
        ),
        ("X-Request-ID".into(), pick(&hints.request_id, simple_uuid)),
        ("X-Agent-Intent".into(), "craft".into()),
        ("X-IDE-Type".into(), "CLI".into()),
        ("X-IDE-Name".into(), "CLI".into()),
        ("X-IDE-Version".into(), IDE_VERSION.into()),
        (
            "X-Domain".into(),
            credential
                .record
                .domain
                .clone()
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| default_domain.to_string()),
        ),
        ("User-Agent".into(), CLIENT_USER_AGENT.into()),
        ("X-Product".into(), "SaaS".into()),
        (
            "X-User-Id".into(),
            credential
                .user_id()
                .filter(|u| !u.is_empty())
                .unwrap_or(PLACEHOLDER_USER_ID)
                .to_string(),
        ),
    ]
}

/// Result of one chat request.
pub enum Completion {
    /// Raw backend SSE bytes for streaming callers.
    Stream(ByteStream),
    /// Folded `chat.completion` object for non-streaming callers.
    Folded(Value),
}

pub struct RequestOrchestrator {
    rotator: Arc<CredentialRotator>,
    usage: Arc<UsageRecorder>,
    translator: MessageTranslator,
    upstream: Arc<dyn Upstream>,
    chat_url: String,
    domain: String,
    timeout: Duration,
}

impl RequestOrchestrator {
    pub fn new(
        rotator: Arc<CredentialRotator>,
        usage: Arc<UsageRecorder>,
        translator: MessageTranslator,
        upstream: Arc<dyn Upstream>,
        chat_url: impl Into<String>,
        domain: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            rotator,
            usage,
            translator,
            upstream,
            chat_url: chat_url.into(),
            domain: domain.into(),
            timeout,
        }
    }

    pub fn rotator(&self) -> &Arc<CredentialRotator> {
        &self.rotator
    }

    /// Outbound payload: caller's parameters untouched, translated messages,
    /// `stream` forced on.
    pub fn build_payload(&self, request: ChatCompletionRequest) -> Value {
        let ChatCompletionRequest {
            model,
            messages,
            extra,
            ..
        } = request;
        let messages = self.translator.translate(messages, DEFAULT_MIN_MESSAGES);

        let mut body: Map<String, Value> = extra;
        body.insert("model".into(), Value::String(model));
        body.insert(
            "messages".into(),
            serde_json::to_value(messages).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        body.insert("stream".into(), Value::Bool(true));
        Value::Object(body)
    }

    /// Run one chat request. The deadline covers connecting and receiving
    /// the response head, and additionally the whole fold for non-streaming
    /// callers.
    pub async fn complete(
        &self,
        request: ChatCompletionRequest,
        hints: &ConversationHints,
    ) -> Result<Completion, ProxyError> {
        if request.messages.is_empty() {
            return Err(ProxyError::BadRequest("messages must not be empty".into()));
        }

        let credential = self.rotator.next()?;
        self.usage.record_model(&request.model);
        info!(
            "Dispatching model={} stream={} credential={}",
            request.model, request.stream, credential.handle
        );

        let wants_stream = request.stream;
        let outbound = OutboundRequest {
            url: self.chat_url.clone(),
            headers: backend_headers(&credential, hints, &self.domain),
            body: self.build_payload(request),
        };

        let deadline = deadline_after(self.timeout);
        let body = tokio::time::timeout_at(deadline, self.upstream.open(outbound))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)??;

        if wants_stream {
            return Ok(Completion::Stream(Box::pin(passthrough(body, self.timeout))));
        }

        let folded = tokio::time::timeout_at(deadline, fold_stream(body))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)??;
        Ok(Completion::Folded(folded))
    }
}

/// Deadline `timeout` from now, saturating far in the future instead of
/// overflowing.
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86400 * 365 * 30))
}
