//! Server-sent event handling for backend responses.
//!
//! The backend always streams `data: <json>` lines terminated by
//! `data: [DONE]`. Callers either get those bytes forwarded as they arrive
//! ([`passthrough`]) or one folded `chat.completion` object ([`fold_stream`]).

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::util::now_epoch;

#[derive(Error, Debug)]
pub enum AggregateError {
    /// The backend put an `error` object in the stream.
    #[error("backend error: {message}")]
    Declared { message: String, payload: Value },
    #[error("no valid response received from backend")]
    Empty,
    #[error("stream interrupted: {0}")]
    Transport(String),
}

pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Splits a byte stream into lines, holding an incomplete trailing line
/// until the next chunk arrives.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the line
    /// terminator (`\n` or `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        // Bytes already in the buffer hold no newline.
        let scan_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for end in scan_from..self.buffer.len() {
            if self.buffer[end] != b'\n' {
                continue;
            }
            let mut line = &self.buffer[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            lines.push(line.to_vec());
            start = end + 1;
        }
        if start > 0 {
            self.buffer.drain(..start);
        }
        lines
    }

    /// Whatever remains once the stream has ended.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        if trim_ascii(&rest).is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Classification of a single SSE line.
#[derive(Debug, PartialEq)]
pub enum SseLine {
    /// Blank line, comment, or non-data field.
    Skip,
    Done,
    Event(Value),
    Malformed(String),
}

pub fn parse_line(line: &[u8]) -> SseLine {
    let line = trim_ascii(line);
    let payload = match line.strip_prefix(b"data:") {
        Some(rest) => trim_ascii(rest),
        None => return SseLine::Skip,
    };
    if payload.is_empty() {
        return SseLine::Skip;
    }
    if payload == b"[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) if value.is_object() => SseLine::Event(value),
        Ok(_) => SseLine::Malformed("payload is not a JSON object".to_string()),
        Err(e) => SseLine::Malformed(e.to_string()),
    }
}

/// Accumulates delta events into a single completion.
#[derive(Debug, Default)]
pub struct FoldAggregator {
    base: Option<Value>,
    role: Option<String>,
    content: String,
    tool_calls: BTreeMap<u64, Map<String, Value>>,
    usage: Option<Value>,
    events: usize,
}

impl FoldAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.events
    }

    /// Feed one decoded event. Events without `choices` are skipped; an
    /// `error` key aborts the fold.
    pub fn push(&mut self, event: Value) -> Result<(), AggregateError> {
        if let Some(err) = event.get("error") {
            let message = match err {
                Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| other.to_string()),
            };
            return Err(AggregateError::Declared {
                message,
                payload: event,
            });
        }

        let Some(choices) = event.get("choices").and_then(|c| c.as_array()) else {
            warn!("Skipping stream event without choices");
            return Ok(());
        };

        if let Some(delta) = choices.first().and_then(|c| c.get("delta")) {
            self.merge_delta(delta);
        }
        if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(usage.clone());
        }

        self.events += 1;
        if self.base.is_none() {
            self.base = Some(event);
        }
        Ok(())
    }

    fn merge_delta(&mut self, delta: &Value) {
        if let Some(role) = delta.get("role").and_then(|r| r.as_str()) {
            if !role.is_empty() {
                self.role = Some(role.to_string());
            }
        }
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            self.content.push_str(text);
        }

        let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) else {
            return;
        };
        for call in calls {
            let Some(index) = call.get("index").and_then(|i| i.as_u64()) else {
                warn!("Skipping tool call fragment without index");
                continue;
            };
            let slot = self.tool_calls.entry(index).or_insert_with(|| {
                let mut m = Map::new();
                m.insert("index".into(), json!(index));
                m.insert("function".into(), json!({"name": "", "arguments": ""}));
                m
            });

            if let Some(function) = call.get("function").and_then(|f| f.as_object()) {
                if let Some(Value::Object(acc)) = slot.get_mut("function") {
                    for (key, value) in function {
                        match key.as_str() {
                            "arguments" => {
                                if let Some(fragment) = value.as_str() {
                                    let merged = format!(
                                        "{}{}",
                                        acc.get("arguments").and_then(|a| a.as_str()).unwrap_or(""),
                                        fragment
                                    );
                                    acc.insert("arguments".into(), Value::String(merged));
                                }
                            }
                            "name" => {
                                if value.as_str().is_some_and(|n| !n.is_empty()) {
                                    acc.insert("name".into(), value.clone());
                                }
                            }
                            _ => {
                                acc.insert(key.clone(), value.clone());
                            }
                        }
                    }
                }
            }

            if let Some(obj) = call.as_object() {
                for (key, value) in obj {
                    if key != "function" && key != "index" {
                        slot.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Build the final `chat.completion` object.
    pub fn finish(self) -> Result<Value, AggregateError> {
        let mut base = self.base.ok_or(AggregateError::Empty)?;

        let mut message = Map::new();
        message.insert(
            "role".into(),
            Value::String(self.role.unwrap_or_else(|| "assistant".to_string())),
        );
        message.insert("content".into(), Value::String(self.content));
        let finish_reason = if self.tool_calls.is_empty() {
            "stop"
        } else {
            message.insert(
                "tool_calls".into(),
                Value::Array(self.tool_calls.into_values().map(Value::Object).collect()),
            );
            "tool_calls"
        };

        let mut choice = base
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.as_object())
            .cloned()
            .unwrap_or_default();
        choice.remove("delta");
        choice.entry("index").or_insert(json!(0));
        choice.insert("message".into(), Value::Object(message));
        choice.insert("finish_reason".into(), json!(finish_reason));

        if let Some(obj) = base.as_object_mut() {
            obj.insert("object".into(), json!("chat.completion"));
            obj.insert("created".into(), json!(now_epoch()));
            obj.insert("choices".into(), json!([Value::Object(choice)]));
            match self.usage {
                Some(usage) => {
                    obj.insert("usage".into(), usage);
                }
                None => {
                    obj.remove("usage");
                }
            }
        }
        debug!("Folded {} stream events", self.events);
        Ok(base)
    }
}

/// Fold a backend byte stream into one completion object.
///
/// Reading stops at `[DONE]`; the stream is dropped on every exit path,
/// which releases the backend connection.
pub async fn fold_stream<S>(stream: S) -> Result<Value, AggregateError>
where
    S: Stream<Item = Result<Bytes, std::io::Error>>,
{
    futures_util::pin_mut!(stream);
    let mut lines = SseLineBuffer::new();
    let mut agg = FoldAggregator::new();

    'read: while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AggregateError::Transport(e.to_string()))?;
        for line in lines.push(&chunk) {
            if feed(&mut agg, &line)? {
                break 'read;
            }
        }
    }
    if let Some(rest) = lines.finish() {
        feed(&mut agg, &rest)?;
    }

    agg.finish()
}

/// Returns `true` once the `[DONE]` sentinel is seen.
fn feed(agg: &mut FoldAggregator, line: &[u8]) -> Result<bool, AggregateError> {
    match parse_line(line) {
        SseLine::Skip => Ok(false),
        SseLine::Done => Ok(true),
        SseLine::Event(event) => agg.push(event).map(|_| false),
        SseLine::Malformed(reason) => {
            warn!("Skipping malformed stream line: {}", reason);
            Ok(false)
        }
    }
}

/// SSE frame reporting a broken stream to the caller.
pub fn stream_error_event(message: &str) -> Bytes {
    let body = json!({
        "error": {
            "message": format!("Stream interrupted: {}", message),
            "type": "stream_error",
        }
    });
    Bytes::from(format!("data: {}\n\n", body))
}

/// Forward backend chunks untouched. A transport failure, or no chunk
/// within `idle`, ends the stream with one synthetic error event instead
/// of an abrupt close.
pub fn passthrough<S>(
    stream: S,
    idle: Duration,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    async_stream::stream! {
        futures_util::pin_mut!(stream);
        loop {
            let item = match tokio::time::timeout(idle, stream.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    error!("Upstream stream idle for {:?}; closing", idle);
                    yield Ok(stream_error_event("timeout"));
                    break;
                }
            };
            match item {
                Ok(chunk) => yield Ok::<Bytes, std::io::Error>(chunk),
                Err(err) => {
                    error!("Upstream stream failed: {}", err);
                    yield Ok(stream_error_event(&err.to_string()));
                    break;
                }
            }
        }
    }
}
