//! Message translation into the backend dialect.
//!
//! The backend accepts OpenAI-shaped messages with a few extra rules:
//! - at least two messages per conversation
//! - no `tool` role
//! - tool blocks kept structured, with `toolUseId` matching `^[A-Za-z0-9_-]+$`
//! - everything else collapsed to plain text
//!
//! Translation never fails; anomalies are repaired and logged.

use crate::models::chat::{ChatMessage, ContentBlock, MessageContent, Role};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info, warn};

/// Substrings marking an assistant turn that merely echoes an earlier
/// upstream failure.
pub const ERROR_MARKERS: &[&str] = &["Error: API error", "API error:"];

/// Content of the synthetic system message prepended to lone user turns.
pub const PADDING_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub const DEFAULT_MIN_MESSAGES: usize = 2;

static TOOL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static tool id pattern"));

pub fn is_valid_tool_id(id: &str) -> bool {
    TOOL_ID_RE.is_match(id)
}

/// `tool_` followed by 8 hex characters.
pub fn synthesize_tool_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("tool_{}", &hex[..8])
}

/// One literal phrase substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

impl RewriteRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Default ordered rule set. Longer phrases come first so they are not
    /// pre-empted by the single-word rules.
    pub fn builtin() -> Vec<RewriteRule> {
        vec![
            RewriteRule::new("Claude Code", "CodeBuddy Code"),
            RewriteRule::new(
                "Anthropic's official CLI for Claude",
                "Tencent's official CLI for CodeBuddy",
            ),
            RewriteRule::new("Claude", "CodeBuddy"),
            RewriteRule::new("Anthropic", "Tencent"),
            RewriteRule::new(
                "https://github.com/anthropics/claude-code/issues",
                "https://cnb.cool/codebuddy/codebuddy-code/-/issues",
            ),
        ]
    }

    /// Load an ordered rule list from a JSON file: `[{"from": .., "to": ..}]`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<RewriteRule>> {
        let content = std::fs::read_to_string(path)?;
        let rules: Vec<RewriteRule> = serde_json::from_str(&content)?;
        Ok(rules
            .into_iter()
            .filter(|r| {
                if r.from.is_empty() {
                    warn!("Ignoring rewrite rule with empty `from`");
                }
                !r.from.is_empty()
            })
            .collect())
    }
}

/// Converts client messages into the backend's accepted shape.
#[derive(Debug, Clone)]
pub struct MessageTranslator {
    rewrite_rules: Vec<RewriteRule>,
}

impl Default for MessageTranslator {
    fn default() -> Self {
        Self::new(RewriteRule::builtin())
    }
}

impl MessageTranslator {
    pub fn new(rewrite_rules: Vec<RewriteRule>) -> Self {
        Self { rewrite_rules }
    }

    pub fn rewrite_rules(&self) -> &[RewriteRule] {
        &self.rewrite_rules
    }

    /// Translate a message list. Deterministic apart from synthesized ids.
    pub fn translate(&self, messages: Vec<ChatMessage>, min_count: usize) -> Vec<ChatMessage> {
        let filtered: Vec<ChatMessage> = messages
            .into_iter()
            .filter(|m| {
                let drop = carries_error_marker(m);
                if drop {
                    info!("Dropping assistant message that echoes an upstream error");
                }
                !drop
            })
            .collect();

        let mut out = Vec::with_capacity(filtered.len() + 1);
        if filtered.len() == 1 && filtered.len() < min_count && filtered[0].role == Role::User {
            out.push(ChatMessage::new(Role::System, PADDING_SYSTEM_PROMPT));
        }

        for mut msg in filtered {
            if msg.role == Role::Tool {
                debug!("Remapping tool role to user");
                msg.role = Role::User;
            }
            msg.content = Some(self.normalize_content(msg.content.take()));
            out.push(msg);
        }
        out
    }

    fn normalize_content(&self, content: Option<MessageContent>) -> MessageContent {
        let blocks = match content {
            None => return MessageContent::Text(String::new()),
            Some(MessageContent::Text(text)) => match parse_stringified_blocks(&text) {
                Some(blocks) => blocks,
                None => return MessageContent::Text(self.rewrite(text)),
            },
            Some(MessageContent::Blocks(blocks)) => blocks,
        };

        if blocks.iter().any(ContentBlock::is_tool_block) {
            MessageContent::Blocks(
                blocks
                    .into_iter()
                    .map(|b| self.normalize_block(b))
                    .collect(),
            )
        } else {
            MessageContent::Text(self.rewrite(collapse_blocks(&blocks)))
        }
    }

    fn normalize_block(&self, block: ContentBlock) -> ContentBlock {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                let id = match tool_use_id {
                    Some(id) if is_valid_tool_id(&id) => id,
                    Some(bad) => {
                        let id = synthesize_tool_id();
                        warn!("Invalid toolUseId {:?}, regenerated: {}", bad, id);
                        id
                    }
                    None => {
                        let id = synthesize_tool_id();
                        warn!("Missing toolUseId, generated: {}", id);
                        id
                    }
                };
                ContentBlock::ToolResult {
                    tool_use_id: Some(id),
                    content,
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                let id = id.filter(|s| !s.is_empty()).unwrap_or_else(|| {
                    let id = synthesize_tool_id();
                    warn!("Missing tool_use id, generated: {}", id);
                    id
                });
                ContentBlock::ToolUse {
                    id: Some(id),
                    name,
                    input,
                }
            }
            ContentBlock::Text { text } => ContentBlock::Text {
                text: self.rewrite(text),
            },
            ContentBlock::Other(value) => match untyped_text(&value) {
                Some(text) => {
                    let id = synthesize_tool_id();
                    debug!("Converted untyped text item to tool_result {}", id);
                    ContentBlock::ToolResult {
                        tool_use_id: Some(id),
                        content: text,
                    }
                }
                None => ContentBlock::Other(value),
            },
        }
    }

    fn rewrite(&self, mut text: String) -> String {
        for rule in &self.rewrite_rules {
            if !rule.from.is_empty() && text.contains(&rule.from) {
                text = text.replace(&rule.from, &rule.to);
            }
        }
        text
    }
}

fn carries_error_marker(msg: &ChatMessage) -> bool {
    if msg.role != Role::Assistant {
        return false;
    }
    match &msg.content {
        Some(MessageContent::Text(text)) => ERROR_MARKERS.iter().any(|m| text.contains(m)),
        _ => false,
    }
}

/// Clients sometimes send block lists JSON-encoded inside a string.
fn parse_stringified_blocks(text: &str) -> Option<Vec<ContentBlock>> {
    let trimmed = text.trim();
    if !(trimmed.starts_with("[{") && trimmed.ends_with("}]")) {
        return None;
    }
    match serde_json::from_str::<Vec<Value>>(trimmed) {
        Ok(items) => {
            debug!("Parsed stringified JSON content ({} items)", items.len());
            Some(items.into_iter().map(ContentBlock::from).collect())
        }
        Err(_) => None,
    }
}

/// An object with `text` but no `type` is a loosely shaped tool result.
fn untyped_text(value: &Value) -> Option<Value> {
    let obj = value.as_object()?;
    let typed = obj
        .get("type")
        .map(|t| !t.is_null() && t.as_str() != Some(""))
        .unwrap_or(false);
    if typed {
        return None;
    }
    obj.get("text").cloned()
}

fn collapse_blocks(blocks: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => out.push_str(text),
            ContentBlock::Other(Value::String(s)) => out.push_str(s),
            other => {
                let value: Value = other.clone().into();
                out.push_str(&value.to_string());
            }
        }
    }
    out
}
