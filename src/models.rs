//! Request models for the Chat Completions surface.
//!
//! Only the fields the proxy has to understand are typed; everything else a
//! client sends (sampling parameters, tool definitions, vendor extensions) is
//! kept in `extra` and forwarded untouched.

pub mod chat {
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    /// Chat message author role.
    ///
    /// Roles the proxy does not act on (`developer`, `function`, vendor
    /// additions) are kept as `Other` and forwarded verbatim.
    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(from = "String", into = "String")]
    pub enum Role {
        System,
        #[default]
        User,
        Assistant,
        /// Legacy tool-output role; the backend only accepts it as `user`.
        Tool,
        Other(String),
    }

    impl Role {
        pub fn as_str(&self) -> &str {
            match self {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::Other(name) => name,
            }
        }
    }

    impl From<String> for Role {
        fn from(name: String) -> Self {
            match name.as_str() {
                "system" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                _ => Role::Other(name),
            }
        }
    }

    impl From<Role> for String {
        fn from(role: Role) -> Self {
            match role {
                Role::Other(name) => name,
                known => known.as_str().to_string(),
            }
        }
    }

    /// One block of structured message content.
    ///
    /// Known block types are typed; any other object is carried verbatim in
    /// `Other` so unfamiliar content survives the round trip.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(from = "Value", into = "Value")]
    pub enum ContentBlock {
        Text {
            text: String,
        },
        ToolUse {
            id: Option<String>,
            name: String,
            input: Value,
        },
        ToolResult {
            tool_use_id: Option<String>,
            content: Value,
        },
        Other(Value),
    }

    impl ContentBlock {
        pub fn is_tool_block(&self) -> bool {
            matches!(
                self,
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
            )
        }
    }

    fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
        obj.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    impl From<Value> for ContentBlock {
        fn from(value: Value) -> Self {
            let obj = match value.as_object() {
                Some(obj) => obj,
                None => return ContentBlock::Other(value),
            };
            match obj.get("type").and_then(|t| t.as_str()) {
                Some("text") => ContentBlock::Text {
                    text: str_field(obj, "text").unwrap_or_default(),
                },
                Some("tool_use") => ContentBlock::ToolUse {
                    id: str_field(obj, "id").filter(|s| !s.is_empty()),
                    name: str_field(obj, "name").unwrap_or_default(),
                    input: obj
                        .get("input")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                },
                Some("tool_result") => ContentBlock::ToolResult {
                    tool_use_id: str_field(obj, "toolUseId")
                        .or_else(|| str_field(obj, "tool_use_id"))
                        .or_else(|| str_field(obj, "id"))
                        .filter(|s| !s.is_empty()),
                    content: obj
                        .get("content")
                        .or_else(|| obj.get("text"))
                        .cloned()
                        .unwrap_or_else(|| Value::String(String::new())),
                },
                _ => ContentBlock::Other(value),
            }
        }
    }

    impl From<ContentBlock> for Value {
        fn from(block: ContentBlock) -> Self {
            match block {
                ContentBlock::Text { text } => serde_json::json!({
                    "type": "text",
                    "text": text,
                }),
                ContentBlock::ToolUse { id, name, input } => serde_json::json!({
                    "type": "tool_use",
                    "id": id.unwrap_or_default(),
                    "name": name,
                    "input": input,
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => serde_json::json!({
                    "type": "tool_result",
                    "toolUseId": tool_use_id.unwrap_or_default(),
                    "content": content,
                }),
                ContentBlock::Other(value) => value,
            }
        }
    }

    /// Message content: either plain text or an ordered list of blocks.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum MessageContent {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    impl Default for MessageContent {
        fn default() -> Self {
            MessageContent::Text(String::new())
        }
    }

    impl MessageContent {
        /// Concatenated text of the content, ignoring non-text blocks.
        pub fn text(&self) -> String {
            match self {
                MessageContent::Text(s) => s.clone(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect(),
            }
        }
    }

    /// A single chat message.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ChatMessage {
        /// Absent roles are read as `user`.
        #[serde(default)]
        pub role: Role,
        /// `null` or absent content is accepted and treated as empty text.
        #[serde(default)]
        pub content: Option<MessageContent>,
        /// Pass-through fields such as `name`, `tool_calls`, `tool_call_id`.
        #[serde(flatten)]
        pub extra: Map<String, Value>,
    }

    impl ChatMessage {
        pub fn new(role: Role, content: impl Into<String>) -> Self {
            Self {
                role,
                content: Some(MessageContent::Text(content.into())),
                extra: Map::new(),
            }
        }

        pub fn text(&self) -> String {
            self.content.as_ref().map(|c| c.text()).unwrap_or_default()
        }
    }

    /// Inbound Chat Completions request.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChatCompletionRequest {
        #[serde(default = "default_model")]
        pub model: String,
        pub messages: Vec<ChatMessage>,
        #[serde(default)]
        pub stream: bool,
        /// Generation parameters (temperature, max_tokens, top_p, tools,
        /// tool_choice, ...) forwarded largely unmodified.
        #[serde(flatten)]
        pub extra: Map<String, Value>,
    }

    fn default_model() -> String {
        "auto-chat".to_string()
    }

}
