// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// How an image is referenced in a message block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSourceType {
    Url,
    Base64,
}

/// A single structured element of a message.
///
/// `content` and `blocks` are mutually exclusive representations of a
/// message body; blocks are used whenever the message carries anything
/// other than a single plain text run.  This is a closed set: adapters
/// dispatch exhaustively and unknown block shapes cannot occur.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    ToolUse {
        /// Opaque identifier from the model; forwarded verbatim on the
        /// next request so the provider can pair use and result.
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
        /// Set when the result text was reduced before being fed back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compressed: Option<bool>,
        /// Resource references (file paths, URLs) the result points at.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        references: Option<Vec<String>>,
    },
    Image {
        source_type: ImageSourceType,
        /// URL or raw base64 payload, depending on `source_type`.
        source: String,
        mime_type: String,
        /// Provider-specific detail hint (`"low"` / `"high"` / `"auto"`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse { id: id.into(), name: name.into(), input }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
            compressed: None,
            references: None,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: message.into(),
            is_error: true,
            compressed: None,
            references: None,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The body of a message: a single plain text run, or structured blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Block>),
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    /// Assistant message carrying structured blocks (text and/or tool use).
    pub fn assistant_blocks(blocks: Vec<Block>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Blocks(blocks) }
    }

    /// Tool-role message carrying a single tool result block.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![Block::tool_result(tool_use_id, content)]),
        }
    }

    /// Tool-role message carrying an error result block.
    pub fn tool_error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![Block::tool_error(tool_use_id, message)]),
        }
    }

    /// Return the plain text of this message, if it is a single text run.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                Block::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Iterate the blocks of this message.  A plain text body is exposed as
    /// a single synthetic text block by `blocks_or_text`.
    pub fn blocks(&self) -> &[Block] {
        match &self.content {
            MessageContent::Blocks(b) => b,
            MessageContent::Text(_) => &[],
        }
    }

    /// All tool-use blocks carried by this message.
    pub fn tool_uses(&self) -> Vec<&Block> {
        self.blocks()
            .iter()
            .filter(|b| matches!(b, Block::ToolUse { .. }))
            .collect()
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceKind {
    /// The model decides whether to call tools.
    Auto,
    /// The model must call some tool.
    Any,
    /// The model must call the named tool.
    Tool,
}

/// Constraint on how the model may use the provided tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub kind: ToolChoiceKind,
    /// Required when `kind` is [`ToolChoiceKind::Tool`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Forbid the model from emitting parallel tool calls in one turn.
    #[serde(default)]
    pub disable_parallel: bool,
}

/// Extended-thinking request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingOptions {
    pub enabled: bool,
    pub budget_tokens: u32,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Overrides the provider-configured limit when set.
    pub max_tokens: Option<u32>,
    /// Overrides the provider-configured temperature when set.  Never sent
    /// to reasoning models regardless of this field.
    pub temperature: Option<f32>,
    /// System prompt.  When absent, a leading system-role message is used.
    pub system: Option<String>,
    pub tool_choice: Option<ToolChoice>,
    /// Structured-output constraint (e.g. `{"type": "json_object"}`),
    /// forwarded verbatim to dialects that support it.
    pub response_format: Option<Value>,
    pub thinking: Option<ThinkingOptions>,
}

// ─── Streaming ────────────────────────────────────────────────────────────────

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens served from the provider's prompt cache (read hit).
    pub cache_read_tokens: u32,
    /// Tokens written into the provider's prompt cache (write/creation).
    pub cache_write_tokens: u32,
}

impl TokenUsage {
    /// Field-wise sum; used when a provider reports usage in several chunks.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// What kind of content block a stream index carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

/// A fully accumulated tool invocation, attached to the stop chunk of a
/// tool-use block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseChunk {
    pub id: String,
    pub name: String,
    pub input: Value,
    /// Set when the accumulated argument text was not valid JSON.  `input`
    /// is `{}` in that case so the call can still be dispatched — and its
    /// failure reported — downstream.
    pub input_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolUse,
    MaxTokens,
    Error,
}

/// One streamed event from a provider, already coalesced into the canonical
/// per-index block model.  Closed set; consumers dispatch exhaustively.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A new content block opened at `index`.
    BlockStart { index: u32, kind: BlockKind },
    /// Incremental text for the text block at `index`.
    TextDelta { index: u32, text: String },
    /// Incremental reasoning text for the thinking block at `index`.
    ReasoningDelta { index: u32, text: String },
    /// Raw argument JSON fragment for the tool-use block at `index`.
    ToolInputDelta { index: u32, partial_json: String },
    /// The block at `index` closed.  For tool-use blocks `tool_use` carries
    /// the fully accumulated invocation.
    BlockStop { index: u32, tool_use: Option<ToolUseChunk> },
    /// Trailing message metadata.
    MessageDelta { finish_reason: Option<FinishReason> },
    Usage(TokenUsage),
    /// Recoverable mid-stream fault; never terminates the stream by itself.
    Error(String),
    /// End of stream.  Emitted exactly once.
    Done,
}

// ─── Capabilities ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallingFormat {
    Anthropic,
    OpenAi,
    Custom,
}

/// Static description of what a provider/model combination supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_tool_calling: bool,
    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub max_tokens: u32,
    pub tool_calling_format: ToolCallingFormat,
}

/// Return `true` for model names that designate a reasoning model.
///
/// Matched on name segments so that `o1-preview`, `gpt-o3-mini`, and
/// `deepseek-r1` all qualify while `no1` or `for1` do not.  Reasoning
/// endpoints reject the `temperature` parameter, so adapters consult this
/// before serializing it.
pub fn is_reasoning_model(name: &str) -> bool {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|seg| matches!(seg, "o1" | "o3" | "r1"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
    }

    #[test]
    fn message_assistant_sets_role_and_text() {
        let m = Message::assistant("reply");
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.as_text(), Some("reply"));
    }

    #[test]
    fn message_tool_result_sets_role_and_block() {
        let m = Message::tool_result("id-1", "output");
        assert_eq!(m.role, Role::Tool);
        match &m.blocks()[0] {
            Block::ToolResult { tool_use_id, content, is_error, .. } => {
                assert_eq!(tool_use_id, "id-1");
                assert_eq!(content, "output");
                assert!(!is_error);
            }
            other => panic!("wrong block variant: {other:?}"),
        }
    }

    #[test]
    fn message_tool_error_marks_is_error() {
        let m = Message::tool_error("id-2", "boom");
        match &m.blocks()[0] {
            Block::ToolResult { is_error, .. } => assert!(is_error),
            other => panic!("wrong block variant: {other:?}"),
        }
    }

    #[test]
    fn as_text_collapses_single_text_block() {
        let m = Message::assistant_blocks(vec![Block::text("only")]);
        assert_eq!(m.as_text(), Some("only"));
    }

    #[test]
    fn as_text_none_for_mixed_blocks() {
        let m = Message::assistant_blocks(vec![
            Block::text("t"),
            Block::tool_use("t1", "search", json!({})),
        ]);
        assert!(m.as_text().is_none());
    }

    #[test]
    fn tool_uses_filters_blocks() {
        let m = Message::assistant_blocks(vec![
            Block::text("thinking about it"),
            Block::tool_use("t1", "search", json!({"q": "x"})),
            Block::tool_use("t2", "fetch", json!({})),
        ]);
        assert_eq!(m.tool_uses().len(), 2);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let original = Message::user("test payload");
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn block_tagged_with_snake_case_type() {
        let b = Block::tool_use("t1", "search", json!({"q": "rust"}));
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["id"], "t1");
        assert_eq!(v["input"]["q"], "rust");
    }

    #[test]
    fn tool_result_omits_optional_fields_when_unset() {
        let b = Block::tool_result("t1", "ok");
        let json = serde_json::to_string(&b).unwrap();
        assert!(!json.contains("compressed"));
        assert!(!json.contains("references"));
    }

    #[test]
    fn blocks_message_round_trips() {
        let m = Message::assistant_blocks(vec![
            Block::text("a"),
            Block::tool_use("t1", "search", json!({"q": 1})),
        ]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    // ── Canonical serialization ───────────────────────────────────────────────

    #[test]
    fn identical_requests_serialize_byte_identically() {
        // serde_json maps are ordered, so two structurally equal bodies must
        // produce the same bytes — the precondition for provider-side prompt
        // cache hits.
        let body = |q: &str| {
            serde_json::to_string(&json!({
                "model": "m",
                "messages": [{"role": "user", "content": q}],
                "stream": true,
            }))
            .unwrap()
        };
        assert_eq!(body("hello"), body("hello"));
    }

    // ── TokenUsage ────────────────────────────────────────────────────────────

    #[test]
    fn token_usage_merge_sums_fields() {
        let mut a = TokenUsage { input_tokens: 10, output_tokens: 1, ..Default::default() };
        let b = TokenUsage {
            input_tokens: 5,
            output_tokens: 2,
            cache_read_tokens: 7,
            cache_write_tokens: 0,
        };
        a.merge(&b);
        assert_eq!(a.input_tokens, 15);
        assert_eq!(a.output_tokens, 3);
        assert_eq!(a.cache_read_tokens, 7);
    }

    // ── Reasoning model detection ─────────────────────────────────────────────

    #[test]
    fn reasoning_models_detected_by_segment() {
        assert!(is_reasoning_model("o1-preview"));
        assert!(is_reasoning_model("o3-mini"));
        assert!(is_reasoning_model("deepseek-r1"));
        assert!(is_reasoning_model("deepseek/r1.distill"));
    }

    #[test]
    fn non_reasoning_models_not_matched() {
        assert!(!is_reasoning_model("gpt-4o"));
        assert!(!is_reasoning_model("claude-sonnet-4-5"));
        assert!(!is_reasoning_model("phi-3"));
        // substrings inside a longer segment must not match
        assert!(!is_reasoning_model("model-no1"));
    }
}
