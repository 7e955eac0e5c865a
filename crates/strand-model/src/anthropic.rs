// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    assemble::BlockAssembler,
    error::ProviderError,
    http,
    provider::ChunkStream,
    retry::{with_retry, RetryPolicy},
    sse::{drain_data_lines, SseScanState},
    Block, BlockKind, Capabilities, CompletionRequest, FinishReason, MessageContent, Role,
    StreamChunk, TokenUsage, ToolCallingFormat,
};

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            retry,
        }
    }
}

#[async_trait]
impl crate::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tool_calling: true,
            supports_streaming: true,
            supports_vision: true,
            max_tokens: self.max_tokens,
            tool_calling_format: ToolCallingFormat::Anthropic,
        }
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let key = self.api_key.as_deref().ok_or_else(|| ProviderError::Auth {
            message: "ANTHROPIC_API_KEY not set".into(),
        })?;

        let body = build_anthropic_body(&req, &self.model, self.max_tokens, self.temperature);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %self.model, tool_count = req.tools.len(), "sending anthropic request");

        let resp = with_retry(&self.retry, || {
            // The builder is assembled synchronously and moved into the
            // future so each retry attempt sends a fresh request.
            let attempt = http::client()
                .post(&url)
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01")
                .json(&body);
            async move {
                let resp = attempt.send().await?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(ProviderError::from_status(status, text));
                }
                Ok(resp)
            }
        })
        .await?;

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let event_stream = byte_stream
            .scan(SseScanState::new(), |state, chunk| {
                let items: Vec<Result<StreamChunk, ProviderError>> = match chunk {
                    Ok(bytes) => {
                        state.buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut out = Vec::new();
                        for payload in drain_data_lines(&mut state.buf) {
                            if state.done {
                                break;
                            }
                            if payload == "[DONE]" {
                                state.done = true;
                                out.push(Ok(StreamChunk::Done));
                                continue;
                            }
                            match serde_json::from_str::<Value>(&payload) {
                                Ok(v) => out.extend(
                                    parse_anthropic_event(&v, &mut state.asm, &mut state.done)
                                        .into_iter()
                                        .map(Ok),
                                ),
                                Err(e) => {
                                    // Malformed lines never abort the stream.
                                    debug!(error = %e, "skipping malformed SSE line");
                                }
                            }
                        }
                        out
                    }
                    Err(e) => vec![Err(ProviderError::Stream(e.to_string()))],
                };
                std::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Translate one parsed Anthropic SSE event into stream chunks.
///
/// Unknown event types and delta types are skipped; the stream only ends on
/// `message_stop` (or the `[DONE]` sentinel handled by the scanner).
pub(crate) fn parse_anthropic_event(
    v: &Value,
    asm: &mut BlockAssembler,
    done: &mut bool,
) -> Vec<StreamChunk> {
    let event_type = v["type"].as_str().unwrap_or("");
    match event_type {
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                return vec![StreamChunk::Usage(TokenUsage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                    // Anthropic reports these only in message_start.
                    cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                    cache_write_tokens: usage["cache_creation_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                })];
            }
            vec![]
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            let kind = match block["type"].as_str().unwrap_or("") {
                "tool_use" => BlockKind::ToolUse {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                },
                "thinking" => BlockKind::Thinking,
                _ => BlockKind::Text,
            };
            vec![asm.start(index, kind)]
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![StreamChunk::TextDelta { index, text }]
                    }
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("");
                    vec![asm.tool_input_delta(index, partial)]
                }
                // Extended thinking: the chain-of-thought streams as its own
                // delta type so it never mixes into the answer text.
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("").to_string();
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![StreamChunk::ReasoningDelta { index, text }]
                    }
                }
                // Encrypted integrity blob at the end of every thinking
                // block; never surfaced as readable content.
                "signature_delta" => vec![],
                _ => vec![],
            }
        }
        "content_block_stop" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            vec![asm.stop(index)]
        }
        "message_delta" => {
            let mut out = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                let finish_reason = match reason {
                    "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
                    "tool_use" => Some(FinishReason::ToolUse),
                    "max_tokens" => Some(FinishReason::MaxTokens),
                    _ => None,
                };
                out.push(StreamChunk::MessageDelta { finish_reason });
            }
            if let Some(usage) = v.get("usage") {
                out.push(StreamChunk::Usage(TokenUsage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_read_tokens: 0,
                    cache_write_tokens: 0,
                }));
            }
            out
        }
        "message_stop" => {
            *done = true;
            vec![StreamChunk::Done]
        }
        "error" => {
            let message = v["error"]["message"]
                .as_str()
                .unwrap_or("unspecified provider error")
                .to_string();
            vec![StreamChunk::Error(message)]
        }
        // ping and any future event types
        _ => vec![],
    }
}

/// Build the Anthropic request body.
///
/// The system prompt is a top-level `system` field, never a conversation
/// turn; tool-result blocks ride in user-role messages per the wire format.
/// Keys serialize in canonical order, so identical requests are
/// byte-identical — a precondition for the provider's prompt cache.
pub(crate) fn build_anthropic_body(
    req: &CompletionRequest,
    model: &str,
    max_tokens: u32,
    temperature: f32,
) -> Value {
    let mut system_text = req.system.clone().unwrap_or_default();
    let mut messages: Vec<Value> = Vec::new();

    for m in &req.messages {
        if m.role == Role::System {
            if system_text.is_empty() {
                if let Some(t) = m.as_text() {
                    system_text = t.to_string();
                }
            }
            continue;
        }
        let role = match m.role {
            Role::Assistant => "assistant",
            // Tool results ride in user messages on this dialect.
            Role::User | Role::Tool => "user",
            Role::System => unreachable!(),
        };
        match &m.content {
            MessageContent::Text(t) => {
                messages.push(json!({ "role": role, "content": t }));
            }
            MessageContent::Blocks(blocks) => {
                let content: Vec<Value> = blocks.iter().map(block_to_wire).collect();
                messages.push(json!({ "role": role, "content": content }));
            }
        }
    }

    let tools: Vec<Value> = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": req.stream,
        "max_tokens": req.max_tokens.unwrap_or(max_tokens),
        "temperature": req.temperature.unwrap_or(temperature),
    });
    if !system_text.is_empty() {
        body["system"] = json!(system_text);
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    if let Some(tc) = &req.tool_choice {
        let kind = match tc.kind {
            crate::ToolChoiceKind::Auto => "auto",
            crate::ToolChoiceKind::Any => "any",
            crate::ToolChoiceKind::Tool => "tool",
        };
        let mut choice = json!({ "type": kind });
        if let Some(name) = &tc.name {
            choice["name"] = json!(name);
        }
        if tc.disable_parallel {
            choice["disable_parallel_tool_use"] = json!(true);
        }
        body["tool_choice"] = choice;
    }
    if let Some(thinking) = &req.thinking {
        if thinking.enabled {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": thinking.budget_tokens,
            });
        }
    }
    body
}

fn block_to_wire(block: &Block) -> Value {
    match block {
        Block::Text { text } => json!({ "type": "text", "text": text }),
        Block::ToolUse { id, name, input } => {
            // tool_use.id must match `^[a-zA-Z0-9_-]+$`; an empty id can
            // arise when a content_block_start event was missing from the
            // stream.  Substitute a stable fallback rather than sending an
            // invalid request that yields a 400.
            let safe_id = if id.is_empty() {
                warn!(tool_name = %name, "tool_use block has empty id; substituting fallback");
                "tu_fallback"
            } else {
                id.as_str()
            };
            json!({
                "type": "tool_use",
                "id": safe_id,
                "name": name,
                "input": input,
            })
        }
        Block::ToolResult { tool_use_id, content, is_error, .. } => {
            let mut v = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                v["is_error"] = json!(true);
            }
            v
        }
        Block::Image { source_type, source, mime_type, .. } => match source_type {
            crate::ImageSourceType::Base64 => json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": mime_type,
                    "data": source,
                }
            }),
            crate::ImageSourceType::Url => json!({
                "type": "image",
                "source": { "type": "url", "url": source }
            }),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, Provider, ToolSchema, ToolUseChunk};
    use serde_json::json;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            "claude-sonnet-4-5".into(),
            None,
            None,
            None,
            None,
            RetryPolicy::default(),
        )
    }

    fn parse_all(events: &[Value]) -> Vec<StreamChunk> {
        let mut asm = BlockAssembler::new();
        let mut done = false;
        events
            .iter()
            .flat_map(|v| parse_anthropic_event(v, &mut asm, &mut done))
            .collect()
    }

    #[test]
    fn provider_name_and_model() {
        let p = provider();
        assert_eq!(p.name(), "anthropic");
        assert_eq!(p.model_name(), "claude-sonnet-4-5");
        assert_eq!(p.capabilities().tool_calling_format, ToolCallingFormat::Anthropic);
    }

    // ── parse_anthropic_event ─────────────────────────────────────────────────

    #[test]
    fn message_start_yields_input_usage() {
        let chunks = parse_all(&[json!({
            "type": "message_start",
            "message": { "usage": { "input_tokens": 42, "output_tokens": 0 } }
        })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::Usage(TokenUsage { input_tokens: 42, .. })
        ));
    }

    #[test]
    fn message_start_parses_cache_tokens() {
        let chunks = parse_all(&[json!({
            "type": "message_start",
            "message": { "usage": {
                "input_tokens": 100,
                "cache_read_input_tokens": 80,
                "cache_creation_input_tokens": 20
            }}
        })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::Usage(TokenUsage { cache_read_tokens: 80, cache_write_tokens: 20, .. })
        ));
    }

    #[test]
    fn text_block_lifecycle() {
        let chunks = parse_all(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "text", "text": "" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "text_delta", "text": "world" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
        ]);
        assert!(matches!(chunks[0], StreamChunk::BlockStart { index: 0, kind: BlockKind::Text }));
        assert!(matches!(&chunks[1], StreamChunk::TextDelta { text, .. } if text == "world"));
        assert!(matches!(chunks[2], StreamChunk::BlockStop { index: 0, tool_use: None }));
    }

    #[test]
    fn tool_use_block_accumulates_input_json() {
        let chunks = parse_all(&[
            json!({ "type": "content_block_start", "index": 1,
                    "content_block": { "type": "tool_use", "id": "toolu_01", "name": "search" } }),
            json!({ "type": "content_block_delta", "index": 1,
                    "delta": { "type": "input_json_delta", "partial_json": "{\"q\":" } }),
            json!({ "type": "content_block_delta", "index": 1,
                    "delta": { "type": "input_json_delta", "partial_json": "\"x\"}" } }),
            json!({ "type": "content_block_stop", "index": 1 }),
        ]);
        let StreamChunk::BlockStop { index: 1, tool_use: Some(ToolUseChunk { id, name, input, input_error }) } =
            &chunks[3]
        else {
            panic!("expected tool-use stop, got {:?}", chunks[3]);
        };
        assert_eq!(id, "toolu_01");
        assert_eq!(name, "search");
        assert_eq!(input["q"], "x");
        assert!(input_error.is_none());
    }

    #[test]
    fn invalid_tool_input_degrades_to_empty_object() {
        let chunks = parse_all(&[
            json!({ "type": "content_block_start", "index": 0,
                    "content_block": { "type": "tool_use", "id": "t", "name": "bad" } }),
            json!({ "type": "content_block_delta", "index": 0,
                    "delta": { "type": "input_json_delta", "partial_json": "[{ not json" } }),
            json!({ "type": "content_block_stop", "index": 0 }),
        ]);
        let StreamChunk::BlockStop { tool_use: Some(tu), .. } = &chunks[2] else {
            panic!("expected stop");
        };
        assert_eq!(tu.input, json!({}));
        assert!(tu.input_error.is_some());
    }

    #[test]
    fn thinking_delta_produces_reasoning_chunk() {
        let chunks = parse_all(&[json!({
            "type": "content_block_delta", "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "Let me reason." }
        })]);
        assert!(matches!(&chunks[0], StreamChunk::ReasoningDelta { text, .. }
            if text == "Let me reason."));
    }

    #[test]
    fn signature_delta_is_silently_discarded() {
        let chunks = parse_all(&[json!({
            "type": "content_block_delta", "index": 0,
            "delta": { "type": "signature_delta", "signature": "EqRkLm..." }
        })]);
        assert!(chunks.is_empty());
    }

    #[test]
    fn message_delta_maps_stop_reasons() {
        let chunks = parse_all(&[json!({
            "type": "message_delta",
            "delta": { "stop_reason": "tool_use" },
            "usage": { "output_tokens": 88 }
        })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::MessageDelta { finish_reason: Some(FinishReason::ToolUse) }
        ));
        assert!(matches!(
            chunks[1],
            StreamChunk::Usage(TokenUsage { output_tokens: 88, .. })
        ));
    }

    #[test]
    fn max_tokens_stop_reason_surfaces() {
        let chunks = parse_all(&[json!({
            "type": "message_delta", "delta": { "stop_reason": "max_tokens" }
        })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::MessageDelta { finish_reason: Some(FinishReason::MaxTokens) }
        ));
    }

    #[test]
    fn message_stop_yields_done() {
        let chunks = parse_all(&[json!({ "type": "message_stop" })]);
        assert!(matches!(chunks[0], StreamChunk::Done));
    }

    #[test]
    fn unknown_event_type_is_skipped() {
        assert!(parse_all(&[json!({ "type": "ping" })]).is_empty());
    }

    #[test]
    fn error_event_yields_error_chunk() {
        let chunks = parse_all(&[json!({
            "type": "error", "error": { "type": "overloaded_error", "message": "overloaded" }
        })]);
        assert!(matches!(&chunks[0], StreamChunk::Error(m) if m == "overloaded"));
    }

    // ── Request body ──────────────────────────────────────────────────────────

    #[test]
    fn system_message_extracted_to_top_level_field() {
        let req = CompletionRequest {
            messages: vec![Message::system("be helpful"), Message::user("hi")],
            stream: true,
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["system"], "be helpful");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn explicit_system_field_wins_over_message() {
        let req = CompletionRequest {
            messages: vec![Message::system("from message"), Message::user("hi")],
            system: Some("from options".into()),
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["system"], "from options");
    }

    #[test]
    fn tool_result_rides_in_user_message() {
        let req = CompletionRequest {
            messages: vec![Message::tool_result("toolu_01", "42 files")],
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["type"], "tool_result");
        assert_eq!(msg["content"][0]["tool_use_id"], "toolu_01");
    }

    #[test]
    fn error_tool_result_sets_is_error() {
        let req = CompletionRequest {
            messages: vec![Message::tool_error("t1", "exploded")],
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["messages"][0]["content"][0]["is_error"], true);
    }

    #[test]
    fn tool_use_id_round_trips_verbatim() {
        let req = CompletionRequest {
            messages: vec![
                Message::assistant_blocks(vec![Block::tool_use(
                    "toolu_abc123",
                    "search",
                    json!({"q": "x"}),
                )]),
                Message::tool_result("toolu_abc123", "result"),
            ],
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["messages"][0]["content"][0]["id"], "toolu_abc123");
        assert_eq!(body["messages"][1]["content"][0]["tool_use_id"], "toolu_abc123");
    }

    #[test]
    fn empty_tool_use_id_gets_fallback() {
        let req = CompletionRequest {
            messages: vec![Message::assistant_blocks(vec![Block::tool_use(
                "",
                "search",
                json!({}),
            )])],
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["messages"][0]["content"][0]["id"], "tu_fallback");
    }

    #[test]
    fn tools_serialize_with_input_schema() {
        let req = CompletionRequest {
            tools: vec![ToolSchema {
                name: "search".into(),
                description: "find things".into(),
                input_schema: json!({ "type": "object" }),
            }],
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["tools"][0]["name"], "search");
        assert!(body["tools"][0]["input_schema"].is_object());
    }

    #[test]
    fn tool_choice_and_thinking_serialize() {
        let req = CompletionRequest {
            tool_choice: Some(crate::ToolChoice {
                kind: crate::ToolChoiceKind::Tool,
                name: Some("search".into()),
                disable_parallel: true,
            }),
            thinking: Some(crate::ThinkingOptions { enabled: true, budget_tokens: 2048 }),
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], "search");
        assert_eq!(body["tool_choice"]["disable_parallel_tool_use"], true);
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
    }

    #[test]
    fn identical_requests_serialize_identically() {
        let req = CompletionRequest {
            messages: vec![Message::user("hello")],
            tools: vec![ToolSchema {
                name: "search".into(),
                description: "d".into(),
                input_schema: json!({"type": "object"}),
            }],
            stream: true,
            ..Default::default()
        };
        let a = serde_json::to_vec(&build_anthropic_body(&req, "m", 64, 0.0)).unwrap();
        let b = serde_json::to_vec(&build_anthropic_body(&req, "m", 64, 0.0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn base64_image_uses_source_block() {
        let req = CompletionRequest {
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Blocks(vec![Block::Image {
                    source_type: crate::ImageSourceType::Base64,
                    source: "iVBORw0KGgo=".into(),
                    mime_type: "image/png".into(),
                    detail: None,
                }]),
            }],
            ..Default::default()
        };
        let body = build_anthropic_body(&req, "m", 1024, 0.2);
        let img = &body["messages"][0]["content"][0];
        assert_eq!(img["source"]["type"], "base64");
        assert_eq!(img["source"]["media_type"], "image/png");
    }
}
