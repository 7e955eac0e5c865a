// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared base implementation for OpenAI-compatible chat completion APIs.
//!
//! A large family of providers speaks the same `/chat/completions` SSE wire
//! format.  This module provides a single `OpenAICompatProvider` that every
//! such driver configures with its own defaults (URL, auth style, headers).
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` (Azure-style gateways)
//! - `None` — no authentication (local servers)
//!
//! Unlike the Anthropic dialect, this format has no per-block indexes on the
//! wire: text, reasoning, and each parallel tool call stream as independent
//! delta fields.  The adapter synthesizes block indexes so downstream
//! consumers see the same per-index lifecycle for every dialect: text is
//! block 0, reasoning block 1, and tool call `i` becomes block `2 + i`.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    assemble::BlockAssembler,
    error::ProviderError,
    http, is_reasoning_model,
    provider::ChunkStream,
    retry::{with_retry, RetryPolicy},
    sse::{drain_data_lines, SseScanState},
    Block, BlockKind, Capabilities, CompletionRequest, FinishReason, ImageSourceType, Message,
    MessageContent, Role, StreamChunk, TokenUsage, ToolCallingFormat,
};

/// Synthesized block index for streamed answer text.
const TEXT_INDEX: u32 = 0;
/// Synthesized block index for streamed reasoning text.
const THINKING_INDEX: u32 = 1;
/// Tool call `i` on the wire becomes block `TOOL_INDEX_BASE + i`.
const TOOL_INDEX_BASE: u32 = 2;

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
    None,
}

pub struct OpenAICompatProvider {
    /// Provider id returned by `Provider::name()`.
    driver_name: &'static str,
    model: String,
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
    /// Extra key-value pairs merged verbatim into the request body
    /// (populated from `ModelConfig.driver_options`).
    extra_body: Value,
    retry: RetryPolicy,
}

impl OpenAICompatProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        extra_headers: Vec<(String, String)>,
        auth_style: AuthStyle,
        extra_body: Value,
        retry: RetryPolicy,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            extra_headers,
            auth_style,
            extra_body,
            retry,
        }
    }
}

#[async_trait]
impl crate::Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
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
            tool_calling_format: ToolCallingFormat::OpenAi,
        }
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let body = build_openai_body(
            &req,
            &self.model,
            self.driver_name,
            self.max_tokens,
            self.temperature,
            &self.extra_body,
        );

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );
        tracing::trace!(request_body = ?body, "full completion request");

        // Resolve the key up front: a missing key is an auth error, not
        // something retries can fix.
        let key = match self.auth_style {
            AuthStyle::Bearer | AuthStyle::ApiKeyHeader => {
                Some(self.api_key.as_deref().ok_or_else(|| ProviderError::Auth {
                    message: "API key not set; provide api_key or api_key_env in config".into(),
                })?)
            }
            AuthStyle::None => None,
        };

        let resp = with_retry(&self.retry, || {
            let mut attempt = http::client().post(&self.chat_url).json(&body);
            attempt = match (self.auth_style, key) {
                (AuthStyle::Bearer, Some(key)) => attempt.bearer_auth(key),
                (AuthStyle::ApiKeyHeader, Some(key)) => attempt.header("api-key", key),
                _ => attempt,
            };
            for (name, val) in &self.extra_headers {
                attempt = attempt.header(name.as_str(), val.as_str());
            }
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
                                // No per-block stop events on this dialect;
                                // close whatever is still open first.
                                out.extend(state.asm.finish_open().into_iter().map(Ok));
                                out.push(Ok(StreamChunk::Done));
                                continue;
                            }
                            match serde_json::from_str::<Value>(&payload) {
                                Ok(v) => out.extend(
                                    parse_openai_chunk(&v, &mut state.asm)
                                        .into_iter()
                                        .map(Ok),
                                ),
                                Err(e) => {
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

/// Translate one parsed `/chat/completions` SSE chunk into stream chunks.
pub(crate) fn parse_openai_chunk(v: &Value, asm: &mut BlockAssembler) -> Vec<StreamChunk> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        // OpenAI reports cached tokens under prompt_tokens_details; some
        // compatible backends report prompt_cache_hit_tokens at the root.
        let cache_read_tokens = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
            .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(|t| t.as_u64()))
            .unwrap_or(0) as u32;
        return vec![StreamChunk::Usage(TokenUsage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens,
            cache_write_tokens: 0,
        })];
    }

    let choice = &v["choices"][0];
    let delta = &choice["delta"];
    let mut out = Vec::new();

    // Tool call deltas — parallel calls are identified by an "index" field;
    // arguments arrive as partial strings across many chunks.
    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            let wire_index = tc["index"].as_u64().unwrap_or(0) as u32;
            let index = TOOL_INDEX_BASE + wire_index;
            let id = tc["id"].as_str().unwrap_or("");
            let name = tc["function"]["name"].as_str().unwrap_or("");
            if !asm.is_open(index) {
                out.push(asm.start(
                    index,
                    BlockKind::ToolUse { id: id.to_string(), name: name.to_string() },
                ));
            } else {
                asm.update_tool_identity(index, id, name);
            }
            let args = tc["function"]["arguments"].as_str().unwrap_or("");
            if !args.is_empty() {
                out.push(asm.tool_input_delta(index, args));
            }
        }
    }

    // Thinking delta — two common field names for chain-of-thought text:
    //   • `reasoning_content` — llama.cpp, Qwen3, DeepSeek-R1
    //   • `reasoning`         — aggregator gateways
    let thinking_text = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(thinking) = thinking_text {
        if !thinking.is_empty() {
            if !asm.is_open(THINKING_INDEX) {
                out.push(asm.start(THINKING_INDEX, BlockKind::Thinking));
            }
            out.push(StreamChunk::ReasoningDelta {
                index: THINKING_INDEX,
                text: thinking.to_string(),
            });
        }
    }

    // Text delta.
    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            if !asm.is_open(TEXT_INDEX) {
                out.push(asm.start(TEXT_INDEX, BlockKind::Text));
            }
            out.push(StreamChunk::TextDelta { index: TEXT_INDEX, text: text.to_string() });
        }
    }

    // The final content chunk carries finish_reason; all open blocks close
    // here so tool-use accumulations materialize before Done.
    if let Some(reason) = choice["finish_reason"].as_str() {
        out.extend(asm.finish_open());
        let finish_reason = match reason {
            "stop" => Some(FinishReason::Stop),
            "tool_calls" => Some(FinishReason::ToolUse),
            "length" => Some(FinishReason::MaxTokens),
            _ => None,
        };
        out.push(StreamChunk::MessageDelta { finish_reason });
    }

    out
}

/// Build the `/chat/completions` request body.
///
/// The system prompt is injected as the first message with `role: system`.
/// Tool results are emitted as standalone `role: "tool"` messages — one per
/// result, never batched into a user message.  Reasoning models never
/// receive the `temperature` parameter.
pub(crate) fn build_openai_body(
    req: &CompletionRequest,
    model: &str,
    driver_name: &str,
    max_tokens: u32,
    temperature: f32,
    extra_body: &Value,
) -> Value {
    let messages = build_openai_messages(&req.messages, req.system.as_deref());

    let tools: Vec<Value> = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                }
            })
        })
        .collect();

    // OpenAI proper uses "max_completion_tokens" for current models; the
    // compatible ecosystem still expects "max_tokens".
    let max_tokens_key = if driver_name == "openai" { "max_completion_tokens" } else { "max_tokens" };

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": req.stream,
        max_tokens_key: req.max_tokens.unwrap_or(max_tokens),
        "stream_options": { "include_usage": true },
    });
    if !is_reasoning_model(model) {
        body["temperature"] = json!(req.temperature.unwrap_or(temperature));
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    if let Some(tc) = &req.tool_choice {
        body["tool_choice"] = match tc.kind {
            crate::ToolChoiceKind::Auto => json!("auto"),
            crate::ToolChoiceKind::Any => json!("required"),
            crate::ToolChoiceKind::Tool => json!({
                "type": "function",
                "function": { "name": tc.name.clone().unwrap_or_default() },
            }),
        };
        if tc.disable_parallel {
            body["parallel_tool_calls"] = json!(false);
        }
    }
    if let Some(rf) = &req.response_format {
        body["response_format"] = rf.clone();
    }

    // Merge driver_options into the request; user-supplied keys win so
    // provider-specific behaviour can be tuned without code changes.
    if let Some(map) = extra_body.as_object() {
        for (k, v) in map {
            body[k] = v.clone();
        }
    }
    body
}

/// Convert canonical messages into the wire-format JSON array.
///
/// Extracted as a free function so it can be unit-tested without HTTP.
pub(crate) fn build_openai_messages(messages: &[Message], system: Option<&str>) -> Vec<Value> {
    let mut result: Vec<Value> = Vec::with_capacity(messages.len() + 1);

    if let Some(sys) = system {
        result.push(json!({ "role": "system", "content": sys }));
    }

    for m in messages {
        if m.role == Role::System && system.is_some() {
            // Explicit system option supersedes in-conversation system turns.
            continue;
        }
        match &m.content {
            MessageContent::Text(t) => {
                result.push(json!({ "role": role_str(&m.role), "content": t }));
            }
            MessageContent::Blocks(blocks) => {
                push_block_messages(&mut result, m, blocks);
            }
        }
    }
    result
}

fn push_block_messages(result: &mut Vec<Value>, m: &Message, blocks: &[Block]) {
    // Assistant turns: text parts collapse into `content`; tool-use blocks
    // become the `tool_calls` array of a single assistant message.
    if m.role == Role::Assistant {
        let mut text = String::new();
        let mut calls: Vec<Value> = Vec::new();
        for b in blocks {
            match b {
                Block::Text { text: t } => text.push_str(t),
                Block::ToolUse { id, name, input } => calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                })),
                _ => {}
            }
        }
        let mut msg = json!({ "role": "assistant" });
        msg["content"] = if text.is_empty() { Value::Null } else { json!(text) };
        if !calls.is_empty() {
            msg["tool_calls"] = json!(calls);
        }
        result.push(msg);
        return;
    }

    // Tool results: one standalone role:"tool" message per result block.
    let mut parts: Vec<Value> = Vec::new();
    for b in blocks {
        match b {
            Block::ToolResult { tool_use_id, content, .. } => {
                result.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                }));
            }
            Block::Text { text } => parts.push(json!({ "type": "text", "text": text })),
            Block::Image { source_type, source, mime_type, detail } => {
                let url = match source_type {
                    ImageSourceType::Url => source.clone(),
                    ImageSourceType::Base64 => format!("data:{mime_type};base64,{source}"),
                };
                let mut img = json!({ "url": url });
                if let Some(d) = detail {
                    img["detail"] = json!(d);
                }
                parts.push(json!({ "type": "image_url", "image_url": img }));
            }
            Block::ToolUse { .. } => {}
        }
    }
    if !parts.is_empty() {
        result.push(json!({ "role": role_str(&m.role), "content": parts }));
    }
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolUseChunk;
    use serde_json::json;

    fn parse_all(chunks: &[Value]) -> Vec<StreamChunk> {
        let mut asm = BlockAssembler::new();
        chunks.iter().flat_map(|v| parse_openai_chunk(v, &mut asm)).collect()
    }

    // ── parse_openai_chunk ────────────────────────────────────────────────────

    #[test]
    fn text_delta_synthesizes_block_start() {
        let chunks = parse_all(&[json!({ "choices": [{ "delta": { "content": "hello" } }] })]);
        assert!(matches!(chunks[0], StreamChunk::BlockStart { index: 0, kind: BlockKind::Text }));
        assert!(matches!(&chunks[1], StreamChunk::TextDelta { index: 0, text } if text == "hello"));
    }

    #[test]
    fn second_text_delta_reuses_open_block() {
        let chunks = parse_all(&[
            json!({ "choices": [{ "delta": { "content": "a" } }] }),
            json!({ "choices": [{ "delta": { "content": "b" } }] }),
        ]);
        assert_eq!(chunks.len(), 3, "one start + two deltas: {chunks:?}");
    }

    #[test]
    fn empty_delta_produces_nothing() {
        assert!(parse_all(&[json!({ "choices": [{ "delta": {} }] })]).is_empty());
    }

    #[test]
    fn reasoning_content_maps_to_reasoning_block() {
        let chunks =
            parse_all(&[json!({ "choices": [{ "delta": { "reasoning_content": "hmm" } }] })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::BlockStart { index: 1, kind: BlockKind::Thinking }
        ));
        assert!(matches!(&chunks[1], StreamChunk::ReasoningDelta { text, .. } if text == "hmm"));
    }

    #[test]
    fn aggregator_reasoning_field_also_maps() {
        let chunks = parse_all(&[json!({ "choices": [{ "delta": { "reasoning": "think" } }] })]);
        assert!(matches!(&chunks[1], StreamChunk::ReasoningDelta { text, .. } if text == "think"));
    }

    #[test]
    fn tool_call_arguments_accumulate_across_chunks() {
        let chunks = parse_all(&[
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "function": { "name": "search", "arguments": "" } }
            ]}}]}),
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "{\"q\":" } }
            ]}}]}),
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "\"x\"}" } }
            ]}}]}),
            json!({ "choices": [{ "delta": {}, "finish_reason": "tool_calls" }] }),
        ]);
        let stop = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::BlockStop { tool_use: Some(tu), .. } => Some(tu.clone()),
                _ => None,
            })
            .expect("tool-use stop chunk");
        assert_eq!(stop.id, "call_1");
        assert_eq!(stop.name, "search");
        assert_eq!(stop.input["q"], "x");
        assert!(matches!(
            chunks.last(),
            Some(StreamChunk::MessageDelta { finish_reason: Some(FinishReason::ToolUse) })
        ));
    }

    #[test]
    fn parallel_tool_calls_use_distinct_indexes() {
        let chunks = parse_all(&[json!({ "choices": [{ "delta": { "tool_calls": [
            { "index": 0, "id": "a", "function": { "name": "one", "arguments": "{}" } },
            { "index": 1, "id": "b", "function": { "name": "two", "arguments": "{}" } }
        ]}}]})]);
        let starts: Vec<u32> = chunks
            .iter()
            .filter_map(|c| match c {
                StreamChunk::BlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![2, 3]);
    }

    #[test]
    fn finish_reason_length_maps_to_max_tokens() {
        let chunks = parse_all(&[json!({ "choices": [{ "delta": {}, "finish_reason": "length" }] })]);
        assert!(matches!(
            chunks.last(),
            Some(StreamChunk::MessageDelta { finish_reason: Some(FinishReason::MaxTokens) })
        ));
    }

    #[test]
    fn usage_chunk_parses_cached_tokens() {
        let chunks = parse_all(&[json!({
            "choices": [],
            "usage": {
                "prompt_tokens": 100,
                "completion_tokens": 30,
                "prompt_tokens_details": { "cached_tokens": 64 }
            }
        })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::Usage(TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
                cache_read_tokens: 64,
                ..
            })
        ));
    }

    #[test]
    fn deepseek_cache_hit_field_is_understood() {
        let chunks = parse_all(&[json!({
            "choices": [],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2, "prompt_cache_hit_tokens": 8 }
        })]);
        assert!(matches!(
            chunks[0],
            StreamChunk::Usage(TokenUsage { cache_read_tokens: 8, .. })
        ));
    }

    #[test]
    fn truncated_tool_arguments_degrade_at_finish() {
        let chunks = parse_all(&[
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "c", "function": { "name": "f", "arguments": "{\"a\": [1," } }
            ]}}]}),
            json!({ "choices": [{ "delta": {}, "finish_reason": "length" }] }),
        ]);
        let tu: ToolUseChunk = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::BlockStop { tool_use: Some(tu), .. } => Some(tu.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(tu.input, json!({}));
        assert!(tu.input_error.is_some());
    }

    // ── build_openai_messages ─────────────────────────────────────────────────

    #[test]
    fn system_option_injected_as_first_message() {
        let msgs = build_openai_messages(&[Message::user("hi")], Some("be brief"));
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "be brief");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn assistant_tool_uses_become_tool_calls_array() {
        let m = Message::assistant_blocks(vec![
            Block::text("let me check"),
            Block::tool_use("call_1", "search", json!({"q": "x"})),
            Block::tool_use("call_2", "fetch", json!({"u": "y"})),
        ]);
        let msgs = build_openai_messages(&[m], None);
        assert_eq!(msgs.len(), 1);
        let calls = msgs[0]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["id"], "call_1");
        assert_eq!(calls[0]["function"]["name"], "search");
        // arguments are a JSON-encoded string on this dialect
        assert_eq!(calls[0]["function"]["arguments"], "{\"q\":\"x\"}");
        assert_eq!(msgs[0]["content"], "let me check");
    }

    #[test]
    fn tool_results_are_standalone_tool_messages() {
        let m = Message {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![
                Block::tool_result("call_1", "result one"),
                Block::tool_result("call_2", "result two"),
            ]),
        };
        let msgs = build_openai_messages(&[m], None);
        assert_eq!(msgs.len(), 2, "one wire message per result, never batched");
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "call_1");
        assert_eq!(msgs[1]["tool_call_id"], "call_2");
    }

    #[test]
    fn user_image_blocks_become_image_url_parts() {
        let m = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                Block::text("what is this?"),
                Block::Image {
                    source_type: ImageSourceType::Base64,
                    source: "AAAA".into(),
                    mime_type: "image/png".into(),
                    detail: Some("low".into()),
                },
            ]),
        };
        let msgs = build_openai_messages(&[m], None);
        let parts = msgs[0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert_eq!(parts[1]["image_url"]["detail"], "low");
    }

    // ── build_openai_body ─────────────────────────────────────────────────────

    #[test]
    fn temperature_sent_for_ordinary_models() {
        let req = CompletionRequest { stream: true, ..Default::default() };
        let body = build_openai_body(&req, "gpt-4o", "openai", 64, 0.4, &Value::Null);
        assert!((body["temperature"].as_f64().unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(body["max_completion_tokens"], 64);
    }

    #[test]
    fn temperature_suppressed_for_reasoning_models() {
        let req = CompletionRequest { stream: true, ..Default::default() };
        for model in ["o1-mini", "o3-large", "deepseek-r1"] {
            let body = build_openai_body(&req, model, "openai", 64, 0.4, &Value::Null);
            assert!(body.get("temperature").is_none(), "model {model} must not get temperature");
        }
    }

    #[test]
    fn compat_drivers_use_max_tokens_key() {
        let req = CompletionRequest::default();
        let body = build_openai_body(&req, "llama3", "ollama", 128, 0.2, &Value::Null);
        assert_eq!(body["max_tokens"], 128);
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn extra_body_keys_override_computed_keys() {
        let req = CompletionRequest { stream: true, ..Default::default() };
        let extra = json!({ "temperature": 0.9, "reasoning_format": "deepseek" });
        let body = build_openai_body(&req, "qwen3", "ollama", 64, 0.2, &extra);
        assert!((body["temperature"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert_eq!(body["reasoning_format"], "deepseek");
    }

    #[test]
    fn response_format_forwarded_verbatim() {
        let mut req = CompletionRequest::default();
        req.response_format = Some(json!({ "type": "json_object" }));
        let body = build_openai_body(&req, "m", "groq", 64, 0.2, &Value::Null);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn tool_choice_variants_serialize() {
        let mut req = CompletionRequest::default();
        req.tool_choice = Some(crate::ToolChoice {
            kind: crate::ToolChoiceKind::Tool,
            name: Some("search".into()),
            disable_parallel: true,
        });
        let body = build_openai_body(&req, "m", "groq", 64, 0.2, &Value::Null);
        assert_eq!(body["tool_choice"]["function"]["name"], "search");
        assert_eq!(body["parallel_tool_calls"], false);
    }
}
