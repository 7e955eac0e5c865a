// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The platform's own compact completion dialect.
//!
//! Self-hosted model gateways behind this runtime speak a flat SSE schema:
//! `POST /v1/complete` with bearer auth, canonical messages in the body, and
//! one JSON object per `data:` line, discriminated by `type`:
//!
//! ```text
//! {"type":"text","delta":"Hi"}
//! {"type":"reasoning","delta":"…"}
//! {"type":"tool_call","id":"t1","name":"search","arguments_delta":"{\"q\":"}
//! {"type":"usage","input_tokens":12,"output_tokens":4}
//! {"type":"finish","reason":"tool_use"}
//! {"type":"error","message":"…"}
//! {"type":"done"}
//! ```
//!
//! There are no block indexes on the wire; the adapter synthesizes them the
//! same way the OpenAI-compatible adapter does (text 0, reasoning 1, tool
//! calls from 2 up, in order of first appearance).

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::ProviderError,
    http,
    provider::ChunkStream,
    retry::{with_retry, RetryPolicy},
    sse::{drain_data_lines, SseScanState},
    BlockKind, Capabilities, CompletionRequest, FinishReason, StreamChunk, TokenUsage,
    ToolCallingFormat,
};

const TEXT_INDEX: u32 = 0;
const THINKING_INDEX: u32 = 1;
const TOOL_INDEX_BASE: u32 = 2;

pub struct CustomProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

impl CustomProvider {
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
            base_url: base_url.unwrap_or_else(|| "http://localhost:8700".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            retry,
        }
    }
}

/// Scan state: the shared SSE state plus the id → synthesized-index map for
/// tool calls (the wire identifies them by id only).
struct CustomScanState {
    inner: SseScanState,
    tool_indexes: HashMap<String, u32>,
}

impl CustomScanState {
    fn new() -> Self {
        Self { inner: SseScanState::new(), tool_indexes: HashMap::new() }
    }

    fn tool_index(&mut self, id: &str) -> u32 {
        let next = TOOL_INDEX_BASE + self.tool_indexes.len() as u32;
        *self.tool_indexes.entry(id.to_string()).or_insert(next)
    }
}

#[async_trait]
impl crate::Provider for CustomProvider {
    fn name(&self) -> &str {
        "custom"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tool_calling: true,
            supports_streaming: true,
            supports_vision: false,
            max_tokens: self.max_tokens,
            tool_calling_format: ToolCallingFormat::Custom,
        }
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": req.messages,
            "stream": req.stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
        });
        if let Some(system) = &req.system {
            body["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            body["tools"] = json!(req.tools);
        }
        if let Some(rf) = &req.response_format {
            body["response_format"] = rf.clone();
        }

        debug!(model = %self.model, "sending custom-dialect request");

        let url = format!("{}/v1/complete", self.base_url.trim_end_matches('/'));
        let resp = with_retry(&self.retry, || {
            let mut attempt = http::client().post(&url).json(&body);
            if let Some(key) = &self.api_key {
                attempt = attempt.bearer_auth(key);
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
            .scan(CustomScanState::new(), |state, chunk| {
                let items: Vec<Result<StreamChunk, ProviderError>> = match chunk {
                    Ok(bytes) => {
                        state.inner.buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut out = Vec::new();
                        for payload in drain_data_lines(&mut state.inner.buf) {
                            if state.inner.done {
                                break;
                            }
                            if payload == "[DONE]" {
                                state.inner.done = true;
                                out.extend(state.inner.asm.finish_open().into_iter().map(Ok));
                                out.push(Ok(StreamChunk::Done));
                                continue;
                            }
                            match serde_json::from_str::<Value>(&payload) {
                                Ok(v) => out.extend(
                                    parse_custom_event(&v, state).into_iter().map(Ok),
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

fn parse_custom_event(v: &Value, state: &mut CustomScanState) -> Vec<StreamChunk> {
    match v["type"].as_str().unwrap_or("") {
        "text" => {
            let text = v["delta"].as_str().unwrap_or("").to_string();
            if text.is_empty() {
                return vec![];
            }
            let mut out = Vec::new();
            if !state.inner.asm.is_open(TEXT_INDEX) {
                out.push(state.inner.asm.start(TEXT_INDEX, BlockKind::Text));
            }
            out.push(StreamChunk::TextDelta { index: TEXT_INDEX, text });
            out
        }
        "reasoning" => {
            let text = v["delta"].as_str().unwrap_or("").to_string();
            if text.is_empty() {
                return vec![];
            }
            let mut out = Vec::new();
            if !state.inner.asm.is_open(THINKING_INDEX) {
                out.push(state.inner.asm.start(THINKING_INDEX, BlockKind::Thinking));
            }
            out.push(StreamChunk::ReasoningDelta { index: THINKING_INDEX, text });
            out
        }
        "tool_call" => {
            let id = v["id"].as_str().unwrap_or("");
            let name = v["name"].as_str().unwrap_or("");
            let index = state.tool_index(id);
            let mut out = Vec::new();
            if !state.inner.asm.is_open(index) {
                out.push(state.inner.asm.start(
                    index,
                    BlockKind::ToolUse { id: id.to_string(), name: name.to_string() },
                ));
            } else {
                state.inner.asm.update_tool_identity(index, id, name);
            }
            if let Some(args) = v["arguments_delta"].as_str() {
                if !args.is_empty() {
                    out.push(state.inner.asm.tool_input_delta(index, args));
                }
            }
            out
        }
        "usage" => vec![StreamChunk::Usage(TokenUsage {
            input_tokens: v["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: v["output_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: v["cache_read_tokens"].as_u64().unwrap_or(0) as u32,
            cache_write_tokens: v["cache_write_tokens"].as_u64().unwrap_or(0) as u32,
        })],
        "finish" => {
            let mut out = state.inner.asm.finish_open();
            let finish_reason = match v["reason"].as_str().unwrap_or("") {
                "stop" => Some(FinishReason::Stop),
                "tool_use" => Some(FinishReason::ToolUse),
                "max_tokens" => Some(FinishReason::MaxTokens),
                _ => None,
            };
            out.push(StreamChunk::MessageDelta { finish_reason });
            out
        }
        "error" => {
            let message = v["message"].as_str().unwrap_or("unspecified error").to_string();
            vec![StreamChunk::Error(message)]
        }
        "done" => {
            state.inner.done = true;
            let mut out = state.inner.asm.finish_open();
            out.push(StreamChunk::Done);
            out
        }
        _ => vec![],
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
