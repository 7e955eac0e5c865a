// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    error::ProviderError, provider::ChunkStream, BlockKind, Capabilities, CompletionRequest,
    FinishReason, StreamChunk, TokenUsage, ToolCallingFormat, ToolUseChunk,
};

/// A pre-scripted provider.  Each call to `stream` pops the next chunk
/// script from the front of the queue, so tests can specify exact event
/// sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamChunk>>>>,
    /// The last `CompletionRequest` seen by this provider.  Written on each
    /// call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Every `CompletionRequest` seen, in order.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from a list of chunk scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the chunk sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: provider that always streams a single text reply in
    /// several deltas, the way a real adapter would.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_script(reply)])
    }

    /// Chunk script for one streamed text reply.
    pub fn text_script(reply: impl Into<String>) -> Vec<StreamChunk> {
        vec![
            StreamChunk::BlockStart { index: 0, kind: BlockKind::Text },
            StreamChunk::TextDelta { index: 0, text: reply.into() },
            StreamChunk::BlockStop { index: 0, tool_use: None },
            StreamChunk::Usage(TokenUsage { input_tokens: 5, output_tokens: 5, ..Default::default() }),
            StreamChunk::MessageDelta { finish_reason: Some(FinishReason::Stop) },
            StreamChunk::Done,
        ]
    }

    /// Chunk script for one streamed tool call (arguments split across two
    /// deltas, as the wire would deliver them).
    pub fn tool_script(
        id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
    ) -> Vec<StreamChunk> {
        let id = id.into();
        let name = name.into();
        let args_text = args.to_string();
        let mut split = args_text.len() / 2;
        while !args_text.is_char_boundary(split) {
            split -= 1;
        }
        vec![
            StreamChunk::BlockStart {
                index: 0,
                kind: BlockKind::ToolUse { id: id.clone(), name: name.clone() },
            },
            StreamChunk::ToolInputDelta { index: 0, partial_json: args_text[..split].to_string() },
            StreamChunk::ToolInputDelta { index: 0, partial_json: args_text[split..].to_string() },
            StreamChunk::BlockStop {
                index: 0,
                tool_use: Some(ToolUseChunk { id, name, input: args, input_error: None }),
            },
            StreamChunk::MessageDelta { finish_reason: Some(FinishReason::ToolUse) },
            StreamChunk::Done,
        ]
    }

    /// Convenience: a tool call on the first round, then a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            Self::tool_script(tool_id, tool_name, args),
            Self::text_script(final_text),
        ])
    }
}

#[async_trait]
impl crate::Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tool_calling: true,
            supports_streaming: true,
            supports_vision: false,
            max_tokens: 4096,
            tool_calling_format: ToolCallingFormat::Custom,
        }
    }

    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);
        let chunks = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                Self::text_script("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<StreamChunk, ProviderError>> =
            chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
