// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

use crate::{
    error::ProviderError, Block, Capabilities, CompletionRequest, FinishReason, Message,
    MessageContent, Role, StreamChunk, TokenUsage,
};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// A finished (non-streaming) completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub message: Message,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Static description of what this provider/model combination supports.
    fn capabilities(&self) -> Capabilities;

    /// Open a streaming completion.  The returned stream yields chunks until
    /// the remote emits its end marker or the stream errors; it ends exactly
    /// once.
    async fn stream(&self, req: CompletionRequest) -> Result<ChunkStream, ProviderError>;

    /// Non-streaming counterpart of [`stream`](Provider::stream).
    ///
    /// The default implementation drives the streaming path and coalesces
    /// the chunks into a single assistant [`Message`].  Override only when
    /// the remote offers a materially different non-streaming endpoint.
    async fn complete(&self, mut req: CompletionRequest) -> Result<Completion, ProviderError> {
        req.stream = true;
        let stream = self.stream(req).await?;
        collect_stream(stream).await
    }
}

/// Fold a chunk stream into a completed assistant message.
///
/// Text deltas accumulate per index; tool-use blocks materialize from their
/// stop chunks; reasoning deltas are discarded (they are not part of the
/// assistant message).  A mid-stream [`StreamChunk::Error`] is tolerated: if
/// any content was produced before it, the partial message is returned with
/// `finish_reason = Error`; otherwise the error is surfaced.
pub async fn collect_stream(mut stream: ChunkStream) -> Result<Completion, ProviderError> {
    use std::collections::BTreeMap;

    let mut texts: BTreeMap<u32, String> = BTreeMap::new();
    let mut tools: BTreeMap<u32, Block> = BTreeMap::new();
    let mut usage = TokenUsage::default();
    let mut finish_reason: Option<FinishReason> = None;
    let mut stream_error: Option<String> = None;

    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::TextDelta { index, text } => {
                texts.entry(index).or_default().push_str(&text);
            }
            StreamChunk::BlockStop { index, tool_use: Some(tu) } => {
                tools.insert(index, Block::tool_use(tu.id, tu.name, tu.input));
            }
            StreamChunk::Usage(u) => usage.merge(&u),
            StreamChunk::MessageDelta { finish_reason: Some(r) } => finish_reason = Some(r),
            StreamChunk::Error(e) => stream_error = Some(e),
            StreamChunk::Done => break,
            _ => {}
        }
    }

    let mut blocks: BTreeMap<u32, Block> = tools;
    for (index, text) in texts {
        if !text.is_empty() {
            blocks.insert(index, Block::Text { text });
        }
    }

    if blocks.is_empty() {
        if let Some(e) = stream_error {
            return Err(ProviderError::Stream(e));
        }
    }

    let had_tools = blocks.values().any(|b| matches!(b, Block::ToolUse { .. }));
    let blocks: Vec<Block> = blocks.into_values().collect();
    let content = match blocks.as_slice() {
        [Block::Text { text }] => MessageContent::Text(text.clone()),
        _ => MessageContent::Blocks(blocks),
    };

    let finish_reason = if stream_error.is_some() {
        FinishReason::Error
    } else {
        finish_reason.unwrap_or(if had_tools { FinishReason::ToolUse } else { FinishReason::Stop })
    };

    Ok(Completion {
        message: Message { role: Role::Assistant, content },
        usage,
        finish_reason,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
