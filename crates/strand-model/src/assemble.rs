// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-index content-block assembly.
//!
//! Every wire dialect interleaves deltas for independent content blocks,
//! each identified by an index.  The assembler tracks which blocks are open,
//! buffers tool-call argument fragments per index, and materializes the
//! accumulated invocation when a block stops.  Validation happens only at
//! stop time: a tool-use block whose accumulated text is not valid JSON
//! degrades to an empty `{}` input with an error marker so the caller can
//! still dispatch (and report) the call.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::{BlockKind, StreamChunk, ToolUseChunk};

enum OpenBlock {
    Text,
    Thinking,
    ToolUse { id: String, name: String, args: String },
}

#[derive(Default)]
pub(crate) struct BlockAssembler {
    open: HashMap<u32, OpenBlock>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, index: u32) -> bool {
        self.open.contains_key(&index)
    }

    /// Register a new block at `index` and emit its start chunk.
    pub fn start(&mut self, index: u32, kind: BlockKind) -> StreamChunk {
        let open = match &kind {
            BlockKind::Text => OpenBlock::Text,
            BlockKind::Thinking => OpenBlock::Thinking,
            BlockKind::ToolUse { id, name } => OpenBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                args: String::new(),
            },
        };
        self.open.insert(index, open);
        StreamChunk::BlockStart { index, kind }
    }

    /// Append an argument fragment to the tool-use block at `index`.
    pub fn tool_input_delta(&mut self, index: u32, partial: &str) -> StreamChunk {
        if let Some(OpenBlock::ToolUse { args, .. }) = self.open.get_mut(&index) {
            args.push_str(partial);
        }
        StreamChunk::ToolInputDelta { index, partial_json: partial.to_string() }
    }

    /// Late id/name fill-in for dialects that may repeat them mid-stream.
    pub fn update_tool_identity(&mut self, index: u32, id: &str, name: &str) {
        if let Some(OpenBlock::ToolUse { id: open_id, name: open_name, .. }) =
            self.open.get_mut(&index)
        {
            if !id.is_empty() {
                *open_id = id.to_string();
            }
            if !name.is_empty() {
                *open_name = name.to_string();
            }
        }
    }

    /// Close the block at `index`.  Tool-use blocks carry their accumulated
    /// invocation on the stop chunk.
    pub fn stop(&mut self, index: u32) -> StreamChunk {
        let tool_use = match self.open.remove(&index) {
            Some(OpenBlock::ToolUse { id, name, args }) => Some(finish_tool_use(id, name, args)),
            _ => None,
        };
        StreamChunk::BlockStop { index, tool_use }
    }

    /// Close every still-open block, lowest index first.  Dialects without
    /// explicit per-block stop events call this at end of message.
    pub fn finish_open(&mut self) -> Vec<StreamChunk> {
        let mut indexes: Vec<u32> = self.open.keys().copied().collect();
        indexes.sort_unstable();
        indexes.into_iter().map(|i| self.stop(i)).collect()
    }
}

/// Parse the accumulated argument text of a finished tool-use block.
///
/// An empty accumulation is a legitimate no-argument call and yields `{}`.
/// Invalid JSON is first run through a conservative repair pass; if that
/// also fails the input degrades to `{}` with the parse error recorded so
/// the orchestrator can dispatch and report the call instead of dropping it.
fn finish_tool_use(id: String, name: String, args: String) -> ToolUseChunk {
    if args.trim().is_empty() {
        return ToolUseChunk {
            id,
            name,
            input: Value::Object(Default::default()),
            input_error: None,
        };
    }
    match serde_json::from_str::<Value>(&args) {
        Ok(input) => ToolUseChunk { id, name, input, input_error: None },
        Err(parse_err) => match attempt_json_repair(&args) {
            Some(input) => {
                warn!(
                    tool_name = %name,
                    tool_use_id = %id,
                    "repaired invalid JSON arguments from model"
                );
                ToolUseChunk { id, name, input, input_error: None }
            }
            None => {
                warn!(
                    tool_name = %name,
                    tool_use_id = %id,
                    error = %parse_err,
                    "tool call arguments are not valid JSON; substituting {{}}"
                );
                ToolUseChunk {
                    id,
                    name,
                    input: Value::Object(Default::default()),
                    input_error: Some(parse_err.to_string()),
                }
            }
        },
    }
}

/// Attempt to repair common JSON syntax errors in model output:
/// invalid escape sequences inside string values, and truncated objects
/// missing their closing quote/brace.
fn attempt_json_repair(json_str: &str) -> Option<Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<Value>(&fixed) {
        return Some(v);
    }

    // Truncated object: close an unbalanced string, then the object itself.
    if !fixed.trim().ends_with('}') {
        let mut completed = fixed;
        let quote_count = completed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        completed.push('}');
        if let Ok(v) = serde_json::from_str::<Value>(&completed) {
            return Some(v);
        }
    }

    None
}

/// Walk through a JSON string and replace any invalid escape sequences inside
/// string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`, `t`, `u`.
/// Anything else (e.g. `\c`, `\p`, `\(`) is turned into `\\X` so the
/// resulting JSON round-trips through serde_json without a parse error.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
