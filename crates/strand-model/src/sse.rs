// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared SSE line handling for the streaming adapters.
//!
//! SSE events can be split across TCP packets, so each adapter carries a
//! remainder buffer forward between chunks.  Only complete lines
//! (terminated by `\n`) are consumed; the trailing partial line stays in
//! the buffer until the next chunk extends it.

use crate::assemble::BlockAssembler;

/// Per-stream scan state threaded through `futures::StreamExt::scan`.
pub(crate) struct SseScanState {
    pub buf: String,
    pub asm: BlockAssembler,
    /// Set once the end marker has been emitted; everything after is dropped
    /// so the stream ends exactly once.
    pub done: bool,
}

impl SseScanState {
    pub fn new() -> Self {
        Self { buf: String::new(), asm: BlockAssembler::new(), done: false }
    }
}

/// Drain every complete line from `buf` and return the payloads of its
/// `data:` lines.  Windows-style `\r\n` endings are tolerated; empty
/// payloads, comments, and non-data fields are skipped.
pub(crate) fn drain_data_lines(buf: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        buf.drain(..=nl_pos);
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
    }
    payloads
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
