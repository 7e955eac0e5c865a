// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::AgentEvent;

/// Position handle in an agent's event stream.
///
/// Opaque to external consumers; only the bus produces bookmarks.  The
/// cursor is strictly monotonic per agent across all channels, so a
/// bookmark totally orders events regardless of channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub cursor: u64,
    pub timestamp: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(cursor: u64) -> Self {
        Self { cursor, timestamp: Utc::now() }
    }
}

/// An event wrapped with its position in the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub cursor: u64,
    pub bookmark: Bookmark,
    pub event: AgentEvent,
}

impl EventEnvelope {
    pub fn new(cursor: u64, event: AgentEvent) -> Self {
        Self { cursor, bookmark: Bookmark::new(cursor), event }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
