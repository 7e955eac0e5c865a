// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed events carried by the agent bus.
//!
//! Events are grouped into three channels: `Progress` (token deltas and
//! tool lifecycle), `Control` (permission and tool-control handshakes), and
//! `Monitor` (state changes, errors, accounting).  The set is closed —
//! consumers dispatch exhaustively — and the serialized form is tagged by
//! `type` in snake_case so the `kind()` string doubles as the wire tag.

use serde::{Deserialize, Serialize};
use strand_store::{ToolCallRecord, ToolCallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Progress,
    Control,
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Completed,
    Interrupted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionChoice {
    Allow,
    Deny,
}

/// One event on an agent's bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // ── Progress ──────────────────────────────────────────────────────────────
    TextChunkStart { index: u32 },
    TextChunk { index: u32, delta: String },
    TextChunkEnd { index: u32, text: String },
    ThinkChunkStart { index: u32 },
    ThinkChunk { index: u32, delta: String },
    ThinkChunkEnd { index: u32, text: String },
    ToolStart { call: ToolCallRecord },
    ToolProgress {
        call_id: String,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Terminal report for one tool call; `call.state` is one of the
    /// terminal states.
    ToolEnd { call: ToolCallRecord },
    ToolError { call_id: String, error: String },
    /// The current user turn finished.
    Done { reason: DoneReason },

    // ── Control ───────────────────────────────────────────────────────────────
    PermissionRequired { call: ToolCallRecord },
    PermissionDecided {
        call_id: String,
        decision: PermissionChoice,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    ToolPauseRequested { call_id: String },
    ToolResumeRequested { call_id: String },
    ToolCancelRequested { call_id: String },
    AskUser { id: String, questions: Vec<String> },
    UserAnswer { id: String, answer: String },

    // ── Monitor ───────────────────────────────────────────────────────────────
    StateChanged {
        call_id: String,
        from: ToolCallState,
        to: ToolCallState,
    },
    Error {
        severity: ErrorSeverity,
        phase: String,
        message: String,
    },
    TokenUsage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
        cache_write_tokens: u32,
    },
    /// Published on construction with a pre-existing agent id; `sealed`
    /// holds the snapshots that were force-cancelled during recovery.
    AgentResumed { sealed: Vec<ToolCallRecord> },
    FileChanged { path: String },
    SchedulerTriggered { job: String },
    ContextCompressed { tokens_before: usize, tokens_after: usize },
    ManualUpdated { key: String },
}

impl AgentEvent {
    pub fn channel(&self) -> Channel {
        use AgentEvent::*;
        match self {
            TextChunkStart { .. } | TextChunk { .. } | TextChunkEnd { .. }
            | ThinkChunkStart { .. } | ThinkChunk { .. } | ThinkChunkEnd { .. }
            | ToolStart { .. } | ToolProgress { .. } | ToolEnd { .. } | ToolError { .. }
            | Done { .. } => Channel::Progress,

            PermissionRequired { .. } | PermissionDecided { .. }
            | ToolPauseRequested { .. } | ToolResumeRequested { .. }
            | ToolCancelRequested { .. } | AskUser { .. } | UserAnswer { .. } => Channel::Control,

            StateChanged { .. } | Error { .. } | TokenUsage { .. } | AgentResumed { .. }
            | FileChanged { .. } | SchedulerTriggered { .. } | ContextCompressed { .. }
            | ManualUpdated { .. } => Channel::Monitor,
        }
    }

    /// Stable kind string; identical to the serde `type` tag.
    pub fn kind(&self) -> &'static str {
        use AgentEvent::*;
        match self {
            TextChunkStart { .. } => "text_chunk_start",
            TextChunk { .. } => "text_chunk",
            TextChunkEnd { .. } => "text_chunk_end",
            ThinkChunkStart { .. } => "think_chunk_start",
            ThinkChunk { .. } => "think_chunk",
            ThinkChunkEnd { .. } => "think_chunk_end",
            ToolStart { .. } => "tool_start",
            ToolProgress { .. } => "tool_progress",
            ToolEnd { .. } => "tool_end",
            ToolError { .. } => "tool_error",
            Done { .. } => "done",
            PermissionRequired { .. } => "permission_required",
            PermissionDecided { .. } => "permission_decided",
            ToolPauseRequested { .. } => "tool_pause_requested",
            ToolResumeRequested { .. } => "tool_resume_requested",
            ToolCancelRequested { .. } => "tool_cancel_requested",
            AskUser { .. } => "ask_user",
            UserAnswer { .. } => "user_answer",
            StateChanged { .. } => "state_changed",
            Error { .. } => "error",
            TokenUsage { .. } => "token_usage",
            AgentResumed { .. } => "agent_resumed",
            FileChanged { .. } => "file_changed",
            SchedulerTriggered { .. } => "scheduler_triggered",
            ContextCompressed { .. } => "context_compressed",
            ManualUpdated { .. } => "manual_updated",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
