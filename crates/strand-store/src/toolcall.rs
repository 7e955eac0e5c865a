// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persisted tool-call record schema and its lifecycle state machine.
//!
//! The same record serves as the durable row and the live snapshot sent on
//! events; both sides of the system agree on one schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of one tool invocation.
///
/// ```text
/// queued → pending → executing → succeeded
///                               ↘ failed
///                               ↘ pausing → paused → executing
///                               ↘ cancelling → cancelled
/// ```
///
/// Terminal states are absorbing: a record never leaves `succeeded`,
/// `failed`, or `cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallState {
    Queued,
    Pending,
    Executing,
    Pausing,
    Paused,
    Cancelling,
    Cancelled,
    Succeeded,
    Failed,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Any non-terminal state may move to `cancelling`; everything else
    /// follows the lifecycle edges.  Self-transitions are rejected except
    /// where the control surface treats a repeat request as a no-op
    /// (handled by the caller, not here).
    pub fn can_transition_to(self, to: ToolCallState) -> bool {
        use ToolCallState::*;
        if self.is_terminal() {
            return false;
        }
        if to == Cancelling {
            return self != Cancelling;
        }
        matches!(
            (self, to),
            (Queued, Pending)
                | (Pending, Executing)
                | (Executing, Succeeded)
                | (Executing, Failed)
                | (Executing, Pausing)
                | (Pausing, Paused)
                | (Paused, Executing)
                | (Cancelling, Cancelled)
                // A queued call that is denied or errors before reaching the
                // runner fails directly.
                | (Queued, Failed)
                | (Pending, Failed)
        )
    }
}

/// Durable record and live snapshot of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub state: ToolCallState,
    /// Completion fraction in `[0, 1]`; only increases while executing.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Runner-reported intermediate data (partial output, counters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelable: bool,
    pub pausable: bool,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            input,
            state: ToolCallState::Queued,
            progress: 0.0,
            result: None,
            error: None,
            intermediate: None,
            started_at: now,
            updated_at: now,
            cancelable: true,
            pausable: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
