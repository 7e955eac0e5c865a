// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Live tool-call table.
//!
//! Holds every invocation of the current agent keyed by id, and guards all
//! record mutation behind the lifecycle state machine: transitions are
//! linearizable (one lock), terminal states absorb, progress is monotone
//! and only advances while executing, and `result`/`error` are populated
//! exactly according to the final state.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use strand_store::{ToolCallRecord, ToolCallState};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("unknown tool call: {0}")]
    UnknownCall(String),
    #[error("invalid transition {from:?} → {to:?} for call {id}")]
    Invalid { id: String, from: ToolCallState, to: ToolCallState },
}

/// A successful transition, reported for event publication.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: ToolCallState,
    pub to: ToolCallState,
}

#[derive(Default)]
pub struct ToolCallTable {
    calls: Mutex<HashMap<String, ToolCallRecord>>,
}

impl ToolCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ToolCallRecord) {
        let mut calls = self.calls.lock().expect("table lock");
        calls.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<ToolCallRecord> {
        self.calls.lock().expect("table lock").get(id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ToolCallRecord> {
        let mut records: Vec<ToolCallRecord> =
            self.calls.lock().expect("table lock").values().cloned().collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub fn state(&self, id: &str) -> Option<ToolCallState> {
        self.calls.lock().expect("table lock").get(id).map(|r| r.state)
    }

    /// Move `id` to `to`, validating against the state machine.
    pub fn transition(&self, id: &str, to: ToolCallState) -> Result<Transition, TransitionError> {
        self.mutate(id, to, |_| {})
    }

    /// Terminal success: state → `succeeded`, result attached.
    pub fn complete_success(
        &self,
        id: &str,
        result: Value,
    ) -> Result<Transition, TransitionError> {
        self.mutate(id, ToolCallState::Succeeded, |rec| {
            rec.result = Some(result);
        })
    }

    /// Terminal failure: state → `failed`, error attached.
    pub fn complete_failure(
        &self,
        id: &str,
        error: impl Into<String>,
    ) -> Result<Transition, TransitionError> {
        let error = error.into();
        self.mutate(id, ToolCallState::Failed, move |rec| {
            rec.error = Some(error);
        })
    }

    /// Terminal cancellation: state → `cancelled`, reason attached.
    pub fn complete_cancelled(
        &self,
        id: &str,
        reason: impl Into<String>,
    ) -> Result<Transition, TransitionError> {
        let reason = reason.into();
        self.mutate(id, ToolCallState::Cancelled, move |rec| {
            rec.error = Some(reason);
        })
    }

    /// Progress update; applied only while executing and never backwards.
    /// Returns the stored value.
    pub fn set_progress(
        &self,
        id: &str,
        progress: f64,
        message_intermediate: Option<Value>,
    ) -> Option<f64> {
        let mut calls = self.calls.lock().expect("table lock");
        let rec = calls.get_mut(id)?;
        if rec.state != ToolCallState::Executing {
            return Some(rec.progress);
        }
        let clamped = progress.clamp(0.0, 1.0);
        if clamped > rec.progress {
            rec.progress = clamped;
            rec.updated_at = Utc::now();
        }
        if let Some(intermediate) = message_intermediate {
            rec.intermediate = Some(intermediate);
        }
        Some(rec.progress)
    }

    /// Ids of calls in any non-terminal state.
    pub fn live_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("table lock")
            .values()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.id.clone())
            .collect()
    }

    fn mutate(
        &self,
        id: &str,
        to: ToolCallState,
        apply: impl FnOnce(&mut ToolCallRecord),
    ) -> Result<Transition, TransitionError> {
        let mut calls = self.calls.lock().expect("table lock");
        let rec = calls
            .get_mut(id)
            .ok_or_else(|| TransitionError::UnknownCall(id.to_string()))?;
        let from = rec.state;
        if !from.can_transition_to(to) {
            return Err(TransitionError::Invalid { id: id.to_string(), from, to });
        }
        rec.state = to;
        rec.updated_at = Utc::now();
        apply(rec);
        Ok(Transition { from, to })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
