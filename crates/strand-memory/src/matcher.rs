// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pattern matchers turn runtime events into memories.
//!
//! The engine routes incoming [`MemoryEvent`]s to every matcher registered
//! for the event's kind; each matcher returns zero or more memories to
//! record.  Matchers are deliberately small and composable — embedders
//! register their own alongside the built-ins.

use async_trait::async_trait;
use serde_json::Value;

use crate::{LogicMemory, MemoryScope};

/// A runtime observation offered to the matchers.
#[derive(Debug, Clone)]
pub struct MemoryEvent {
    /// Event kind, e.g. `tool_failed`, `user_preference`.
    pub kind: String,
    /// Tenant namespace the resulting memories belong to.
    pub namespace: String,
    pub payload: Value,
}

impl MemoryEvent {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, payload: Value) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), payload }
    }
}

#[async_trait]
pub trait PatternMatcher: Send + Sync {
    fn name(&self) -> &str;
    /// Event kinds this matcher wants to see.
    fn event_kinds(&self) -> &[&str];
    /// Inspect one event and return the memories it implies.
    async fn match_event(&self, event: &MemoryEvent) -> Vec<LogicMemory>;
}

/// Records a behavioral pattern when the same tool keeps failing, so the
/// runtime can steer the model away from it on later sessions.
pub struct ToolFailureMatcher;

#[async_trait]
impl PatternMatcher for ToolFailureMatcher {
    fn name(&self) -> &str {
        "tool_failure"
    }

    fn event_kinds(&self) -> &[&str] {
        &["tool_failed"]
    }

    async fn match_event(&self, event: &MemoryEvent) -> Vec<LogicMemory> {
        let Some(tool) = event.payload["tool"].as_str() else {
            return vec![];
        };
        let error = event.payload["error"].as_str().unwrap_or("unknown error");
        vec![
            LogicMemory::new(
                &event.namespace,
                "behavior_pattern",
                format!("toolfail_{tool}"),
                serde_json::json!({ "tool": tool, "last_error": error }),
            )
            .with_description(format!("tool {tool} failed: {error}"))
            .with_category("tool_reliability")
            .with_confidence(0.4)
            .with_source("pattern_matcher", format!("tool_failed:{tool}")),
        ]
    }
}

/// Captures an explicitly stated user preference verbatim.
pub struct PreferenceMatcher;

#[async_trait]
impl PatternMatcher for PreferenceMatcher {
    fn name(&self) -> &str {
        "preference"
    }

    fn event_kinds(&self) -> &[&str] {
        &["user_preference"]
    }

    async fn match_event(&self, event: &MemoryEvent) -> Vec<LogicMemory> {
        let Some(key) = event.payload["key"].as_str() else {
            return vec![];
        };
        let value = event.payload["value"].clone();
        let statement = event.payload["statement"].as_str().unwrap_or_default();
        vec![
            LogicMemory::new(&event.namespace, "preference", format!("pref_{key}"), value)
                .with_description(statement)
                .with_category("preference")
                .with_scope(MemoryScope::User)
                .with_confidence(0.6)
                .with_source("pattern_matcher", format!("user_preference:{key}")),
        ]
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
