// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use tokio::sync::Notify;

use strand_config::{AgentConfig, PermissionMode};
use strand_events::PermissionChoice;

/// Outcome of the pre-execution permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
    /// Publish a `permission_required` event and hold the call in `queued`
    /// until a decision arrives.
    Ask,
}

struct PendingAsk {
    decision: Option<(PermissionChoice, Option<String>)>,
}

/// Maps tool invocations to allow/deny/ask decisions and tracks the asks
/// that are waiting on an external decision.
pub struct PermissionGate {
    mode: PermissionMode,
    skip_all: bool,
    read_only: Vec<Regex>,
    auto_allow: Vec<Regex>,
    deny: Vec<Regex>,
    pending: Mutex<HashMap<String, PendingAsk>>,
    notify: Notify,
}

impl PermissionGate {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| compile_wildcard(p)).collect()
        };
        Self {
            mode: cfg.permission_mode,
            skip_all: cfg.allow_dangerously_skip_permissions,
            read_only: compile(&cfg.read_only_tools),
            auto_allow: compile(&cfg.auto_allow_tools),
            deny: compile(&cfg.deny_tools),
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Decide how a call to `tool_name` is gated.
    pub fn check(&self, tool_name: &str) -> PermissionDecision {
        if self.skip_all {
            return PermissionDecision::Allow;
        }
        match self.mode {
            PermissionMode::Allow => PermissionDecision::Allow,
            PermissionMode::Approval => PermissionDecision::Ask,
            PermissionMode::SmartApprove => {
                if self.read_only.iter().any(|re| re.is_match(tool_name)) {
                    PermissionDecision::Allow
                } else {
                    PermissionDecision::Ask
                }
            }
            PermissionMode::Auto => {
                if self.deny.iter().any(|re| re.is_match(tool_name)) {
                    return PermissionDecision::Deny;
                }
                if self.read_only.iter().any(|re| re.is_match(tool_name))
                    || self.auto_allow.iter().any(|re| re.is_match(tool_name))
                {
                    return PermissionDecision::Allow;
                }
                PermissionDecision::Ask
            }
        }
    }

    /// Register an outstanding ask for `call_id`.
    pub fn register_ask(&self, call_id: &str) {
        let mut pending = self.pending.lock().expect("gate lock");
        pending.entry(call_id.to_string()).or_insert(PendingAsk { decision: None });
    }

    /// Record an external decision.  Returns `false` when no ask is
    /// outstanding for `call_id`.
    pub fn decide(&self, call_id: &str, choice: PermissionChoice, note: Option<String>) -> bool {
        let mut pending = self.pending.lock().expect("gate lock");
        match pending.get_mut(call_id) {
            Some(ask) => {
                ask.decision = Some((choice, note));
                drop(pending);
                self.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Drop an outstanding ask without a decision (the call was cancelled).
    pub fn forget_ask(&self, call_id: &str) {
        let mut pending = self.pending.lock().expect("gate lock");
        pending.remove(call_id);
    }

    /// Take the decision for `call_id` if one has arrived, removing the ask.
    pub fn take_decision(&self, call_id: &str) -> Option<(PermissionChoice, Option<String>)> {
        let mut pending = self.pending.lock().expect("gate lock");
        if pending.get(call_id).map(|a| a.decision.is_some()).unwrap_or(false) {
            return pending.remove(call_id).and_then(|a| a.decision);
        }
        None
    }

    /// Wait until a decision for `call_id` arrives and take it.
    pub async fn wait_decision(&self, call_id: &str) -> (PermissionChoice, Option<String>) {
        loop {
            // Register the waiter before checking, so a decision that lands
            // between the check and the await is not missed.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(decision) = self.take_decision(call_id) {
                return decision;
            }
            notified.await;
        }
    }

    /// Call ids still waiting on a decision.
    pub fn pending_ids(&self) -> Vec<String> {
        let pending = self.pending.lock().expect("gate lock");
        let mut ids: Vec<String> = pending
            .iter()
            .filter(|(_, ask)| ask.decision.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Compile a `*`/`?` wildcard pattern into an anchored [`Regex`].
///
/// `*` matches any run of characters, `?` matches exactly one; everything
/// between wildcards is a literal run, escaped as a whole so tool names
/// containing regex metacharacters cannot widen the match.
fn compile_wildcard(pattern: &str) -> Option<Regex> {
    let mut source = String::with_capacity(pattern.len() * 2);
    let mut literal = String::new();
    source.push('^');
    for c in pattern.chars() {
        if c == '*' || c == '?' {
            if !literal.is_empty() {
                source.push_str(&regex::escape(&literal));
                literal.clear();
            }
            source.push_str(if c == '*' { ".*" } else { "." });
        } else {
            literal.push(c);
        }
    }
    if !literal.is_empty() {
        source.push_str(&regex::escape(&literal));
    }
    source.push('$');
    Regex::new(&source).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
