// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use strand_model::{Message, Role};
use uuid::Uuid;

/// In-memory conversation log.
///
/// Append-only while a turn runs: the single-writer invariant over the
/// message list is enforced by the agent's turn lock, so the session itself
/// stays a plain sequential structure.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4().to_string(), messages: Vec::new() }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self { id: id.into(), messages: Vec::new() }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// Text of the most recent assistant message, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .and_then(|m| m.as_text())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_unique_id() {
        assert_ne!(Session::new().id, Session::new().id);
    }

    #[test]
    fn push_appends_in_order() {
        let mut s = Session::new();
        s.push(Message::user("one"));
        s.push(Message::assistant("two"));
        assert_eq!(s.messages.len(), 2);
        assert_eq!(s.messages[0].as_text(), Some("one"));
    }

    #[test]
    fn last_assistant_text_skips_other_roles() {
        let mut s = Session::new();
        s.push(Message::assistant("early"));
        s.push(Message::user("question"));
        assert_eq!(s.last_assistant_text(), Some("early"));
        s.push(Message::assistant("late"));
        assert_eq!(s.last_assistant_text(), Some("late"));
    }
}
