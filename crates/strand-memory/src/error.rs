// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    MemoryNotFound,
    DuplicateKey,
    InvalidNamespace,
    StoreClosed,
    MarshalError,
}

/// Typed failure surfaced by memory stores.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), cause: None }
    }

    pub fn with_cause(
        code: StoreErrorCode,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { code, message: message.into(), cause: Some(Box::new(cause)) }
    }

    pub fn not_found(namespace: &str, key: &str) -> Self {
        Self::new(StoreErrorCode::MemoryNotFound, format!("no memory at ({namespace}, {key})"))
    }

    pub fn invalid_namespace(namespace: &str) -> Self {
        Self::new(StoreErrorCode::InvalidNamespace, format!("invalid namespace: {namespace:?}"))
    }

    pub fn closed() -> Self {
        Self::new(StoreErrorCode::StoreClosed, "memory store is closed")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let e = StoreError::not_found("u:1", "tone_a");
        let text = e.to_string();
        assert!(text.contains("MemoryNotFound"));
        assert!(text.contains("tone_a"));
    }

    #[test]
    fn cause_is_preserved_as_source() {
        use std::error::Error;
        let inner = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e = StoreError::with_cause(StoreErrorCode::MarshalError, "encode failed", inner);
        assert!(e.source().is_some());
    }
}
