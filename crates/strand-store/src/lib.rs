// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Record persistence interface consumed by the agent runtime.
//!
//! The store is deliberately opaque: CRUD over logical collections of JSON
//! values, keyed by id.  Agents, sessions, message logs, tool-call records,
//! and memories each live in their own collection; writes are scoped by
//! `(collection, id)` so agents never contaminate each other's records.

mod memory;
mod toolcall;

pub use memory::MemoryRecordStore;
pub use toolcall::{ToolCallRecord, ToolCallState};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Well-known collection names.
pub mod collections {
    pub const AGENTS: &str = "agents";
    pub const SESSIONS: &str = "sessions";
    pub const MESSAGES: &str = "messages";
    pub const TOOL_CALLS: &str = "tool_calls";
    pub const MEMORIES: &str = "memories";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
    #[error("conflicting write: {collection}/{id}")]
    Conflict { collection: String, id: String },
    #[error("store is closed")]
    Closed,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD over logical collections of JSON records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Value>;
    async fn set(&self, collection: &str, id: &str, value: Value) -> StoreResult<()>;
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;
    async fn list(&self, collection: &str) -> StoreResult<Vec<Value>>;

    /// All persisted tool-call records belonging to `agent_id`.
    ///
    /// Records are stored under `tool_calls` with ids of the form
    /// `<agent_id>/<call_id>`; values that fail to deserialize are skipped.
    async fn load_tool_call_records(&self, agent_id: &str) -> StoreResult<Vec<ToolCallRecord>>;
}
