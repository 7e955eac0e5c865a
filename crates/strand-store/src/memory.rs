// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{RecordStore, StoreError, StoreResult, ToolCallRecord};

/// In-memory reference implementation of [`RecordStore`].
///
/// Keys are `(collection, id)` pairs behind one RwLock; writes hold the
/// lock only for the map mutation.  Used directly in tests and as the
/// default store for ephemeral agents.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<(String, String), Value>>,
    closed: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// After close, every operation returns [`StoreError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Value> {
        self.check_open()?;
        let records = self.records.read().await;
        records
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn set(&self, collection: &str, id: &str, value: Value) -> StoreResult<()> {
        self.check_open()?;
        let mut records = self.records.write().await;
        records.insert((collection.to_string(), id.to_string()), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.check_open()?;
        let mut records = self.records.write().await;
        records
            .remove(&(collection.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<Value>> {
        self.check_open()?;
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn load_tool_call_records(&self, agent_id: &str) -> StoreResult<Vec<ToolCallRecord>> {
        self.check_open()?;
        let prefix = format!("{agent_id}/");
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|((c, id), _)| c == crate::collections::TOOL_CALLS && id.starts_with(&prefix))
            .filter_map(|(_, v)| serde_json::from_value(v.clone()).ok())
            .collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{collections, ToolCallState};
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryRecordStore::new();
        store.set("agents", "a1", json!({"id": "a1"})).await.unwrap();
        let v = store.get("agents", "a1").await.unwrap();
        assert_eq!(v["id"], "a1");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryRecordStore::new();
        let err = store.get("agents", "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = MemoryRecordStore::new();
        store.set("agents", "x", json!(1)).await.unwrap();
        store.set("sessions", "x", json!(2)).await.unwrap();
        assert_eq!(store.get("agents", "x").await.unwrap(), json!(1));
        assert_eq!(store.get("sessions", "x").await.unwrap(), json!(2));
        assert_eq!(store.list("agents").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let store = MemoryRecordStore::new();
        store.set("agents", "a", json!(1)).await.unwrap();
        store.delete("agents", "a").await.unwrap();
        assert!(store.get("agents", "a").await.is_err());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryRecordStore::new();
        assert!(matches!(
            store.delete("agents", "a").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn closed_store_rejects_all_operations() {
        let store = MemoryRecordStore::new();
        store.set("agents", "a", json!(1)).await.unwrap();
        store.close();
        assert!(matches!(store.get("agents", "a").await.unwrap_err(), StoreError::Closed));
        assert!(matches!(
            store.set("agents", "b", json!(2)).await.unwrap_err(),
            StoreError::Closed
        ));
        assert!(matches!(store.list("agents").await.unwrap_err(), StoreError::Closed));
    }

    #[tokio::test]
    async fn load_tool_call_records_filters_by_agent() {
        let store = MemoryRecordStore::new();
        let mut rec = ToolCallRecord::new("t1", "search", json!({}));
        rec.state = ToolCallState::Executing;
        store
            .set(
                collections::TOOL_CALLS,
                "agent-a/t1",
                serde_json::to_value(&rec).unwrap(),
            )
            .await
            .unwrap();
        store
            .set(
                collections::TOOL_CALLS,
                "agent-b/t2",
                serde_json::to_value(ToolCallRecord::new("t2", "fetch", json!({}))).unwrap(),
            )
            .await
            .unwrap();

        let records = store.load_tool_call_records("agent-a").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "t1");
        assert_eq!(records[0].state, ToolCallState::Executing);
    }

    #[tokio::test]
    async fn malformed_tool_call_values_are_skipped() {
        let store = MemoryRecordStore::new();
        store
            .set(collections::TOOL_CALLS, "agent-a/bad", json!({"not": "a record"}))
            .await
            .unwrap();
        let records = store.load_tool_call_records("agent-a").await.unwrap();
        assert!(records.is_empty());
    }
}
