// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`MemoryStore`] backed by the shared [`RecordStore`].
//!
//! Memories live in the `memories` collection with `<namespace>/<key>` ids,
//! so durable deployments persist them next to agent and tool-call records
//! without a second storage backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use strand_store::{collections, RecordStore};

use crate::{
    error::{StoreError, StoreErrorCode},
    store::MemoryStore,
    LogicMemory,
};

pub struct RecordBackedStore {
    records: Arc<dyn RecordStore>,
}

impl RecordBackedStore {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    fn record_id(namespace: &str, key: &str) -> String {
        format!("{namespace}/{key}")
    }

    fn check_namespace(namespace: &str) -> Result<(), StoreError> {
        if namespace.trim().is_empty() {
            return Err(StoreError::invalid_namespace(namespace));
        }
        Ok(())
    }
}

fn map_err(e: strand_store::StoreError) -> StoreError {
    use strand_store::StoreError as Inner;
    let code = match &e {
        Inner::NotFound { .. } => StoreErrorCode::MemoryNotFound,
        Inner::Conflict { .. } => StoreErrorCode::DuplicateKey,
        Inner::Closed => StoreErrorCode::StoreClosed,
    };
    StoreError::with_cause(code, "record store operation failed", e)
}

#[async_trait]
impl MemoryStore for RecordBackedStore {
    async fn save(&self, mem: LogicMemory) -> Result<(), StoreError> {
        Self::check_namespace(&mem.namespace)?;
        let id = Self::record_id(&mem.namespace, &mem.key);
        let value = serde_json::to_value(&mem).map_err(|e| {
            StoreError::with_cause(StoreErrorCode::MarshalError, "memory not serializable", e)
        })?;
        self.records
            .set(collections::MEMORIES, &id, value)
            .await
            .map_err(map_err)
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<LogicMemory>, StoreError> {
        Self::check_namespace(namespace)?;
        let id = Self::record_id(namespace, key);
        match self.records.get(collections::MEMORIES, &id).await {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| {
                    StoreError::with_cause(
                        StoreErrorCode::MarshalError,
                        "stored memory not decodable",
                        e,
                    )
                }),
            Err(strand_store::StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<LogicMemory>, StoreError> {
        Self::check_namespace(namespace)?;
        let values = self
            .records
            .list(collections::MEMORIES)
            .await
            .map_err(map_err)?;
        // Rows that fail to decode are skipped, matching the tolerant read
        // path used for tool-call records.
        Ok(values
            .into_iter()
            .filter_map(|v| match serde_json::from_value::<LogicMemory>(v) {
                Ok(m) if m.namespace == namespace => Some(m),
                Ok(_) => None,
                Err(e) => {
                    debug!(error = %e, "skipping undecodable memory row");
                    None
                }
            })
            .collect())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        Self::check_namespace(namespace)?;
        let id = Self::record_id(namespace, key);
        self.records
            .delete(collections::MEMORIES, &id)
            .await
            .map_err(map_err)
    }

    async fn touch(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut mem = self
            .get(namespace, key)
            .await?
            .ok_or_else(|| StoreError::not_found(namespace, key))?;
        mem.access_count += 1;
        mem.last_accessed = Some(Utc::now());
        self.save(mem).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
