// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{error::StoreError, LogicMemory};

/// Persistence seam for logic memories.  `(namespace, key)` is the unique
/// key at all observable moments; `save` is insert-or-replace.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn save(&self, mem: LogicMemory) -> Result<(), StoreError>;
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<LogicMemory>, StoreError>;
    async fn list(&self, namespace: &str) -> Result<Vec<LogicMemory>, StoreError>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
    /// Bump `access_count` and stamp `last_accessed`.  Used by the
    /// fire-and-forget retrieval side effect.
    async fn touch(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

/// In-memory reference implementation behind a single reader-writer lock.
///
/// The SQL-backed implementation used in production relies on row-level
/// locks and upsert semantics instead; this one exists for tests and
/// ephemeral agents.
#[derive(Default)]
pub struct InMemoryStore {
    memories: RwLock<HashMap<(String, String), LogicMemory>>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check(&self, namespace: &str) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::closed());
        }
        if namespace.trim().is_empty() {
            return Err(StoreError::invalid_namespace(namespace));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn save(&self, mem: LogicMemory) -> Result<(), StoreError> {
        self.check(&mem.namespace)?;
        let mut memories = self.memories.write().await;
        memories.insert((mem.namespace.clone(), mem.key.clone()), mem);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<LogicMemory>, StoreError> {
        self.check(namespace)?;
        let memories = self.memories.read().await;
        Ok(memories.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<LogicMemory>, StoreError> {
        self.check(namespace)?;
        let memories = self.memories.read().await;
        Ok(memories
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.check(namespace)?;
        let mut memories = self.memories.write().await;
        memories
            .remove(&(namespace.to_string(), key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(namespace, key))
    }

    async fn touch(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.check(namespace)?;
        let mut memories = self.memories.write().await;
        let mem = memories
            .get_mut(&(namespace.to_string(), key.to_string()))
            .ok_or_else(|| StoreError::not_found(namespace, key))?;
        mem.access_count += 1;
        mem.last_accessed = Some(Utc::now());
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
