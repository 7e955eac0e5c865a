// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use strand_config::MemoryConfig;

use crate::{
    consolidate::{consolidate, ConsolidationResult},
    error::StoreError,
    matcher::{MemoryEvent, PatternMatcher},
    store::MemoryStore,
    LogicMemory, OrderBy, PruneCriteria, RetrieveFilter,
};

/// Orchestrates memory recording, retrieval, event ingestion, and upkeep
/// over a pluggable [`MemoryStore`].
pub struct MemoryEngine {
    store: Arc<dyn MemoryStore>,
    matchers: Vec<Arc<dyn PatternMatcher>>,
    config: MemoryConfig,
}

impl MemoryEngine {
    pub fn new(store: Arc<dyn MemoryStore>, config: MemoryConfig) -> Self {
        Self { store, matchers: Vec::new(), config }
    }

    /// Engine with the built-in matchers registered.
    pub fn with_default_matchers(store: Arc<dyn MemoryStore>, config: MemoryConfig) -> Self {
        let mut engine = Self::new(store, config);
        engine.register_matcher(Arc::new(crate::matcher::ToolFailureMatcher));
        engine.register_matcher(Arc::new(crate::matcher::PreferenceMatcher));
        engine
    }

    pub fn register_matcher(&mut self, matcher: Arc<dyn PatternMatcher>) {
        self.matchers.push(matcher);
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    /// Upsert by `(namespace, key)`.
    ///
    /// First observation inserts the memory as-is.  Re-observation merges:
    /// the access count and version bump, confidence rises by the
    /// configured boost (saturating at 1.0 — this is the only path that
    /// modifies it), sources extend, the longer description wins, the value
    /// is overwritten, and metadata unions with the incoming entry winning
    /// conflicts.
    pub async fn record_memory(&self, mem: LogicMemory) -> Result<LogicMemory, StoreError> {
        let existing = self.store.get(&mem.namespace, &mem.key).await?;
        let merged = match existing {
            None => mem,
            Some(mut current) => {
                let now = Utc::now();
                current.access_count += 1;
                current.provenance.confidence =
                    (current.provenance.confidence + self.config.confidence_boost).min(1.0);
                for src in &mem.provenance.sources {
                    if !current.provenance.sources.contains(src) {
                        current.provenance.sources.push(src.clone());
                    }
                }
                if mem.description.len() > current.description.len() {
                    current.description = mem.description;
                }
                current.value = mem.value;
                for (k, v) in mem.metadata {
                    current.metadata.insert(k, v);
                }
                current.provenance.version += 1;
                current.provenance.updated_at = now;
                current.updated_at = now;
                current
            }
        };
        self.store.save(merged.clone()).await?;
        Ok(merged)
    }

    /// Route an event through every matcher registered for its kind and
    /// record whatever they produce.  Returns the number of memories
    /// recorded.
    pub async fn process_event(&self, event: &MemoryEvent) -> Result<usize, StoreError> {
        if !self.config.enabled {
            return Ok(0);
        }
        let mut recorded = 0usize;
        for matcher in &self.matchers {
            if !matcher.event_kinds().contains(&event.kind.as_str()) {
                continue;
            }
            for mem in matcher.match_event(event).await {
                self.record_memory(mem).await?;
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    /// Retrieve memories matching `filter`, best first.
    ///
    /// Side effect: access counts and `last_accessed` update asynchronously
    /// for every returned memory; those writes are fire-and-forget and
    /// their failures are swallowed.
    pub async fn retrieve(
        &self,
        namespace: &str,
        filter: &RetrieveFilter,
    ) -> Result<Vec<LogicMemory>, StoreError> {
        let mut memories = self.store.list(namespace).await?;

        memories.retain(|m| {
            if let Some(t) = &filter.memory_type {
                if &m.memory_type != t {
                    return false;
                }
            }
            if let Some(scope) = filter.scope {
                if m.scope != scope {
                    return false;
                }
            }
            if let Some(min) = filter.min_confidence {
                if m.confidence() < min {
                    return false;
                }
            }
            true
        });

        match filter.order_by.unwrap_or_default() {
            OrderBy::Confidence => memories.sort_by(|a, b| {
                b.confidence().partial_cmp(&a.confidence()).unwrap_or(std::cmp::Ordering::Equal)
            }),
            OrderBy::LastAccessed => memories.sort_by_key(|m| std::cmp::Reverse(m.last_accessed)),
            OrderBy::CreatedAt => memories.sort_by_key(|m| std::cmp::Reverse(m.created_at)),
            OrderBy::AccessCount => memories.sort_by_key(|m| std::cmp::Reverse(m.access_count)),
        }

        if let Some(k) = filter.top_k {
            memories.truncate(k);
        }

        // Access accounting happens off the request path.
        let store = Arc::clone(&self.store);
        let touches: Vec<(String, String)> =
            memories.iter().map(|m| (m.namespace.clone(), m.key.clone())).collect();
        tokio::spawn(async move {
            for (ns, key) in touches {
                if let Err(e) = store.touch(&ns, &key).await {
                    debug!(namespace = %ns, key = %key, error = %e, "access-count update failed");
                }
            }
        });

        Ok(memories)
    }

    /// Run the consolidation pass for one namespace.
    pub async fn consolidate(&self, namespace: &str) -> Result<ConsolidationResult, StoreError> {
        consolidate(self.store.as_ref(), namespace, &self.config.consolidation).await
    }

    /// Remove memories matching any enabled criterion.  Returns the number
    /// of deleted memories.
    pub async fn prune(
        &self,
        namespace: &str,
        criteria: &PruneCriteria,
    ) -> Result<usize, StoreError> {
        let memories = self.store.list(namespace).await?;
        let now = Utc::now();
        let mut deleted = 0usize;

        for m in memories {
            let mut remove = false;
            if let Some(min) = criteria.min_confidence {
                if m.confidence() < min {
                    remove = true;
                }
            }
            if let Some(window) = criteria.since_last_access {
                let last = m.last_accessed.unwrap_or(m.created_at);
                if now - last > window {
                    remove = true;
                }
            }
            if let (Some(min_access), Some(max_age)) =
                (criteria.min_access_count, criteria.max_age)
            {
                if m.access_count < min_access && now - m.created_at > max_age {
                    remove = true;
                }
            }
            if remove {
                match self.store.delete(&m.namespace, &m.key).await {
                    Ok(()) => deleted += 1,
                    Err(e) => warn!(key = %m.key, error = %e, "prune delete failed"),
                }
            }
        }
        Ok(deleted)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
