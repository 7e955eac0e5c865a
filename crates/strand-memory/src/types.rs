// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Visibility scope of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    Session,
    #[default]
    User,
    Global,
}

/// Where a memory came from and how much it is trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    /// Producer kind: "pattern_matcher", "tool_failure", "explicit", …
    pub source_type: String,
    /// Trust in `[0, 1]`.  Only the re-observation boost path raises it;
    /// merges never lower it.
    pub confidence: f64,
    /// Event/source identifiers that contributed to this memory.
    pub sources: Vec<String>,
    /// Bumped on every merge or re-observation.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One durable learned fact, unique per `(namespace, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicMemory {
    pub id: String,
    pub namespace: String,
    pub scope: MemoryScope,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub category: String,
    pub key: String,
    pub value: Value,
    pub description: String,
    pub provenance: Provenance,
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LogicMemory {
    pub fn new(
        namespace: impl Into<String>,
        memory_type: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            scope: MemoryScope::default(),
            memory_type: memory_type.into(),
            category: String::new(),
            key: key.into(),
            value,
            description: String::new(),
            provenance: Provenance {
                source_type: "explicit".into(),
                confidence: 0.5,
                sources: Vec::new(),
                version: 1,
                created_at: now,
                updated_at: now,
            },
            access_count: 0,
            last_accessed: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.provenance.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_scope(mut self, scope: MemoryScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_source(mut self, source_type: impl Into<String>, source: impl Into<String>) -> Self {
        self.provenance.source_type = source_type.into();
        self.provenance.sources.push(source.into());
        self
    }

    pub fn confidence(&self) -> f64 {
        self.provenance.confidence
    }
}

/// Sort key for retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Confidence,
    LastAccessed,
    CreatedAt,
    AccessCount,
}

/// Retrieval filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RetrieveFilter {
    pub memory_type: Option<String>,
    pub scope: Option<MemoryScope>,
    pub min_confidence: Option<f64>,
    pub top_k: Option<usize>,
    pub order_by: Option<OrderBy>,
}

/// Removal criteria for [`prune`](crate::MemoryEngine::prune).  A memory is
/// removed when ANY of the enabled rules matches it.
#[derive(Debug, Clone, Default)]
pub struct PruneCriteria {
    /// Remove when `confidence < min_confidence`.
    pub min_confidence: Option<f64>,
    /// Remove when not accessed for longer than this.
    pub since_last_access: Option<Duration>,
    /// Remove when `access_count < min_access_count` AND the memory is older
    /// than `max_age`.  Both must be set for this rule to apply.
    pub min_access_count: Option<u64>,
    pub max_age: Option<Duration>,
}

impl PruneCriteria {
    pub fn from_config(cfg: &strand_config::PruneConfig) -> Self {
        Self {
            min_confidence: cfg.min_confidence,
            since_last_access: cfg.since_last_access_secs.map(|s| Duration::seconds(s as i64)),
            min_access_count: cfg.min_access_count,
            max_age: cfg.max_age_secs.map(|s| Duration::seconds(s as i64)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
