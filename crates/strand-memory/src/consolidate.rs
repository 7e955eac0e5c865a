// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rule-based consolidation: similarity-union merging of redundant
//! memories within a namespace.
//!
//! Memories are grouped by type, clustered with a union-find over pairs
//! whose similarity clears the threshold, and each sufficiently large
//! cluster collapses into one keeper.  High-confidence memories never join
//! a cluster — established facts are preserved verbatim.  Per-group merge
//! failures are logged and skipped so a partial result is always returned.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::warn;

use strand_config::{ConsolidationConfig, MergeStrategy};

use crate::{error::StoreError, similarity::similarity, store::MemoryStore, LogicMemory};

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConsolidationResult {
    /// Memories examined.
    pub total: usize,
    /// Clusters merged.
    pub merged_groups: usize,
    /// Memories deleted (non-keepers of merged clusters).
    pub deleted: usize,
}

/// Union-find with path compression; indexes into the per-type group.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

pub(crate) async fn consolidate(
    store: &dyn MemoryStore,
    namespace: &str,
    cfg: &ConsolidationConfig,
) -> Result<ConsolidationResult, StoreError> {
    let memories = store.list(namespace).await?;
    let mut result = ConsolidationResult { total: memories.len(), ..Default::default() };

    // 1. Group by type.
    let mut by_type: HashMap<&str, Vec<&LogicMemory>> = HashMap::new();
    for m in &memories {
        by_type.entry(m.memory_type.as_str()).or_default().push(m);
    }

    let mut merged_groups = 0usize;
    for group in by_type.values() {
        if group.len() < cfg.min_group_size {
            continue;
        }

        // 2. Cluster by pairwise similarity.  High-confidence memories are
        // excluded from unions and survive untouched.
        let mergeable: Vec<&LogicMemory> = group
            .iter()
            .copied()
            .filter(|m| m.confidence() < cfg.preserve_high_confidence_threshold)
            .collect();
        if mergeable.len() < cfg.min_group_size {
            continue;
        }

        let mut uf = UnionFind::new(mergeable.len());
        for i in 0..mergeable.len() {
            for j in (i + 1)..mergeable.len() {
                if similarity(mergeable[i], mergeable[j]) >= cfg.similarity_threshold {
                    uf.union(i, j);
                }
            }
        }

        let mut clusters: HashMap<usize, Vec<&LogicMemory>> = HashMap::new();
        for (i, m) in mergeable.iter().enumerate() {
            clusters.entry(uf.find(i)).or_default().push(m);
        }

        // 3. Merge each sufficiently large cluster, respecting the per-call
        // cap on merged groups.
        for cluster in clusters.into_values() {
            if cluster.len() < cfg.min_group_size {
                continue;
            }
            if cfg.max_merge_count > 0 && merged_groups >= cfg.max_merge_count {
                continue;
            }
            match merge_cluster(store, &cluster, cfg.strategy).await {
                Ok(deleted) => {
                    merged_groups += 1;
                    result.deleted += deleted;
                }
                Err(e) => {
                    warn!(namespace, error = %e, "skipping failed merge group");
                }
            }
        }
    }

    result.merged_groups = merged_groups;
    Ok(result)
}

/// Collapse one cluster into its keeper.  Returns the number of deleted
/// memories.
async fn merge_cluster(
    store: &dyn MemoryStore,
    cluster: &[&LogicMemory],
    strategy: MergeStrategy,
) -> Result<usize, StoreError> {
    let keeper_ref = match strategy {
        MergeStrategy::KeepNewest => cluster
            .iter()
            .max_by_key(|m| m.updated_at)
            .expect("cluster is non-empty"),
        MergeStrategy::KeepHighestConfidence | MergeStrategy::MergeDescriptions => cluster
            .iter()
            .max_by(|a, b| {
                a.confidence()
                    .partial_cmp(&b.confidence())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("cluster is non-empty"),
    };
    let mut keeper: LogicMemory = (*keeper_ref).clone();
    let losers: Vec<&&LogicMemory> = cluster.iter().filter(|m| m.id != keeper.id).collect();

    // Absorb the cluster: counts sum, sources concatenate, metadata unions
    // with the keeper winning conflicts, confidence never decreases.
    keeper.access_count = cluster.iter().map(|m| m.access_count).sum();
    let max_confidence = cluster.iter().map(|m| m.confidence()).fold(0.0f64, f64::max);
    keeper.provenance.confidence = keeper.confidence().max(max_confidence);
    for loser in &losers {
        for src in &loser.provenance.sources {
            keeper.provenance.sources.push(src.clone());
        }
        for (k, v) in &loser.metadata {
            keeper.metadata.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    if strategy == MergeStrategy::MergeDescriptions {
        let mut descriptions: Vec<&str> = Vec::new();
        for m in cluster {
            if !m.description.is_empty() && !descriptions.contains(&m.description.as_str()) {
                descriptions.push(&m.description);
            }
        }
        keeper.description = descriptions.join("; ");
    }

    // `updated_at` must move strictly forward past every merged input.
    let max_updated = cluster.iter().map(|m| m.updated_at).max().expect("non-empty");
    let now = Utc::now();
    keeper.updated_at = if now > max_updated { now } else { max_updated + Duration::milliseconds(1) };
    keeper.provenance.updated_at = keeper.updated_at;
    keeper.provenance.version += 1;

    store.save(keeper).await?;
    let mut deleted = 0usize;
    for loser in losers {
        store.delete(&loser.namespace, &loser.key).await?;
        deleted += 1;
    }
    Ok(deleted)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn cfg() -> ConsolidationConfig {
        ConsolidationConfig {
            similarity_threshold: 0.7,
            min_group_size: 2,
            preserve_high_confidence_threshold: 0.9,
            strategy: MergeStrategy::KeepHighestConfidence,
            max_merge_count: 0,
        }
    }

    fn preference(key: &str, confidence: f64) -> LogicMemory {
        LogicMemory::new("u:1", "preference", key, json!("v"))
            .with_description("prefers a concise tone")
            .with_confidence(confidence)
    }

    #[tokio::test]
    async fn similar_low_confidence_memories_merge_preserving_high_confidence() {
        let store = InMemoryStore::new();
        store.save(preference("tone_a", 0.7)).await.unwrap();
        store.save(preference("tone_b", 0.8)).await.unwrap();
        store.save(preference("tone_c", 0.95)).await.unwrap();

        let result = consolidate(&store, "u:1", &cfg()).await.unwrap();
        assert_eq!(result.total, 3);
        assert_eq!(result.merged_groups, 1);
        assert_eq!(result.deleted, 1);

        let remaining = store.list("u:1").await.unwrap();
        assert_eq!(remaining.len(), 2);
        // tone_c is preserved untouched; tone_b (higher confidence) absorbs tone_a.
        assert!(store.get("u:1", "tone_c").await.unwrap().is_some());
        assert!(store.get("u:1", "tone_b").await.unwrap().is_some());
        assert!(store.get("u:1", "tone_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_sums_access_counts_and_raises_confidence() {
        let store = InMemoryStore::new();
        let mut a = preference("tone_a", 0.8);
        a.access_count = 3;
        let mut b = preference("tone_b", 0.6);
        b.access_count = 4;
        let pre_max_updated = a.updated_at.max(b.updated_at);
        store.save(a).await.unwrap();
        store.save(b).await.unwrap();

        consolidate(&store, "u:1", &cfg()).await.unwrap();
        let keeper = store.get("u:1", "tone_a").await.unwrap().unwrap();
        assert_eq!(keeper.access_count, 7);
        assert!(keeper.confidence() >= 0.8);
        assert!(keeper.updated_at > pre_max_updated);
        assert_eq!(keeper.provenance.version, 2);
    }

    #[tokio::test]
    async fn keep_newest_strategy_selects_latest_updated() {
        let store = InMemoryStore::new();
        let mut old = preference("tone_a", 0.8);
        old.updated_at = Utc::now() - Duration::seconds(60);
        let newer = preference("tone_b", 0.5);
        store.save(old).await.unwrap();
        store.save(newer).await.unwrap();

        let mut config = cfg();
        config.strategy = MergeStrategy::KeepNewest;
        consolidate(&store, "u:1", &config).await.unwrap();

        assert!(store.get("u:1", "tone_b").await.unwrap().is_some());
        assert!(store.get("u:1", "tone_a").await.unwrap().is_none());
        // the confidence invariant still holds for keep_newest
        let keeper = store.get("u:1", "tone_b").await.unwrap().unwrap();
        assert!(keeper.confidence() >= 0.8);
    }

    #[tokio::test]
    async fn merge_descriptions_joins_deduplicated() {
        let store = InMemoryStore::new();
        store
            .save(preference("tone_a", 0.8).with_description("prefers concise tone"))
            .await
            .unwrap();
        store
            .save(preference("tone_b", 0.6).with_description("prefers casual tone"))
            .await
            .unwrap();
        store
            .save(preference("tone_d", 0.5).with_description("prefers concise tone"))
            .await
            .unwrap();

        let mut config = cfg();
        config.strategy = MergeStrategy::MergeDescriptions;
        consolidate(&store, "u:1", &config).await.unwrap();

        let keeper = store.get("u:1", "tone_a").await.unwrap().unwrap();
        assert!(keeper.description.contains("prefers concise tone"));
        assert!(keeper.description.contains("prefers casual tone"));
        // deduplicated: the shared description appears once
        assert_eq!(keeper.description.matches("prefers concise tone").count(), 1);
    }

    #[tokio::test]
    async fn dissimilar_memories_do_not_merge() {
        let store = InMemoryStore::new();
        store
            .save(
                LogicMemory::new("u:1", "preference", "tone_a", json!(1))
                    .with_description("prefers formal greetings in email"),
            )
            .await
            .unwrap();
        store
            .save(
                LogicMemory::new("u:1", "behavior", "retry_b", json!(1))
                    .with_description("always retries failed downloads twice"),
            )
            .await
            .unwrap();

        let result = consolidate(&store, "u:1", &cfg()).await.unwrap();
        assert_eq!(result.merged_groups, 0);
        assert_eq!(result.deleted, 0);
        assert_eq!(store.list("u:1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn consolidation_is_idempotent_on_fixed_point() {
        let store = InMemoryStore::new();
        store.save(preference("tone_a", 0.7)).await.unwrap();
        store.save(preference("tone_b", 0.8)).await.unwrap();
        store.save(preference("tone_c", 0.95)).await.unwrap();

        let first = consolidate(&store, "u:1", &cfg()).await.unwrap();
        assert_eq!(first.merged_groups, 1);
        let second = consolidate(&store, "u:1", &cfg()).await.unwrap();
        assert_eq!(second.merged_groups, 0);
        assert_eq!(second.deleted, 0);
    }

    #[tokio::test]
    async fn max_merge_count_caps_groups_per_call() {
        let store = InMemoryStore::new();
        // Two independent clusters: tone_* and style_* (different prefixes,
        // different descriptions keep them apart).
        store
            .save(preference("tone_a", 0.5).with_description("short replies please"))
            .await
            .unwrap();
        store
            .save(preference("tone_b", 0.5).with_description("short replies please"))
            .await
            .unwrap();
        store
            .save(preference("style_a", 0.5).with_description("tabular output wanted"))
            .await
            .unwrap();
        store
            .save(preference("style_b", 0.5).with_description("tabular output wanted"))
            .await
            .unwrap();

        let mut config = cfg();
        config.max_merge_count = 1;
        let result = consolidate(&store, "u:1", &config).await.unwrap();
        assert_eq!(result.merged_groups, 1, "cap must limit merges per call");
        assert_eq!(store.list("u:1").await.unwrap().len(), 3);

        // A second call picks up the remaining cluster.
        let result = consolidate(&store, "u:1", &config).await.unwrap();
        assert_eq!(result.merged_groups, 1);
        assert_eq!(store.list("u:1").await.unwrap().len(), 2);
    }
}
