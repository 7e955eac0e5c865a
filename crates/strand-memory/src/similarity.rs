// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Default pairwise memory similarity.
//!
//! A weighted sum of four signals:
//!   • same type                         +0.3
//!   • same key prefix (before `_`)      +0.3
//!   • same non-empty category           +0.2
//!   • description Jaccard overlap       ×0.2
//!
//! Scores land in `[0, 1]`; the consolidation threshold is compared against
//! this value directly.

use std::collections::HashSet;

use crate::LogicMemory;

pub fn similarity(a: &LogicMemory, b: &LogicMemory) -> f64 {
    let mut score = 0.0;
    if a.memory_type == b.memory_type {
        score += 0.3;
    }
    if key_prefix(&a.key) == key_prefix(&b.key) {
        score += 0.3;
    }
    if !a.category.is_empty() && a.category == b.category {
        score += 0.2;
    }
    score += 0.2 * jaccard(&a.description, &b.description);
    score
}

fn key_prefix(key: &str) -> &str {
    key.split('_').next().unwrap_or(key)
}

/// Jaccard index over whitespace-tokenized lowercase words.  Two empty
/// descriptions carry no signal and score 0.
fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let set_b: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
