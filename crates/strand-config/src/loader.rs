// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Layered configuration loading.
//!
//! Configuration is assembled by overlaying YAML documents, lowest
//! precedence first, on top of the serialized defaults of [`Config`]:
//!
//! 1. `/etc/strand/config.yaml` — host-wide settings
//! 2. `<user config dir>/strand/config.yaml`
//! 3. `.strand.yaml`, then `strand.yaml`, in the working directory
//! 4. the file named by the `STRAND_CONFIG` environment variable
//! 5. an explicit path passed by the embedder
//!
//! Discovered layers (1–3) are optional and silently skipped when absent;
//! a layer the operator named explicitly (4–5) must exist and parse.
//! Mappings merge key by key, recursively; scalars and lists from a later
//! layer replace the earlier value wholesale — a partial `read_only_tools`
//! list is a replacement, not an extension.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_yaml::Value;
use tracing::debug;

use crate::Config;

/// Environment variable naming an additional config file.
const ENV_CONFIG_PATH: &str = "STRAND_CONFIG";

struct Layer {
    path: PathBuf,
    /// Named by the operator; missing or unparsable is an error rather
    /// than a skip.
    required: bool,
}

fn discover_layers(explicit: Option<&Path>) -> Vec<Layer> {
    let optional = |path: PathBuf| Layer { path, required: false };
    let mut layers = vec![optional(PathBuf::from("/etc/strand/config.yaml"))];
    if let Some(dir) = dirs::config_dir() {
        layers.push(optional(dir.join("strand/config.yaml")));
    }
    layers.push(optional(PathBuf::from(".strand.yaml")));
    layers.push(optional(PathBuf::from("strand.yaml")));
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        if !env_path.is_empty() {
            layers.push(Layer { path: PathBuf::from(env_path), required: true });
        }
    }
    if let Some(path) = explicit {
        layers.push(Layer { path: path.to_path_buf(), required: true });
    }
    layers
}

/// Load configuration by overlaying every discovered layer onto the
/// defaults.  `explicit` is the highest-precedence layer and must exist.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    // Starting from the serialized defaults means any partial document
    // deserializes cleanly — absent sections keep their default values.
    let mut doc = serde_yaml::to_value(Config::default()).context("serializing defaults")?;

    for layer in discover_layers(explicit) {
        if !layer.path.is_file() {
            if layer.required {
                anyhow::bail!("config file not found: {}", layer.path.display());
            }
            continue;
        }
        debug!(path = %layer.path.display(), "applying config layer");
        let text = std::fs::read_to_string(&layer.path)
            .with_context(|| format!("reading {}", layer.path.display()))?;
        let patch: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", layer.path.display()))?;
        apply_overlay(&mut doc, patch);
    }

    serde_yaml::from_value(doc).context("config does not match the expected schema")
}

/// Recursively fold `patch` into `base`.  Two mappings merge per key;
/// any other combination is a wholesale replacement.
fn apply_overlay(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(slot) => apply_overlay(slot, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (slot, patch) => *slot = patch,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
