// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub events: EventBusConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name when constructing an agent.
    ///
    /// ```yaml
    /// providers:
    ///   local_vllm:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:8000/v1
    ///     name: qwen2.5-coder
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-sonnet-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier.  Common values: "anthropic" | "openai" |
    /// "custom" | "groq" | "openrouter" | "ollama" | "deepseek" | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    /// For most hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    ///
    /// Never sent to reasoning models (names containing an `o1`/`o3`/`r1`
    /// segment) — those endpoints reject the parameter outright.
    pub temperature: Option<f32>,

    // ── Retry policy ─────────────────────────────────────────────────────────
    /// Maximum retry attempts for transport errors, 429, and 5xx responses.
    /// Other 4xx responses are never retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.  Backoff is linear:
    /// attempt `n` waits `n × retry_delay_ms`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options merged verbatim into the request
    /// body.  Useful for parameters not covered by the standard fields.
    #[serde(default)]
    pub driver_options: serde_json::Value,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            name: "claude-sonnet-4-5".into(),
            // api_key_env is intentionally None here.  resolve_api_key()
            // falls through to the driver's canonical env-var name
            // (ANTHROPIC_API_KEY, OPENAI_API_KEY, …); hard-coding it here
            // would shadow that lookup whenever the provider is overridden.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            driver_options: serde_json::Value::Null,
        }
    }
}

/// How tool invocations are gated before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Policy decides per tool; unmatched tools ask.
    #[default]
    Auto,
    /// Every tool invocation asks for an explicit decision.
    Approval,
    /// Every tool invocation is allowed without asking.
    Allow,
    /// Read-only tools run automatically; everything else asks.
    SmartApprove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of tool calls in the `executing` state at once.
    #[serde(default = "default_tool_concurrency")]
    pub max_tool_concurrency: usize,
    /// Per-tool-call execution deadline in milliseconds.  `None` disables
    /// the timeout.  On elapse the call transitions to `cancelling`.
    pub tool_timeout_ms: Option<u64>,
    /// Upper bound on provider round-trips per user turn.  Guards against
    /// a model that keeps requesting tools forever.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// How tool invocations are gated (see [`PermissionMode`]).
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// Bypass the permission gate entirely.  Must be set explicitly; no
    /// other flag or mode implies it.
    #[serde(default)]
    pub allow_dangerously_skip_permissions: bool,
    /// Tool-name glob patterns treated as read-only.  Auto-allowed under
    /// `smart_approve` and `auto`.
    #[serde(default = "default_read_only_tools")]
    pub read_only_tools: Vec<String>,
    /// Additional glob patterns auto-allowed under `auto`.
    #[serde(default)]
    pub auto_allow_tools: Vec<String>,
    /// Glob patterns denied outright under `auto`.  Deny wins over allow.
    #[serde(default)]
    pub deny_tools: Vec<String>,
    /// Optional system prompt override for the conversation.
    pub system_prompt: Option<String>,
}

fn default_tool_concurrency() -> usize {
    4
}

fn default_max_turns() -> u32 {
    32
}

fn default_read_only_tools() -> Vec<String> {
    ["read_*", "list_*", "search", "glob", "grep"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_concurrency: default_tool_concurrency(),
            tool_timeout_ms: None,
            max_turns: default_max_turns(),
            permission_mode: PermissionMode::default(),
            allow_dangerously_skip_permissions: false,
            read_only_tools: default_read_only_tools(),
            auto_allow_tools: Vec::new(),
            deny_tools: Vec::new(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Envelopes retained per channel for bookmark replay.  Events older
    /// than the window cannot be replayed; subscribers whose bookmark falls
    /// out of the window receive a gap notice.
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Bounded per-subscriber queue depth.  A full queue marks the
    /// subscriber lagging and drops events for it until it drains.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    /// How long `close()` waits for subscribers to drain, in milliseconds.
    #[serde(default = "default_close_drain_ms")]
    pub close_drain_ms: u64,
}

fn default_retention() -> usize {
    1024
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_close_drain_ms() -> u64 {
    2000
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            subscriber_queue: default_subscriber_queue(),
            close_drain_ms: default_close_drain_ms(),
        }
    }
}

/// Strategy for merging a group of similar memories into one survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Keeper is the most recently updated memory.
    KeepNewest,
    /// Keeper is the highest-confidence memory.
    #[default]
    KeepHighestConfidence,
    /// Keeper is the highest-confidence memory; descriptions of the whole
    /// group are deduplicated and joined with `; `.
    MergeDescriptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Pairwise similarity at or above which two memories join a group.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Groups smaller than this are left untouched.
    #[serde(default = "default_min_group_size")]
    pub min_group_size: usize,
    /// Memories at or above this confidence are never merged away.
    #[serde(default = "default_preserve_threshold")]
    pub preserve_high_confidence_threshold: f64,
    #[serde(default)]
    pub strategy: MergeStrategy,
    /// Hard cap on groups merged per consolidation call.  `0` = unlimited.
    #[serde(default)]
    pub max_merge_count: usize,
}

fn default_similarity_threshold() -> f64 {
    0.7
}

fn default_min_group_size() -> usize {
    2
}

fn default_preserve_threshold() -> f64 {
    0.9
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_group_size: default_min_group_size(),
            preserve_high_confidence_threshold: default_preserve_threshold(),
            strategy: MergeStrategy::default(),
            max_merge_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Remove memories whose confidence is below this value.
    pub min_confidence: Option<f64>,
    /// Remove memories not accessed for this many seconds.
    pub since_last_access_secs: Option<u64>,
    /// Remove memories older than `max_age_secs` whose access count is
    /// below `min_access_count`.  Both must be set for this rule to apply.
    pub min_access_count: Option<u64>,
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Confidence added on each re-observation of an existing
    /// (namespace, key) pair, saturating at 1.0.
    #[serde(default = "default_confidence_boost")]
    pub confidence_boost: f64,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default)]
    pub prune: PruneConfig,
}

fn default_confidence_boost() -> f64 {
    0.1
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_boost: default_confidence_boost(),
            consolidation: ConsolidationConfig::default(),
            prune: PruneConfig::default(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_is_anthropic() {
        let cfg = Config::default();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.model.max_retries, 3);
    }

    #[test]
    fn default_agent_limits() {
        let a = AgentConfig::default();
        assert_eq!(a.max_tool_concurrency, 4);
        assert_eq!(a.max_turns, 32);
        assert!(a.tool_timeout_ms.is_none());
        assert!(!a.allow_dangerously_skip_permissions);
    }

    #[test]
    fn default_permission_mode_is_auto() {
        assert_eq!(AgentConfig::default().permission_mode, PermissionMode::Auto);
    }

    #[test]
    fn event_bus_defaults() {
        let e = EventBusConfig::default();
        assert_eq!(e.retention, 1024);
        assert_eq!(e.subscriber_queue, 256);
    }

    #[test]
    fn consolidation_defaults_match_documented_values() {
        let c = ConsolidationConfig::default();
        assert!((c.similarity_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(c.min_group_size, 2);
        assert!((c.preserve_high_confidence_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(c.max_merge_count, 0);
    }

    #[test]
    fn permission_mode_deserializes_snake_case() {
        let m: PermissionMode = serde_yaml::from_str("smart_approve").unwrap();
        assert_eq!(m, PermissionMode::SmartApprove);
    }

    #[test]
    fn merge_strategy_deserializes_snake_case() {
        let s: MergeStrategy = serde_yaml::from_str("keep_newest").unwrap();
        assert_eq!(s, MergeStrategy::KeepNewest);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_tool_concurrency: 2\n").unwrap();
        assert_eq!(cfg.agent.max_tool_concurrency, 2);
        assert_eq!(cfg.agent.max_turns, 32);
        assert_eq!(cfg.events.retention, 1024);
    }

    #[test]
    fn memory_enabled_by_default() {
        let m = MemoryConfig::default();
        assert!(m.enabled);
        assert!((m.confidence_boost - 0.1).abs() < f64::EPSILON);
    }
}
