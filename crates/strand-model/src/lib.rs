// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod anthropic;
mod assemble;
mod custom;
mod error;
mod http;
mod mock;
mod openai_compat;
mod provider;
mod retry;
mod sse;
mod types;

pub use anthropic::AnthropicProvider;
pub use custom::CustomProvider;
pub use error::ProviderError;
pub use mock::ScriptedProvider;
pub use provider::{collect_stream, ChunkStream, Completion, Provider};
pub use retry::RetryPolicy;
pub use types::*;

use openai_compat::{AuthStyle, OpenAICompatProvider};
use strand_config::ModelConfig;

/// One entry of the OpenAI-compatible driver family: stable id, default
/// endpoint, canonical API-key environment variable, auth style.
struct CompatDriver {
    id: &'static str,
    base_url: &'static str,
    key_env: Option<&'static str>,
    auth: AuthStyle,
}

const COMPAT_DRIVERS: &[CompatDriver] = &[
    CompatDriver {
        id: "openai",
        base_url: "https://api.openai.com/v1",
        key_env: Some("OPENAI_API_KEY"),
        auth: AuthStyle::Bearer,
    },
    CompatDriver {
        id: "groq",
        base_url: "https://api.groq.com/openai/v1",
        key_env: Some("GROQ_API_KEY"),
        auth: AuthStyle::Bearer,
    },
    CompatDriver {
        id: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        key_env: Some("OPENROUTER_API_KEY"),
        auth: AuthStyle::Bearer,
    },
    CompatDriver {
        id: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        key_env: Some("DEEPSEEK_API_KEY"),
        auth: AuthStyle::Bearer,
    },
    // Local servers need no authentication.
    CompatDriver {
        id: "ollama",
        base_url: "http://localhost:11434/v1",
        key_env: None,
        auth: AuthStyle::None,
    },
];

/// Resolve the API key for a provider config: explicit key first, then the
/// configured env var, then the driver's canonical env var.
fn resolve_api_key(cfg: &ModelConfig, canonical_env: Option<&str>) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(var) = &cfg.api_key_env {
        if let Ok(v) = std::env::var(var) {
            return Some(v);
        }
    }
    canonical_env.and_then(|var| std::env::var(var).ok())
}

/// Construct a boxed [`Provider`] from configuration.
///
/// Selects the driver implementation based on `cfg.provider`.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn Provider>> {
    let retry = RetryPolicy::from_config(cfg);

    match cfg.provider.as_str() {
        "anthropic" => Ok(Box::new(AnthropicProvider::new(
            cfg.name.clone(),
            resolve_api_key(cfg, Some("ANTHROPIC_API_KEY")),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
            retry,
        ))),
        "custom" => Ok(Box::new(CustomProvider::new(
            cfg.name.clone(),
            resolve_api_key(cfg, Some("STRAND_GATEWAY_KEY")),
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
            retry,
        ))),
        "mock" => Ok(Box::new(ScriptedProvider::always_text("mock reply"))),
        other => {
            let driver = COMPAT_DRIVERS
                .iter()
                .find(|d| d.id == other)
                .ok_or_else(|| anyhow::anyhow!("unknown provider: {other}"))?;
            let base_url = cfg.base_url.clone().unwrap_or_else(|| driver.base_url.into());
            Ok(Box::new(OpenAICompatProvider::new(
                driver.id,
                cfg.name.clone(),
                resolve_api_key(cfg, driver.key_env),
                &base_url,
                cfg.max_tokens,
                cfg.temperature,
                vec![],
                driver.auth,
                cfg.driver_options.clone(),
                retry,
            )))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            name: "test-model".into(),
            api_key: Some("sk-test".into()),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_selects_anthropic() {
        let p = from_config(&cfg("anthropic")).unwrap();
        assert_eq!(p.name(), "anthropic");
    }

    #[test]
    fn from_config_selects_custom() {
        let p = from_config(&cfg("custom")).unwrap();
        assert_eq!(p.name(), "custom");
    }

    #[test]
    fn from_config_selects_compat_drivers() {
        for id in ["openai", "groq", "openrouter", "deepseek", "ollama"] {
            let p = from_config(&cfg(id)).unwrap();
            assert_eq!(p.name(), id);
            assert_eq!(p.capabilities().tool_calling_format, ToolCallingFormat::OpenAi);
        }
    }

    #[test]
    fn from_config_rejects_unknown_provider() {
        assert!(from_config(&cfg("carrier-pigeon")).is_err());
    }

    #[test]
    fn explicit_api_key_wins_over_env() {
        let c = cfg("anthropic");
        assert_eq!(resolve_api_key(&c, Some("ANTHROPIC_API_KEY")), Some("sk-test".into()));
    }
}
