// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Linear-backoff retry for provider requests.
//!
//! Transport failures, 429 and 5xx responses are retried up to the
//! configured cap; attempt `n` sleeps `n × delay` first.  All other errors
//! surface immediately — a 4xx means the request itself is wrong and
//! repeating it cannot help.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry attempts after the initial try.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n × delay`.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, delay: Duration::from_millis(500) }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &strand_config::ModelConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

/// Run `op`, retrying retryable failures per `policy`.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay * attempt;
                warn!(
                    attempt,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "provider request failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
