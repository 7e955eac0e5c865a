// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider error taxonomy.
//!
//! Adapters classify every failure into one of these kinds so that the
//! retry layer and the agent loop can react uniformly regardless of which
//! wire dialect produced the error.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// 5xx — the remote is overloaded or failing; retryable.
    #[error("server overloaded ({status}): {message}")]
    ServerOverloaded { status: u16, message: String },

    /// 429 — request quota exhausted; retryable after backoff.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// 401 / 403 — key missing, invalid, or lacking access; not retryable.
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Any other 4xx — the request itself is wrong; indicates a client bug
    /// and is never retried.
    #[error("bad request ({status}): {message}")]
    BadRequest { status: u16, message: String },

    /// Network-level failure: DNS, connect, TLS, timeout; retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response stream failed after it started producing bytes.
    #[error("stream error: {0}")]
    Stream(String),

    /// The response body could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Classify a non-success HTTP response by status code.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status.as_u16() {
            429 => Self::RateLimited { message: body },
            401 | 403 => Self::Auth { message: body },
            s if s >= 500 => Self::ServerOverloaded { status: s, message: body },
            s => Self::BadRequest { status: s, message: body },
        }
    }

    /// Whether the retry layer should attempt this request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerOverloaded { .. } | Self::RateLimited { .. } | Self::Transport(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_rate_limited() {
        let e = ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into());
        assert!(matches!(e, ProviderError::RateLimited { .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn status_500_and_503_are_overloaded() {
        for code in [500u16, 502, 503, 529] {
            let status = StatusCode::from_u16(code).unwrap();
            let e = ProviderError::from_status(status, String::new());
            assert!(matches!(e, ProviderError::ServerOverloaded { .. }), "code {code}");
            assert!(e.is_retryable(), "code {code}");
        }
    }

    #[test]
    fn status_401_is_auth_and_not_retryable() {
        let e = ProviderError::from_status(StatusCode::UNAUTHORIZED, "bad key".into());
        assert!(matches!(e, ProviderError::Auth { .. }));
        assert!(!e.is_retryable());
    }

    #[test]
    fn status_400_is_bad_request_and_not_retryable() {
        let e = ProviderError::from_status(StatusCode::BAD_REQUEST, "invalid schema".into());
        assert!(matches!(e, ProviderError::BadRequest { status: 400, .. }));
        assert!(!e.is_retryable());
    }

    #[test]
    fn transport_is_retryable_stream_is_not() {
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(!ProviderError::Stream("mid-stream".into()).is_retryable());
        assert!(!ProviderError::Parse("bad json".into()).is_retryable());
    }
}
