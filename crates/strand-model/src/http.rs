// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::OnceLock;
use std::time::Duration;

/// Process-wide HTTP client shared by every provider instance.
///
/// Lazy-initialized on first request and reused for the lifetime of the
/// process so connection pools and TLS sessions are shared across agents.
/// This is the only process-wide mutable state in the crate.
///
/// Deadlines: 120 s for the whole request, 30 s to establish the connection.
pub(crate) fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("static client configuration is valid")
    })
}
