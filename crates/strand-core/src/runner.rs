// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

/// Callback channel the runner uses to surface incremental progress.
///
/// An implementation is injected into the runner at construction (the agent
/// exposes one via [`Agent::progress_sink`](crate::Agent::progress_sink));
/// every report updates the live tool-call table and emits a
/// `tool_progress` event.
pub trait ProgressSink: Send + Sync {
    fn report_progress(
        &self,
        call_id: &str,
        progress: f64,
        message: Option<String>,
        intermediate: Option<Value>,
    );
}

/// External collaborator that actually executes tools, typically inside an
/// isolated sandbox.  The core treats it as opaque: a call either produces
/// a JSON result or an error, and reacts to the pause/resume/cancel
/// signals at its own pace.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Execute `name` with `input`.  Runs until completion, failure, or
    /// until a cancel signal for `call_id` takes effect.
    async fn run(&self, call_id: &str, name: &str, input: &Value) -> anyhow::Result<Value>;

    /// Signal cancellation of an in-flight call.  Must be idempotent.
    async fn cancel(&self, call_id: &str);

    /// Signal the runner to suspend an in-flight call.  Returning from
    /// this method acknowledges the pause.
    async fn pause(&self, call_id: &str);

    /// Signal the runner to continue a paused call.
    async fn resume(&self, call_id: &str);
}
