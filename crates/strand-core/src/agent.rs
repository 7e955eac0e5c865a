// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_config::{AgentConfig, EventBusConfig};
use strand_events::{
    AgentEvent, Bookmark, DoneReason, ErrorSeverity, EventBus, EventStream, PermissionChoice,
    SubscribeOptions, SubscriptionId,
};
use strand_memory::{MemoryEngine, MemoryEvent};
use strand_model::{
    Block, BlockKind, CompletionRequest, Message, MessageContent, Provider, Role, StreamChunk,
    ToolSchema, ToolUseChunk,
};
use strand_store::{collections, RecordStore, ToolCallRecord, ToolCallState};

use crate::{
    permission::{PermissionDecision, PermissionGate},
    runner::{ProgressSink, ToolRunner},
    session::Session,
    toolcall::ToolCallTable,
};

/// Everything needed to construct an [`Agent`].
pub struct AgentOptions {
    /// Reuse an existing agent id to resume after a crash; `None` creates a
    /// fresh agent.
    pub id: Option<String>,
    /// Tenant namespace used for memory recording.
    pub namespace: String,
    pub provider: Arc<dyn Provider>,
    pub runner: Arc<dyn ToolRunner>,
    pub store: Arc<dyn RecordStore>,
    pub config: AgentConfig,
    pub events: EventBusConfig,
    /// Tool schemas advertised to the model.
    pub tools: Vec<ToolSchema>,
    pub memory: Option<Arc<MemoryEngine>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStatus {
    Ok,
    /// The turn suspended on one or more permission asks; decide them with
    /// [`Agent::set_permission_decision`] and call [`Agent::resume_chat`].
    Paused,
}

/// Result of one blocking [`Agent::chat`] exchange.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub status: ChatStatus,
    pub text: String,
    pub last_bookmark: Option<Bookmark>,
    pub pending_permission_ids: Vec<String>,
}

/// How the turn loop treats outstanding permission asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermissionWait {
    /// Block the loop until every decision arrives (send / stream).
    Block,
    /// Suspend the turn and report the pending ids (chat).
    Suspend,
}

enum TurnOutcome {
    Completed { text: String },
    Paused { pending: Vec<String> },
    Interrupted { text: String },
}

#[derive(Debug, Clone)]
enum Verdict {
    Allow,
    Deny(Option<String>),
}

/// A tool call whose batch suspended on the permission gate.
#[derive(Debug, Clone)]
struct ParkedCall {
    id: String,
    verdict: Option<Verdict>,
}

/// The agent: one conversational thread, one provider, one tool-execution
/// context.  Owns its session, live tool-call table, and event bus; shares
/// the record store with every other agent in the process.
pub struct Agent {
    id: String,
    namespace: String,
    config: Arc<AgentConfig>,
    provider: Arc<dyn Provider>,
    tools: Vec<ToolSchema>,
    session: Mutex<Session>,
    table: Arc<ToolCallTable>,
    bus: Arc<EventBus>,
    gate: Arc<PermissionGate>,
    store: Arc<dyn RecordStore>,
    memory: Option<Arc<MemoryEngine>>,
    exec: Executor,
    parked: StdMutex<Vec<ParkedCall>>,
    /// Single-writer invariant over the conversation: only the turn loop
    /// appends messages, and only one turn runs at a time.
    turn_lock: Mutex<()>,
    cancel_root: CancellationToken,
    current_turn: StdMutex<Option<CancellationToken>>,
}

impl Agent {
    /// Construct an agent.
    ///
    /// When `opts.id` names a pre-existing agent, its persisted tool-call
    /// records are loaded and any record still in a non-terminal state is
    /// sealed to `cancelled` before the first turn; an `agent_resumed`
    /// event with the sealed snapshots is published on the Monitor channel.
    pub async fn new(opts: AgentOptions) -> anyhow::Result<Arc<Self>> {
        let resumed = opts.id.is_some();
        let id = opts.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let config = Arc::new(opts.config);
        let bus = Arc::new(EventBus::new(opts.events));
        let table = Arc::new(ToolCallTable::new());
        let gate = Arc::new(PermissionGate::from_config(&config));

        let exec = Executor {
            agent_id: id.clone(),
            namespace: opts.namespace.clone(),
            table: Arc::clone(&table),
            bus: Arc::clone(&bus),
            runner: Arc::clone(&opts.runner),
            store: Arc::clone(&opts.store),
            memory: opts.memory.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_tool_concurrency.max(1))),
            timeout: config.tool_timeout_ms.map(Duration::from_millis),
        };

        let agent = Arc::new(Self {
            id: id.clone(),
            namespace: opts.namespace,
            config,
            provider: opts.provider,
            tools: opts.tools,
            session: Mutex::new(Session::with_id(format!("session-{id}"))),
            table,
            bus,
            gate,
            store: opts.store,
            memory: opts.memory,
            exec,
            parked: StdMutex::new(Vec::new()),
            turn_lock: Mutex::new(()),
            cancel_root: CancellationToken::new(),
            current_turn: StdMutex::new(None),
        });

        if resumed {
            agent.seal_crashed_records().await?;
        }
        Ok(agent)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tenant namespace memories are recorded under.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn memory(&self) -> Option<&Arc<MemoryEngine>> {
        self.memory.as_ref()
    }

    /// Subscribe to this agent's event stream.  Dropping the stream ends
    /// the subscription.
    pub fn subscribe(&self, opts: SubscribeOptions) -> (EventStream, SubscriptionId) {
        self.bus.subscribe(opts)
    }

    /// Publish an event on this agent's bus.  Used by external
    /// collaborators (file watchers, schedulers) for Monitor traffic.
    pub fn publish(&self, event: AgentEvent) -> Bookmark {
        self.bus.publish(event)
    }

    /// Progress callback to inject into the [`ToolRunner`] at construction.
    pub fn progress_sink(&self) -> Arc<dyn ProgressSink> {
        Arc::new(AgentProgressSink {
            table: Arc::clone(&self.table),
            bus: Arc::clone(&self.bus),
        })
    }

    /// Snapshot of every tool call this agent has seen.
    pub fn tool_calls(&self) -> Vec<ToolCallRecord> {
        self.table.snapshot()
    }

    /// Current conversation messages.
    pub async fn messages(&self) -> Vec<Message> {
        self.session.lock().await.messages.clone()
    }

    // ── Turn driving ──────────────────────────────────────────────────────────

    /// Enqueue a user turn and drive the loop until the model produces a
    /// terminal assistant response (permission asks block until decided).
    pub async fn send(&self, user_message: &str) -> anyhow::Result<()> {
        let _turn = self.turn_lock.lock().await;
        self.run_loop(Some(user_message), PermissionWait::Block).await?;
        Ok(())
    }

    /// Like [`send`](Agent::send), but returns the event stream immediately
    /// and drives the loop in a background task.
    pub fn stream(self: &Arc<Self>, user_input: &str) -> EventStream {
        let (stream, _id) = self.bus.subscribe(SubscribeOptions::default());
        let agent = Arc::clone(self);
        let input = user_input.to_string();
        tokio::spawn(async move {
            if let Err(e) = agent.send(&input).await {
                agent.bus.publish(AgentEvent::Error {
                    severity: ErrorSeverity::Fatal,
                    phase: "turn".into(),
                    message: e.to_string(),
                });
                agent.bus.publish(AgentEvent::Done { reason: DoneReason::Error });
            }
        });
        stream
    }

    /// Blocking request/response variant.  Suspends (instead of blocking)
    /// on permission asks: a `Paused` result carries the pending call ids.
    pub async fn chat(&self, input: &str) -> anyhow::Result<ChatResult> {
        let _turn = self.turn_lock.lock().await;
        let outcome = self.run_loop(Some(input), PermissionWait::Suspend).await?;
        Ok(self.chat_result(outcome))
    }

    /// Continue a chat turn that suspended on permissions.
    pub async fn resume_chat(&self) -> anyhow::Result<ChatResult> {
        let _turn = self.turn_lock.lock().await;
        let outcome = self.run_loop(None, PermissionWait::Suspend).await?;
        Ok(self.chat_result(outcome))
    }

    fn chat_result(&self, outcome: TurnOutcome) -> ChatResult {
        match outcome {
            TurnOutcome::Completed { text } | TurnOutcome::Interrupted { text } => ChatResult {
                status: ChatStatus::Ok,
                text,
                last_bookmark: self.bus.last_bookmark(),
                pending_permission_ids: Vec::new(),
            },
            TurnOutcome::Paused { pending } => ChatResult {
                status: ChatStatus::Paused,
                text: String::new(),
                last_bookmark: self.bus.last_bookmark(),
                pending_permission_ids: pending,
            },
        }
    }

    // ── Control surface ───────────────────────────────────────────────────────

    /// Interrupt the turn currently in flight, if any.
    pub fn cancel_turn(&self) {
        if let Some(token) = self.current_turn.lock().expect("turn token lock").as_ref() {
            token.cancel();
        }
    }

    /// Record a permission decision for a pending ask.
    pub fn set_permission_decision(
        &self,
        call_id: &str,
        decision: PermissionChoice,
        note: Option<String>,
    ) -> anyhow::Result<()> {
        if !self.gate.decide(call_id, decision, note.clone()) {
            anyhow::bail!("no pending permission request for call {call_id}");
        }
        self.bus.publish(AgentEvent::PermissionDecided {
            call_id: call_id.to_string(),
            decision,
            note,
        });
        Ok(())
    }

    /// Suspend an executing tool call.  A second pause on an already
    /// pausing/paused call is a no-op.
    pub async fn pause(&self, call_id: &str) -> anyhow::Result<ToolCallRecord> {
        let rec = self
            .table
            .get(call_id)
            .with_context(|| format!("unknown tool call: {call_id}"))?;
        match rec.state {
            ToolCallState::Pausing | ToolCallState::Paused => Ok(rec),
            ToolCallState::Executing if rec.pausable => {
                self.bus
                    .publish(AgentEvent::ToolPauseRequested { call_id: call_id.to_string() });
                self.exec.transition_event(call_id, ToolCallState::Pausing);
                self.exec.runner.pause(call_id).await;
                self.exec.transition_event(call_id, ToolCallState::Paused);
                self.table
                    .get(call_id)
                    .with_context(|| format!("unknown tool call: {call_id}"))
            }
            state => anyhow::bail!("call {call_id} is not pausable in state {state:?}"),
        }
    }

    /// Resume a paused tool call.
    pub async fn resume(&self, call_id: &str) -> anyhow::Result<ToolCallRecord> {
        let rec = self
            .table
            .get(call_id)
            .with_context(|| format!("unknown tool call: {call_id}"))?;
        match rec.state {
            ToolCallState::Executing => Ok(rec),
            ToolCallState::Paused => {
                self.bus
                    .publish(AgentEvent::ToolResumeRequested { call_id: call_id.to_string() });
                self.exec.runner.resume(call_id).await;
                self.exec.transition_event(call_id, ToolCallState::Executing);
                self.table
                    .get(call_id)
                    .with_context(|| format!("unknown tool call: {call_id}"))
            }
            state => anyhow::bail!("call {call_id} is not resumable in state {state:?}"),
        }
    }

    /// Cancel a tool call.  Idempotent: repeat cancels of a cancelling or
    /// already-terminal call are no-ops.
    pub async fn cancel(&self, call_id: &str) -> anyhow::Result<ToolCallRecord> {
        let rec = self
            .table
            .get(call_id)
            .with_context(|| format!("unknown tool call: {call_id}"))?;
        if rec.state.is_terminal() || rec.state == ToolCallState::Cancelling {
            return Ok(rec);
        }
        if !rec.cancelable {
            anyhow::bail!("call {call_id} is not cancelable");
        }
        self.bus
            .publish(AgentEvent::ToolCancelRequested { call_id: call_id.to_string() });
        let was_parked = {
            let mut parked = self.parked.lock().expect("parked lock");
            let len_before = parked.len();
            parked.retain(|p| p.id != call_id);
            parked.len() != len_before
        };
        self.exec.transition_event(call_id, ToolCallState::Cancelling);
        self.exec.runner.cancel(call_id).await;
        if was_parked || rec.state == ToolCallState::Queued {
            // No task owns this call; finalize here.  Running calls are
            // finalized by their own task when the runner unblocks.
            self.gate.forget_ask(call_id);
            self.exec.finalize_cancelled(call_id, "cancelled").await;
        }
        self.table
            .get(call_id)
            .with_context(|| format!("unknown tool call: {call_id}"))
    }

    /// Close the agent: cancel all in-flight tool calls, flush durable
    /// state, and close the event bus so subscribers see a clean end.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.cancel_root.cancel();
        for id in self.table.live_ids() {
            self.exec.transition_event(&id, ToolCallState::Cancelling);
            self.exec.runner.cancel(&id).await;
            self.exec.finalize_cancelled(&id, "agent_closed").await;
        }
        // Flush records and the message log.
        for rec in self.table.snapshot() {
            self.exec.persist(&rec).await;
        }
        let session = self.session.lock().await;
        let log = json!({
            "session_id": session.id,
            "agent_id": self.id,
            "messages": session.messages,
        });
        if let Err(e) = self.store.set(collections::SESSIONS, &session.id, log).await {
            warn!(error = %e, "failed to flush session log");
        }
        drop(session);
        self.bus.close_default().await;
        Ok(())
    }

    // ── Crash recovery ────────────────────────────────────────────────────────

    async fn seal_crashed_records(&self) -> anyhow::Result<()> {
        let records = self
            .store
            .load_tool_call_records(&self.id)
            .await
            .context("loading persisted tool-call records")?;
        let mut sealed = Vec::new();
        for mut rec in records {
            if !rec.state.is_terminal() {
                rec.state = ToolCallState::Cancelled;
                rec.error = Some("crash_recovery".into());
                rec.updated_at = chrono::Utc::now();
                self.exec.persist(&rec).await;
                sealed.push(rec.clone());
            }
            self.table.insert(rec);
        }
        self.bus.publish(AgentEvent::AgentResumed { sealed });
        Ok(())
    }

    // ── Turn loop ─────────────────────────────────────────────────────────────

    async fn run_loop(
        &self,
        user_input: Option<&str>,
        wait: PermissionWait,
    ) -> anyhow::Result<TurnOutcome> {
        let token = self.cancel_root.child_token();
        *self.current_turn.lock().expect("turn token lock") = Some(token.clone());

        // A batch suspended on permissions resumes before new input is
        // accepted, so tool results stay adjacent to their tool uses.
        if !self.parked.lock().expect("parked lock").is_empty() {
            match self.drain_parked(wait, &token).await? {
                DrainOutcome::StillPending(pending) => {
                    return Ok(TurnOutcome::Paused { pending })
                }
                DrainOutcome::Interrupted => return self.finish_interrupted(String::new()),
                DrainOutcome::Resolved => {}
            }
            let outcome = self.loop_until_done(&token, wait).await?;
            match (&outcome, user_input) {
                (TurnOutcome::Completed { .. }, Some(_)) => {}
                _ => return Ok(outcome),
            }
        }

        if let Some(input) = user_input {
            self.session.lock().await.push(Message::user(input));
        }
        self.loop_until_done(&token, wait).await
    }

    async fn loop_until_done(
        &self,
        token: &CancellationToken,
        wait: PermissionWait,
    ) -> anyhow::Result<TurnOutcome> {
        let mut final_text = String::new();

        for _turn in 0..self.config.max_turns {
            let mut acc = TextAccumulator::default();
            let streamed = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                r = self.stream_one_turn(&mut acc) => Some(r),
            };

            let streamed = match streamed {
                None => {
                    // Interrupted mid-stream: keep whatever text arrived.
                    let partial = acc.joined();
                    if !partial.is_empty() {
                        self.session.lock().await.push(Message::assistant(&partial));
                        final_text = partial;
                    }
                    return self.finish_interrupted(final_text);
                }
                Some(Err(e)) => {
                    self.bus.publish(AgentEvent::Error {
                        severity: ErrorSeverity::Fatal,
                        phase: "provider".into(),
                        message: e.to_string(),
                    });
                    self.bus.publish(AgentEvent::Done { reason: DoneReason::Error });
                    return Err(e);
                }
                Some(Ok(s)) => s,
            };

            // Materialize tool calls before appending, so synthetic ids are
            // consistent between the conversation and the live table.
            let records = self.materialize_tool_calls(&streamed.tool_uses);

            if !streamed.text.is_empty() || !records.is_empty() {
                let mut blocks: Vec<Block> = Vec::new();
                if !streamed.text.is_empty() {
                    blocks.push(Block::text(&streamed.text));
                }
                for rec in &records {
                    blocks.push(Block::tool_use(&rec.id, &rec.name, rec.input.clone()));
                }
                self.session.lock().await.push(Message {
                    role: Role::Assistant,
                    content: match blocks.as_slice() {
                        [Block::Text { text }] => MessageContent::Text(text.clone()),
                        _ => MessageContent::Blocks(blocks),
                    },
                });
            }
            if !streamed.text.is_empty() {
                final_text = streamed.text.clone();
            }

            if streamed.stream_failed {
                // Partial assistant output is already committed; the turn
                // ends without losing it.
                self.bus.publish(AgentEvent::Done { reason: DoneReason::Error });
                return Ok(TurnOutcome::Completed { text: final_text });
            }

            if records.is_empty() {
                self.bus.publish(AgentEvent::Done { reason: DoneReason::Completed });
                return Ok(TurnOutcome::Completed { text: final_text });
            }

            // Permission phase.
            let verdicts = match self.resolve_permissions(&records, wait, token).await {
                PermissionOutcome::Resolved(v) => v,
                PermissionOutcome::Pending(pending) => {
                    return Ok(TurnOutcome::Paused { pending })
                }
                PermissionOutcome::Interrupted => return self.finish_interrupted(final_text),
            };

            // Execution phase.
            let result_blocks = self.execute_batch(verdicts, token).await;
            self.session.lock().await.push(Message {
                role: Role::Tool,
                content: MessageContent::Blocks(result_blocks),
            });

            if token.is_cancelled() {
                return self.finish_interrupted(final_text);
            }
            // Feed the results back to the model.
        }

        self.bus.publish(AgentEvent::Error {
            severity: ErrorSeverity::Warning,
            phase: "loop".into(),
            message: format!("turn budget of {} exhausted", self.config.max_turns),
        });
        self.bus.publish(AgentEvent::Done { reason: DoneReason::Completed });
        Ok(TurnOutcome::Completed { text: final_text })
    }

    fn finish_interrupted(&self, text: String) -> anyhow::Result<TurnOutcome> {
        self.bus.publish(AgentEvent::Done { reason: DoneReason::Interrupted });
        Ok(TurnOutcome::Interrupted { text })
    }

    /// Call the provider once, demuxing chunks into progress events and
    /// collecting the turn's text and tool uses.
    async fn stream_one_turn(&self, acc: &mut TextAccumulator) -> anyhow::Result<TurnStream> {
        let messages = { self.session.lock().await.messages.clone() };
        let req = CompletionRequest {
            messages,
            tools: self.tools.clone(),
            stream: true,
            system: self.config.system_prompt.clone(),
            ..Default::default()
        };

        let mut stream = self
            .provider
            .stream(req)
            .await
            .context("provider stream failed")?;

        let mut tool_uses: Vec<ToolUseChunk> = Vec::new();
        let mut stream_failed = false;

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(c) => c,
                Err(e) => {
                    // Mid-stream failure: keep already-streamed text, fail
                    // the turn only if nothing was produced yet.
                    if acc.has_text() {
                        warn!(error = %e, "provider stream failed mid-turn; keeping partial text");
                        self.bus.publish(AgentEvent::Error {
                            severity: ErrorSeverity::Warning,
                            phase: "stream".into(),
                            message: e.to_string(),
                        });
                        stream_failed = true;
                        break;
                    }
                    return Err(anyhow::Error::new(e).context("provider stream failed"));
                }
            };
            match chunk {
                StreamChunk::BlockStart { index, kind: BlockKind::Text } => {
                    self.bus.publish(AgentEvent::TextChunkStart { index });
                }
                StreamChunk::BlockStart { index, kind: BlockKind::Thinking } => {
                    self.bus.publish(AgentEvent::ThinkChunkStart { index });
                }
                StreamChunk::BlockStart { kind: BlockKind::ToolUse { .. }, .. } => {
                    // tool_start is published at materialization, once the
                    // accumulated input is known.
                }
                StreamChunk::TextDelta { index, text } => {
                    acc.texts.entry(index).or_default().push_str(&text);
                    self.bus.publish(AgentEvent::TextChunk { index, delta: text });
                }
                StreamChunk::ReasoningDelta { index, text } => {
                    acc.thinks.entry(index).or_default().push_str(&text);
                    self.bus.publish(AgentEvent::ThinkChunk { index, delta: text });
                }
                StreamChunk::ToolInputDelta { .. } => {}
                StreamChunk::BlockStop { tool_use: Some(tu), .. } => {
                    tool_uses.push(tu);
                }
                StreamChunk::BlockStop { index, tool_use: None } => {
                    if let Some(text) = acc.texts.get(&index) {
                        self.bus.publish(AgentEvent::TextChunkEnd {
                            index,
                            text: text.clone(),
                        });
                    } else if let Some(text) = acc.thinks.get(&index) {
                        self.bus.publish(AgentEvent::ThinkChunkEnd {
                            index,
                            text: text.clone(),
                        });
                    }
                }
                StreamChunk::MessageDelta { .. } => {}
                StreamChunk::Usage(u) => {
                    self.bus.publish(AgentEvent::TokenUsage {
                        input_tokens: u.input_tokens,
                        output_tokens: u.output_tokens,
                        cache_read_tokens: u.cache_read_tokens,
                        cache_write_tokens: u.cache_write_tokens,
                    });
                }
                StreamChunk::Error(message) => {
                    self.bus.publish(AgentEvent::Error {
                        severity: ErrorSeverity::Warning,
                        phase: "stream".into(),
                        message,
                    });
                }
                StreamChunk::Done => break,
            }
        }

        Ok(TurnStream { text: acc.joined(), tool_uses, stream_failed })
    }

    /// Register one queued record per tool use and announce it.
    fn materialize_tool_calls(&self, tool_uses: &[ToolUseChunk]) -> Vec<ToolCallRecord> {
        let mut records = Vec::with_capacity(tool_uses.len());
        for (i, tu) in tool_uses.iter().enumerate() {
            if tu.name.is_empty() {
                warn!(tool_use_id = %tu.id, "dropping tool call with empty name; cannot dispatch");
                continue;
            }
            let id = if tu.id.is_empty() {
                let synthetic = format!("tc_synthetic_{i}");
                warn!(tool_name = %tu.name, id = %synthetic, "tool call had empty id; generated synthetic id");
                synthetic
            } else {
                tu.id.clone()
            };
            let mut rec = ToolCallRecord::new(id, &tu.name, tu.input.clone());
            rec.pausable = true;
            if let Some(err) = &tu.input_error {
                rec.intermediate = Some(json!({ "input_error": err }));
            }
            self.table.insert(rec.clone());
            self.bus.publish(AgentEvent::ToolStart { call: rec.clone() });
            records.push(rec);
        }
        records
    }

    async fn resolve_permissions(
        &self,
        records: &[ToolCallRecord],
        wait: PermissionWait,
        token: &CancellationToken,
    ) -> PermissionOutcome {
        let mut verdicts: Vec<(String, Option<Verdict>)> = Vec::with_capacity(records.len());
        let mut asks: Vec<String> = Vec::new();

        for rec in records {
            match self.gate.check(&rec.name) {
                PermissionDecision::Allow => verdicts.push((rec.id.clone(), Some(Verdict::Allow))),
                PermissionDecision::Deny => verdicts
                    .push((rec.id.clone(), Some(Verdict::Deny(Some("denied by policy".into()))))),
                PermissionDecision::Ask => {
                    self.gate.register_ask(&rec.id);
                    self.bus.publish(AgentEvent::PermissionRequired { call: rec.clone() });
                    asks.push(rec.id.clone());
                    verdicts.push((rec.id.clone(), None));
                }
            }
        }

        if asks.is_empty() {
            let resolved = verdicts
                .into_iter()
                .map(|(id, v)| (id, v.expect("non-ask verdict")))
                .collect();
            return PermissionOutcome::Resolved(resolved);
        }

        match wait {
            PermissionWait::Block => {
                for (id, verdict) in verdicts.iter_mut() {
                    if verdict.is_some() {
                        continue;
                    }
                    let decision = tokio::select! {
                        biased;
                        _ = token.cancelled() => return PermissionOutcome::Interrupted,
                        d = self.gate.wait_decision(id) => d,
                    };
                    *verdict = Some(match decision {
                        (PermissionChoice::Allow, _) => Verdict::Allow,
                        (PermissionChoice::Deny, note) => Verdict::Deny(note),
                    });
                }
                let resolved = verdicts
                    .into_iter()
                    .map(|(id, v)| (id, v.expect("decided")))
                    .collect();
                PermissionOutcome::Resolved(resolved)
            }
            PermissionWait::Suspend => {
                // Park the whole batch so its results land together once
                // every decision arrives.
                let mut parked = self.parked.lock().expect("parked lock");
                *parked = verdicts
                    .into_iter()
                    .map(|(id, verdict)| ParkedCall { id, verdict })
                    .collect();
                PermissionOutcome::Pending(self.gate.pending_ids())
            }
        }
    }

    /// Resolve a previously parked batch.  Decided calls execute; if any
    /// ask is still open the batch stays parked.
    async fn drain_parked(
        &self,
        wait: PermissionWait,
        token: &CancellationToken,
    ) -> anyhow::Result<DrainOutcome> {
        let mut batch: Vec<ParkedCall> = self.parked.lock().expect("parked lock").clone();

        let mut interrupted = false;
        for call in batch.iter_mut() {
            if call.verdict.is_some() {
                continue;
            }
            let decision = match wait {
                PermissionWait::Block => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            interrupted = true;
                            None
                        }
                        d = self.gate.wait_decision(&call.id) => Some(d),
                    }
                }
                PermissionWait::Suspend => self.gate.take_decision(&call.id),
            };
            if let Some(decision) = decision {
                call.verdict = Some(match decision {
                    (PermissionChoice::Allow, _) => Verdict::Allow,
                    (PermissionChoice::Deny, note) => Verdict::Deny(note),
                });
            }
            if interrupted {
                break;
            }
        }

        if interrupted {
            // Interrupted while suspended: the whole batch is sealed as
            // cancelled.
            for c in &batch {
                self.exec.transition_event(&c.id, ToolCallState::Cancelling);
                self.exec.finalize_cancelled(&c.id, "interrupted").await;
            }
            self.parked.lock().expect("parked lock").clear();
            return Ok(DrainOutcome::Interrupted);
        }

        if batch.iter().any(|c| c.verdict.is_none()) {
            // Keep any decisions that did arrive.
            *self.parked.lock().expect("parked lock") = batch;
            return Ok(DrainOutcome::StillPending(self.gate.pending_ids()));
        }

        self.parked.lock().expect("parked lock").clear();
        let verdicts: Vec<(String, Verdict)> = batch
            .into_iter()
            .map(|c| (c.id, c.verdict.expect("decided")))
            .collect();
        let result_blocks = self.execute_batch(verdicts, token).await;
        self.session.lock().await.push(Message {
            role: Role::Tool,
            content: MessageContent::Blocks(result_blocks),
        });
        Ok(DrainOutcome::Resolved)
    }

    /// Execute one batch of decided tool calls with bounded concurrency,
    /// returning one result block per call in input order.
    async fn execute_batch(
        &self,
        verdicts: Vec<(String, Verdict)>,
        token: &CancellationToken,
    ) -> Vec<Block> {
        let mut handles: Vec<(String, Option<tokio::task::JoinHandle<Block>>, Option<Block>)> =
            Vec::with_capacity(verdicts.len());

        for (id, verdict) in verdicts {
            match verdict {
                Verdict::Deny(note) => {
                    let block = self.exec.finalize_denied(&id, note).await;
                    handles.push((id, None, Some(block)));
                }
                Verdict::Allow => {
                    let exec = self.exec.clone();
                    let child = token.child_token();
                    let call_id = id.clone();
                    let handle =
                        tokio::spawn(async move { exec.run_one(call_id, child).await });
                    handles.push((id, Some(handle), None));
                }
            }
        }

        let mut blocks = Vec::with_capacity(handles.len());
        for (id, handle, ready) in handles {
            if let Some(block) = ready {
                blocks.push(block);
                continue;
            }
            let block = match handle.expect("spawned").await {
                Ok(b) => b,
                Err(e) => {
                    warn!(call_id = %id, error = %e, "tool task panicked");
                    let _ = self.table.complete_failure(&id, format!("tool task panicked: {e}"));
                    Block::tool_error(&id, format!("tool task panicked: {e}"))
                }
            };
            blocks.push(block);
        }
        blocks
    }
}

enum PermissionOutcome {
    Resolved(Vec<(String, Verdict)>),
    Pending(Vec<String>),
    Interrupted,
}

enum DrainOutcome {
    Resolved,
    StillPending(Vec<String>),
    Interrupted,
}

#[derive(Default)]
struct TextAccumulator {
    texts: BTreeMap<u32, String>,
    thinks: BTreeMap<u32, String>,
}

impl TextAccumulator {
    fn has_text(&self) -> bool {
        self.texts.values().any(|t| !t.is_empty())
    }

    fn joined(&self) -> String {
        self.texts.values().cloned().collect::<Vec<_>>().join("")
    }
}

struct TurnStream {
    text: String,
    tool_uses: Vec<ToolUseChunk>,
    stream_failed: bool,
}

struct AgentProgressSink {
    table: Arc<ToolCallTable>,
    bus: Arc<EventBus>,
}

impl ProgressSink for AgentProgressSink {
    fn report_progress(
        &self,
        call_id: &str,
        progress: f64,
        message: Option<String>,
        intermediate: Option<Value>,
    ) {
        if let Some(stored) = self.table.set_progress(call_id, progress, intermediate) {
            self.bus.publish(AgentEvent::ToolProgress {
                call_id: call_id.to_string(),
                progress: stored,
                message,
            });
        }
    }
}

/// The per-call execution engine: admission, timeout, cancellation, and
/// terminal bookkeeping.  Cloned into each tool task.
#[derive(Clone)]
struct Executor {
    agent_id: String,
    namespace: String,
    table: Arc<ToolCallTable>,
    bus: Arc<EventBus>,
    runner: Arc<dyn ToolRunner>,
    store: Arc<dyn RecordStore>,
    memory: Option<Arc<MemoryEngine>>,
    semaphore: Arc<Semaphore>,
    timeout: Option<Duration>,
}

enum RunEnd {
    Finished(anyhow::Result<Value>),
    Cancelled(&'static str),
}

impl Executor {
    /// Drive one allowed call through pending → executing → terminal.
    async fn run_one(self, id: String, token: CancellationToken) -> Block {
        // Admission: a slot in the bounded pool moves the call to pending.
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return self.finalize_cancelled(&id, "interrupted").await,
            p = Arc::clone(&self.semaphore).acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => return self.finalize_cancelled(&id, "executor shut down").await,
            },
        };
        match self.table.state(&id) {
            Some(ToolCallState::Cancelling) => {
                return self.finalize_cancelled(&id, "cancelled").await
            }
            Some(state) if state.is_terminal() => {
                // Finalized elsewhere (e.g. cancelled while queued).
                let reason = self
                    .table
                    .get(&id)
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "cancelled".into());
                return Block::tool_error(&id, format!("Tool cancelled: {reason}"));
            }
            _ => {}
        }
        self.transition_event(&id, ToolCallState::Pending);

        let Some(rec) = self.table.get(&id) else {
            return Block::tool_error(&id, "tool call vanished from table");
        };
        self.transition_event(&id, ToolCallState::Executing);

        let run = self.runner.run(&id, &rec.name, &rec.input);
        let end = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.runner.cancel(&id).await;
                RunEnd::Cancelled("interrupted")
            }
            r = maybe_timeout(self.timeout, run) => match r {
                Some(result) => RunEnd::Finished(result),
                None => {
                    // Deadline elapsed: executing → cancelling, runner told.
                    self.transition_event(&id, ToolCallState::Cancelling);
                    self.runner.cancel(&id).await;
                    RunEnd::Cancelled("tool timeout")
                }
            },
        };
        drop(permit);

        match end {
            RunEnd::Cancelled(reason) => self.finalize_cancelled(&id, reason).await,
            RunEnd::Finished(result) => {
                if self.table.state(&id) == Some(ToolCallState::Cancelling) {
                    return self.finalize_cancelled(&id, "cancelled").await;
                }
                self.recover_from_pause(&id);
                match result {
                    Ok(value) => self.finalize_success(&id, value).await,
                    Err(e) => self.finalize_failure(&id, &rec.name, e.to_string()).await,
                }
            }
        }
    }

    /// A runner that completes while nominally paused gets its record
    /// walked back to executing so the terminal transition is legal.
    fn recover_from_pause(&self, id: &str) {
        if self.table.state(id) == Some(ToolCallState::Pausing) {
            self.transition_event(id, ToolCallState::Paused);
        }
        if self.table.state(id) == Some(ToolCallState::Paused) {
            self.transition_event(id, ToolCallState::Executing);
        }
    }

    async fn finalize_success(&self, id: &str, value: Value) -> Block {
        let content = value_to_content(&value);
        if let Ok(t) = self.table.complete_success(id, value) {
            self.publish_state(id, t.from, t.to);
        }
        self.emit_end(id).await;
        Block::tool_result(id, content)
    }

    async fn finalize_failure(&self, id: &str, name: &str, error: String) -> Block {
        if let Ok(t) = self.table.complete_failure(id, &error) {
            self.publish_state(id, t.from, t.to);
        }
        self.bus.publish(AgentEvent::ToolError { call_id: id.to_string(), error: error.clone() });
        self.emit_end(id).await;
        self.record_failure_pattern(name, &error);
        Block::tool_error(id, error)
    }

    async fn finalize_cancelled(&self, id: &str, reason: &str) -> Block {
        // May be invoked from several paths; only the first terminal
        // transition emits events.
        self.transition_event(id, ToolCallState::Cancelling);
        match self.table.complete_cancelled(id, reason) {
            Ok(t) => {
                self.publish_state(id, t.from, t.to);
                self.emit_end(id).await;
            }
            Err(_) => debug!(call_id = id, "call already finalized"),
        }
        Block::tool_error(id, format!("Tool cancelled: {reason}"))
    }

    async fn finalize_denied(&self, id: &str, note: Option<String>) -> Block {
        let content = match note {
            Some(note) if !note.is_empty() => format!("Permission denied: {note}"),
            _ => "Permission denied".to_string(),
        };
        if let Ok(t) = self.table.complete_failure(id, &content) {
            self.publish_state(id, t.from, t.to);
        }
        self.emit_end(id).await;
        Block::tool_error(id, content)
    }

    /// Attempt a transition and publish `state_changed` when it applies.
    fn transition_event(&self, id: &str, to: ToolCallState) {
        match self.table.transition(id, to) {
            Ok(t) => self.publish_state(id, t.from, t.to),
            Err(e) => debug!(call_id = id, error = %e, "transition skipped"),
        }
    }

    fn publish_state(&self, id: &str, from: ToolCallState, to: ToolCallState) {
        self.bus.publish(AgentEvent::StateChanged { call_id: id.to_string(), from, to });
    }

    /// Publish the terminal snapshot and archive the record.
    async fn emit_end(&self, id: &str) {
        if let Some(rec) = self.table.get(id) {
            self.bus.publish(AgentEvent::ToolEnd { call: rec.clone() });
            self.persist(&rec).await;
        }
    }

    async fn persist(&self, rec: &ToolCallRecord) {
        let key = format!("{}/{}", self.agent_id, rec.id);
        match serde_json::to_value(rec) {
            Ok(value) => {
                if let Err(e) = self.store.set(collections::TOOL_CALLS, &key, value).await {
                    warn!(call_id = %rec.id, error = %e, "failed to archive tool-call record");
                    self.bus.publish(AgentEvent::Error {
                        severity: ErrorSeverity::Warning,
                        phase: "store".into(),
                        message: e.to_string(),
                    });
                }
            }
            Err(e) => warn!(call_id = %rec.id, error = %e, "tool-call record not serializable"),
        }
    }

    /// Feed a failure into the memory engine; recording is best-effort.
    fn record_failure_pattern(&self, name: &str, error: &str) {
        if let Some(memory) = &self.memory {
            let memory = Arc::clone(memory);
            let event = MemoryEvent::new(
                "tool_failed",
                &self.namespace,
                json!({ "tool": name, "error": error }),
            );
            tokio::spawn(async move {
                if let Err(e) = memory.process_event(&event).await {
                    debug!(error = %e, "memory ingestion failed");
                }
            });
        }
    }
}

/// Run `fut` under an optional deadline.  `None` return means the deadline
/// elapsed.
async fn maybe_timeout<F: std::future::Future>(
    deadline: Option<Duration>,
    fut: F,
) -> Option<F::Output> {
    match deadline {
        Some(d) => tokio::time::timeout(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Stringify a tool result for the conversation: strings pass through,
/// everything else is compact JSON.
fn value_to_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
