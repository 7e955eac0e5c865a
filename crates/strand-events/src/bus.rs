// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-agent publish/subscribe bus with bookmarked replay.
//!
//! One monotonic cursor per bus orders events totally across the three
//! channels; each channel keeps a bounded ring of recent envelopes for
//! replay.  Publishing never blocks: subscriber queues are bounded and a
//! full queue marks the subscriber lagging — it receives an out-of-band
//! [`BusItem::Overflow`] notice before its next delivered event.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use strand_config::EventBusConfig;

use crate::{
    envelope::{Bookmark, EventEnvelope},
    event::{AgentEvent, Channel},
};

/// One delivery to a subscriber.
#[derive(Debug, Clone)]
pub enum BusItem {
    Event(EventEnvelope),
    /// The subscriber's bookmark predates the retention window; events up to
    /// and including `missed_up_to` can no longer be replayed.
    Gap { missed_up_to: u64 },
    /// The subscriber lagged and live events were dropped for it.
    Overflow,
}

/// Subscription filter.  `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Replay buffered events with `cursor > since.cursor` before going live.
    pub since: Option<Bookmark>,
    /// Only deliver events whose [`AgentEvent::kind`] is listed.
    pub kinds: Option<Vec<String>>,
    /// Only deliver events on the listed channels.
    pub channels: Option<Vec<Channel>>,
}

impl SubscribeOptions {
    fn matches(&self, event: &AgentEvent) -> bool {
        if let Some(channels) = &self.channels {
            if !channels.contains(&event.channel()) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.iter().any(|k| k == event.kind()) {
                return false;
            }
        }
        true
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = BusItem> + Send>>;

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BusItem>,
    filter: SubscribeOptions,
    /// Set when a delivery was dropped; cleared once an Overflow notice
    /// reaches the subscriber.
    overflowed: bool,
}

struct Ring {
    channel: Channel,
    buf: VecDeque<EventEnvelope>,
}

struct BusState {
    cursor: u64,
    last_bookmark: Option<Bookmark>,
    rings: [Ring; 3],
    /// Highest cursor ever evicted from any ring.
    evicted_up_to: u64,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    closed: bool,
}

impl BusState {
    fn ring_mut(&mut self, channel: Channel) -> &mut Ring {
        self.rings
            .iter_mut()
            .find(|r| r.channel == channel)
            .expect("one ring per channel")
    }
}

pub struct EventBus {
    config: EventBusConfig,
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            state: Mutex::new(BusState {
                cursor: 0,
                last_bookmark: None,
                rings: [
                    Ring { channel: Channel::Progress, buf: VecDeque::new() },
                    Ring { channel: Channel::Control, buf: VecDeque::new() },
                    Ring { channel: Channel::Monitor, buf: VecDeque::new() },
                ],
                evicted_up_to: 0,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
                closed: false,
            }),
            config,
        }
    }

    /// Publish one event, assigning it the next cursor.
    ///
    /// Never blocks: lagging subscribers lose the event and are flagged for
    /// an overflow notice.  Returns the bookmark of the published envelope.
    pub fn publish(&self, event: AgentEvent) -> Bookmark {
        let mut state = self.state.lock().expect("bus lock");
        if state.closed {
            debug!(kind = event.kind(), "dropping publish on closed bus");
            return state.last_bookmark.unwrap_or_else(|| Bookmark::new(state.cursor));
        }

        state.cursor += 1;
        let envelope = EventEnvelope::new(state.cursor, event);
        let bookmark = envelope.bookmark;
        state.last_bookmark = Some(bookmark);

        let retention = self.config.retention;
        let channel = envelope.event.channel();
        let evicted_cursor = {
            let ring = state.ring_mut(channel);
            ring.buf.push_back(envelope.clone());
            if ring.buf.len() > retention {
                ring.buf.pop_front().map(|e| e.cursor)
            } else {
                None
            }
        };
        if let Some(cursor) = evicted_cursor {
            state.evicted_up_to = state.evicted_up_to.max(cursor);
        }

        state.subscribers.retain_mut(|sub| {
            if !sub.filter.matches(&envelope.event) {
                return true;
            }
            if sub.overflowed {
                match sub.tx.try_send(BusItem::Overflow) {
                    Ok(()) => sub.overflowed = false,
                    Err(mpsc::error::TrySendError::Full(_)) => return true,
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            match sub.tx.try_send(BusItem::Event(envelope.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.overflowed = true;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        bookmark
    }

    /// Bookmark of the most recently published envelope.
    pub fn last_bookmark(&self) -> Option<Bookmark> {
        self.state.lock().expect("bus lock").last_bookmark
    }

    /// Subscribe with an optional replay position and filters.
    ///
    /// Replay and registration happen under the same lock, so the returned
    /// stream is gapless and duplicate-free across the replay → live
    /// transition.
    pub fn subscribe(&self, filter: SubscribeOptions) -> (EventStream, SubscriptionId) {
        let mut state = self.state.lock().expect("bus lock");

        let mut replay: Vec<BusItem> = Vec::new();
        if let Some(since) = filter.since {
            if state.evicted_up_to > since.cursor {
                replay.push(BusItem::Gap { missed_up_to: state.evicted_up_to });
            }
            let mut buffered: Vec<EventEnvelope> = state
                .rings
                .iter()
                .flat_map(|r| r.buf.iter())
                .filter(|env| env.cursor > since.cursor && filter.matches(&env.event))
                .cloned()
                .collect();
            buffered.sort_by_key(|env| env.cursor);
            replay.extend(buffered.into_iter().map(BusItem::Event));
        }

        let (tx, rx) = mpsc::channel(self.config.subscriber_queue.max(1));
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        if state.closed {
            // A closed bus delivers the replay, then ends immediately —
            // dropping tx here closes the receiver.
            drop(tx);
        } else {
            state.subscribers.push(Subscriber { id, tx, filter, overflowed: false });
        }

        let stream = stream::iter(replay).chain(ReceiverStream::new(rx)).boxed();
        (stream, SubscriptionId(id))
    }

    /// Remove a subscriber; its stream ends after draining queued items.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.lock().expect("bus lock");
        state.subscribers.retain(|s| s.id != id.0);
    }

    /// Close the bus: drain pending deliveries for at most `drain`, then
    /// drop every subscriber sender so streams observe a clean end.
    pub async fn close(&self, drain: Duration) {
        {
            let mut state = self.state.lock().expect("bus lock");
            state.closed = true;
        }

        let deadline = tokio::time::Instant::now() + drain;
        loop {
            let pending = {
                let state = self.state.lock().expect("bus lock");
                state
                    .subscribers
                    .iter()
                    .any(|s| s.tx.capacity() < s.tx.max_capacity())
            };
            if !pending || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut state = self.state.lock().expect("bus lock");
        state.subscribers.clear();
    }

    /// Close with the configured drain deadline.
    pub async fn close_default(&self) {
        self.close(Duration::from_millis(self.config.close_drain_ms)).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DoneReason;

    fn bus() -> EventBus {
        EventBus::new(EventBusConfig::default())
    }

    fn bus_with(retention: usize, queue: usize) -> EventBus {
        EventBus::new(EventBusConfig {
            retention,
            subscriber_queue: queue,
            close_drain_ms: 100,
        })
    }

    fn text(delta: &str) -> AgentEvent {
        AgentEvent::TextChunk { index: 0, delta: delta.into() }
    }

    fn monitor_usage() -> AgentEvent {
        AgentEvent::TokenUsage {
            input_tokens: 1,
            output_tokens: 1,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        }
    }

    async fn next_event(stream: &mut EventStream) -> EventEnvelope {
        match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
            Ok(Some(BusItem::Event(env))) => env,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cursors_are_strictly_monotonic_across_channels() {
        let bus = bus();
        let b1 = bus.publish(text("a"));
        let b2 = bus.publish(monitor_usage());
        let b3 = bus.publish(AgentEvent::Done { reason: DoneReason::Completed });
        assert!(b1.cursor < b2.cursor && b2.cursor < b3.cursor);
    }

    #[tokio::test]
    async fn live_delivery_preserves_order() {
        let bus = bus();
        let (mut stream, _id) = bus.subscribe(SubscribeOptions::default());
        bus.publish(text("one"));
        bus.publish(text("two"));

        let first = next_event(&mut stream).await;
        let second = next_event(&mut stream).await;
        assert!(first.cursor < second.cursor);
        assert!(matches!(first.event, AgentEvent::TextChunk { ref delta, .. } if delta == "one"));
    }

    #[tokio::test]
    async fn channel_filter_excludes_other_channels() {
        let bus = bus();
        let (mut stream, _id) = bus.subscribe(SubscribeOptions {
            channels: Some(vec![Channel::Monitor]),
            ..Default::default()
        });
        bus.publish(text("progress"));
        bus.publish(monitor_usage());

        let env = next_event(&mut stream).await;
        assert_eq!(env.event.channel(), Channel::Monitor);
    }

    #[tokio::test]
    async fn kind_filter_selects_named_kinds() {
        let bus = bus();
        let (mut stream, _id) = bus.subscribe(SubscribeOptions {
            kinds: Some(vec!["done".into()]),
            ..Default::default()
        });
        bus.publish(text("ignored"));
        bus.publish(AgentEvent::Done { reason: DoneReason::Completed });

        let env = next_event(&mut stream).await;
        assert_eq!(env.event.kind(), "done");
    }

    #[tokio::test]
    async fn bookmark_replay_delivers_events_after_cursor() {
        let bus = bus();
        let mut bookmarks = Vec::new();
        for i in 1..=10 {
            bookmarks.push(bus.publish(text(&format!("e{i}"))));
        }

        // Subscribe from cursor 5: expect envelopes 6..=10.
        let (mut stream, _id) = bus.subscribe(SubscribeOptions {
            since: Some(bookmarks[4]),
            ..Default::default()
        });
        for expected in 6..=10u64 {
            let env = next_event(&mut stream).await;
            assert_eq!(env.cursor, expected);
        }

        // Then live delivery continues.
        bus.publish(text("live"));
        let env = next_event(&mut stream).await;
        assert_eq!(env.cursor, 11);
    }

    #[tokio::test]
    async fn replay_respects_filters() {
        let bus = bus();
        let start = bus.publish(text("before"));
        bus.publish(text("progress"));
        bus.publish(monitor_usage());

        let (mut stream, _id) = bus.subscribe(SubscribeOptions {
            since: Some(start),
            channels: Some(vec![Channel::Monitor]),
            ..Default::default()
        });
        let env = next_event(&mut stream).await;
        assert_eq!(env.event.channel(), Channel::Monitor);
    }

    #[tokio::test]
    async fn bookmark_older_than_window_yields_gap() {
        let bus = bus_with(4, 256);
        let first = bus.publish(text("first"));
        for i in 0..10 {
            bus.publish(text(&format!("e{i}")));
        }

        let (mut stream, _id) = bus.subscribe(SubscribeOptions {
            since: Some(first),
            ..Default::default()
        });
        match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
            Ok(Some(BusItem::Gap { missed_up_to })) => assert!(missed_up_to > first.cursor),
            other => panic!("expected gap, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_marks_lagging_subscriber() {
        let bus = bus_with(1024, 2);
        let (mut stream, _id) = bus.subscribe(SubscribeOptions::default());
        // Queue depth 2: the third publish is dropped and the subscriber is
        // flagged; once it drains, the next delivery leads with Overflow.
        bus.publish(text("a"));
        bus.publish(text("b"));
        bus.publish(text("lost"));

        assert!(matches!(stream.next().await, Some(BusItem::Event(_))));
        assert!(matches!(stream.next().await, Some(BusItem::Event(_))));

        bus.publish(text("after"));
        let notice = stream.next().await;
        assert!(matches!(notice, Some(BusItem::Overflow)), "got {notice:?}");
        let resumed = stream.next().await;
        match resumed {
            Some(BusItem::Event(env)) => {
                assert!(matches!(env.event, AgentEvent::TextChunk { ref delta, .. } if delta == "after"))
            }
            other => panic!("expected live event after overflow notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_ends_subscriber_streams_cleanly() {
        let bus = bus();
        let (mut stream, _id) = bus.subscribe(SubscribeOptions::default());
        bus.publish(text("last"));
        bus.close(Duration::from_millis(200)).await;

        // The queued event is still delivered, then the stream ends.
        assert!(matches!(stream.next().await, Some(BusItem::Event(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn publish_after_close_is_dropped() {
        let bus = bus();
        bus.publish(text("one"));
        bus.close(Duration::from_millis(50)).await;
        let before = bus.last_bookmark().unwrap();
        let after = bus.publish(text("ignored"));
        assert_eq!(before.cursor, after.cursor);
    }

    #[tokio::test]
    async fn subscribe_after_close_replays_then_ends() {
        let bus = bus();
        let first = bus.publish(text("kept"));
        bus.publish(text("kept2"));
        bus.close(Duration::from_millis(50)).await;

        let (mut stream, _id) = bus.subscribe(SubscribeOptions {
            since: Some(Bookmark { cursor: first.cursor - 1, timestamp: first.timestamp }),
            ..Default::default()
        });
        assert!(matches!(stream.next().await, Some(BusItem::Event(_))));
        assert!(matches!(stream.next().await, Some(BusItem::Event(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream() {
        let bus = bus();
        let (mut stream, id) = bus.subscribe(SubscribeOptions::default());
        bus.publish(text("one"));
        bus.unsubscribe(id);
        assert!(matches!(stream.next().await, Some(BusItem::Event(_))));
        assert!(stream.next().await.is_none());
    }
}
