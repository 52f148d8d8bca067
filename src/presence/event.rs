//! The presence event queue and its consumer task.
//!
//! Exactly one consumer task drains the bounded channel the tracker writes
//! to; every downstream hook (status registry, match/party handlers, the
//! router) is reached only from that task, which is what gives the core
//! its per-stream ordering guarantee.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::metrics::CoreMetrics;
use crate::router::{Envelope, MessageRouter};
use crate::session::SessionRegistry;
use crate::types::{Presence, PresenceId, PresenceStream, StreamMode};
use std::sync::Arc;

/// One batch of joins/leaves produced by a single tracker operation
/// (`Track`, `TrackMulti`, `Untrack`, `UntrackMulti`, `UntrackAll`,
/// `Update`, `UntrackLocalByModes`). Kept together so the consumer can
/// preserve per-operation atomicity when it fans the batch out.
pub struct PresenceEvent {
    pub joins: Vec<Presence>,
    pub leaves: Vec<Presence>,
    pub queued_at: Instant,
}

/// A bounded queue of presence events with a producer-side overflow policy:
/// on overflow, the whole queue is drained and the new batch is dropped too
/// (§9 Design Notes: losing presence accuracy briefly beats blocking every
/// session-mutating call in the process). Built directly on a mutex and a
/// `Notify` rather than `tokio::sync::mpsc`, because the standard channel
/// gives producers no way to drain on overflow — only the consumer side can
/// `recv`.
pub struct EventQueue {
    inner: Mutex<VecDeque<PresenceEvent>>,
    capacity: usize,
    notify: tokio::sync::Notify,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Returns the number of events dropped (0 on the common path).
    pub fn push(&self, event: PresenceEvent) -> usize {
        let mut dropped = 0;
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                dropped = queue.len() + 1; // the whole backlog, plus this batch
                queue.clear();
            } else {
                queue.push_back(event);
            }
        }
        if dropped == 0 {
            self.notify.notify_one();
        }
        dropped
    }

    async fn pop(&self) -> PresenceEvent {
        loop {
            if let Some(event) = self.inner.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// Called for joins/leaves on `Status` streams.
pub trait StatusEventSink: Send + Sync {
    fn queue(&self, user_id: Uuid, joins: Vec<Presence>, leaves: Vec<Presence>);
}

/// Called for joins/leaves on `MatchAuthoritative` streams owned by this
/// node.
pub trait MatchEventSink: Send + Sync {
    fn on_match_join(&self, match_id: Uuid, joins: Vec<Presence>);
    fn on_match_leave(&self, match_id: Uuid, leaves: Vec<Presence>);
}

/// Called for joins/leaves on `Party` streams owned by this node.
pub trait PartyEventSink: Send + Sync {
    fn on_party_join(&self, party_id: Uuid, joins: Vec<Presence>);
    fn on_party_leave(&self, party_id: Uuid, leaves: Vec<Presence>);
}

/// Collaborators the consumer task dispatches into. Optional because the
/// tracker can be constructed (and started) before the components that
/// depend on it.
#[derive(Default, Clone)]
pub struct EventHooks {
    pub status: Option<Arc<dyn StatusEventSink>>,
    pub matches: Option<Arc<dyn MatchEventSink>>,
    pub parties: Option<Arc<dyn PartyEventSink>>,
}

fn presence_id(p: &Presence) -> PresenceId {
    p.presence_id.clone()
}

/// Group a batch's joins/leaves by stream, preserving enqueue order within
/// each stream (the only ordering guarantee the spec makes). Batches are
/// small (bounded by one tracker operation), so a linear scan to find each
/// stream's slot is cheaper than pulling in an ordered-map dependency.
fn group_by_stream(
    joins: Vec<Presence>,
    leaves: Vec<Presence>,
) -> Vec<(PresenceStream, (Vec<Presence>, Vec<Presence>))> {
    fn slot_for(
        grouped: &mut Vec<(PresenceStream, (Vec<Presence>, Vec<Presence>))>,
        stream: &PresenceStream,
    ) -> usize {
        if let Some(idx) = grouped.iter().position(|(s, _)| s == stream) {
            idx
        } else {
            grouped.push((stream.clone(), (Vec::new(), Vec::new())));
            grouped.len() - 1
        }
    }

    let mut grouped: Vec<(PresenceStream, (Vec<Presence>, Vec<Presence>))> = Vec::new();
    for p in joins {
        let idx = slot_for(&mut grouped, &p.stream);
        grouped[idx].1 .0.push(p);
    }
    for p in leaves {
        let idx = slot_for(&mut grouped, &p.stream);
        grouped[idx].1 .1.push(p);
    }
    grouped
}

/// Process a single dequeued batch. Split out from the task loop so unit
/// tests can drive it without spinning up a tokio runtime task.
pub fn dispatch_event(
    event: PresenceEvent,
    local_node: &str,
    sessions: &SessionRegistry,
    router: &MessageRouter,
    lookup: &dyn crate::router::StreamSessionLookup,
    hooks: &EventHooks,
    metrics: &CoreMetrics,
) {
    metrics
        .event_dispatch_latency
        .observe(event.queued_at.elapsed().as_secs_f64());

    for (stream, (joins, leaves)) in group_by_stream(event.joins, event.leaves) {
        match stream.mode {
            StreamMode::Status => {
                if let Some(status) = &hooks.status {
                    status.queue(stream.subject, joins, leaves);
                }
            }
            StreamMode::MatchAuthoritative if stream.label == local_node => {
                if let Some(matches) = &hooks.matches {
                    if !joins.is_empty() {
                        matches.on_match_join(stream.subject, joins.clone());
                    }
                    if !leaves.is_empty() {
                        matches.on_match_leave(stream.subject, leaves.clone());
                    }
                }
                router.send_to_stream(
                    sessions,
                    lookup,
                    &stream,
                    &Envelope::MatchPresenceEvent {
                        match_id: format!("{}.{}", stream.subject, stream.label),
                        joins: joins.iter().map(presence_id).collect(),
                        leaves: leaves.iter().map(presence_id).collect(),
                    },
                    true,
                );
            }
            StreamMode::Party => {
                if let Some(parties) = &hooks.parties {
                    if !joins.is_empty() {
                        parties.on_party_join(stream.subject, joins);
                    }
                    if !leaves.is_empty() {
                        parties.on_party_leave(stream.subject, leaves);
                    }
                }
            }
            StreamMode::Channel => router.send_to_stream(
                sessions,
                lookup,
                &stream,
                &Envelope::ChannelPresenceEvent {
                    stream: stream.clone(),
                    joins: joins.iter().map(presence_id).collect(),
                    leaves: leaves.iter().map(presence_id).collect(),
                },
                true,
            ),
            StreamMode::MatchRelayed
            | StreamMode::Group
            | StreamMode::Dm
            | StreamMode::Notifications
            | StreamMode::MatchAuthoritative => router.send_to_stream(
                sessions,
                lookup,
                &stream,
                &Envelope::StreamPresenceEvent {
                    stream: stream.clone(),
                    joins: joins.iter().map(presence_id).collect(),
                    leaves: leaves.iter().map(presence_id).collect(),
                },
                true,
            ),
        }
    }
}

/// Spawn the single consumer task for the tracker's event queue. Cancelled
/// by dropping the returned handle's owning `Arc<EventQueue>` chain during
/// tracker teardown (there is no separate shutdown signal: once nothing
/// else holds the queue, the task has nothing left to `pop`).
pub fn spawn_consumer(
    queue: Arc<EventQueue>,
    local_node: String,
    sessions: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    lookup: Arc<dyn crate::router::StreamSessionLookup + Send + Sync>,
    hooks: Arc<parking_lot::RwLock<EventHooks>>,
    metrics: Arc<CoreMetrics>,
    cancel: Arc<tokio::sync::Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = queue.pop() => event,
                _ = cancel.notified() => {
                    debug!("presence event consumer cancelled");
                    return;
                }
            };
            debug!(
                joins = event.joins.len(),
                leaves = event.leaves.len(),
                "dispatching presence event batch"
            );
            let hooks_snapshot = hooks.read().clone();
            dispatch_event(
                event,
                &local_node,
                &sessions,
                &router,
                lookup.as_ref(),
                &hooks_snapshot,
                &metrics,
            );
        }
    })
}
