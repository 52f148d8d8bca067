//! Presence Tracker (§4.C) — the heart of the realtime core.
//!
//! Sole authority on which presences exist in which streams, and sole
//! producer of join/leave events. All mutation happens under one
//! `parking_lot::RwLock` so the two indices (`by_session`, `by_stream`)
//! never disagree (invariant: they form a bijection over the same set of
//! presences).

pub mod event;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::config::TrackerConfig;
use crate::metrics::CoreMetrics;
use crate::router::StreamSessionLookup;
use crate::session::SessionRegistry;
use crate::types::{Presence, PresenceId, PresenceMeta, PresenceReason, PresenceStream, SessionId, StreamMode, UserId};

pub use event::{EventHooks, EventQueue, MatchEventSink, PartyEventSink, PresenceEvent, StatusEventSink};

type StreamUserKey = (PresenceStream, UserId);
type SessionUserKey = (SessionId, UserId);

#[derive(Default)]
struct Indices {
    by_session: HashMap<SessionId, HashMap<StreamUserKey, Presence>>,
    by_stream: HashMap<PresenceStream, HashMap<SessionUserKey, Presence>>,
}

impl Indices {
    fn insert(&mut self, presence: Presence) {
        let sid = presence.presence_id.session_id;
        let stream = presence.stream.clone();
        let uid = presence.user_id;

        self.by_session
            .entry(sid)
            .or_default()
            .insert((stream.clone(), uid), presence.clone());
        self.by_stream
            .entry(stream)
            .or_default()
            .insert((sid, uid), presence);
    }

    fn remove(&mut self, sid: SessionId, stream: &PresenceStream, uid: UserId) -> Option<Presence> {
        let removed = self
            .by_session
            .get_mut(&sid)
            .and_then(|m| m.remove(&(stream.clone(), uid)));
        if self.by_session.get(&sid).is_some_and(|m| m.is_empty()) {
            self.by_session.remove(&sid);
        }
        if let Some(stream_map) = self.by_stream.get_mut(stream) {
            stream_map.remove(&(sid, uid));
            if stream_map.is_empty() {
                self.by_stream.remove(stream);
            }
        }
        removed
    }

    fn get(&self, sid: SessionId, stream: &PresenceStream, uid: UserId) -> Option<&Presence> {
        self.by_session
            .get(&sid)
            .and_then(|m| m.get(&(stream.clone(), uid)))
    }
}

/// Result of a `Track`/`TrackMulti` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackResult {
    pub success: bool,
    pub is_new: bool,
}

pub struct PresenceTracker {
    local_node: String,
    indices: RwLock<Indices>,
    count: AtomicUsize,
    #[allow(dead_code)]
    config: TrackerConfig,
    metrics: Arc<CoreMetrics>,
    queue: Arc<EventQueue>,
    hooks: Arc<RwLock<EventHooks>>,
    #[allow(dead_code)]
    consumer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel: Arc<tokio::sync::Notify>,
}

impl PresenceTracker {
    /// Construct the tracker and spawn its single event-consumer task. The
    /// consumer is spawned after the `Arc` exists because it needs the
    /// tracker itself as its [`StreamSessionLookup`].
    pub fn new(
        local_node: impl Into<String>,
        config: TrackerConfig,
        metrics: Arc<CoreMetrics>,
        sessions: Arc<SessionRegistry>,
        router: Arc<crate::router::MessageRouter>,
    ) -> Arc<Self> {
        let queue = Arc::new(EventQueue::new(config.event_queue_size));
        let hooks = Arc::new(RwLock::new(EventHooks::default()));
        let local_node = local_node.into();
        let cancel = Arc::new(tokio::sync::Notify::new());

        let tracker = Arc::new(Self {
            local_node: local_node.clone(),
            indices: RwLock::new(Indices::default()),
            count: AtomicUsize::new(0),
            config,
            metrics: metrics.clone(),
            queue: queue.clone(),
            hooks: hooks.clone(),
            consumer: std::sync::Mutex::new(None),
            cancel: cancel.clone(),
        });

        let lookup: Arc<dyn StreamSessionLookup + Send + Sync> = tracker.clone();
        let consumer = event::spawn_consumer(
            queue, local_node, sessions, router, lookup, hooks, metrics, cancel,
        );
        *tracker.consumer.lock().unwrap() = Some(consumer);

        tracker
    }

    /// Stop the event-consumer task. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.notify_one();
    }

    pub fn set_status_hook(&self, hook: Arc<dyn StatusEventSink>) {
        self.hooks.write().status = Some(hook);
    }

    pub fn set_match_hook(&self, hook: Arc<dyn MatchEventSink>) {
        self.hooks.write().matches = Some(hook);
    }

    pub fn set_party_hook(&self, hook: Arc<dyn PartyEventSink>) {
        self.hooks.write().parties = Some(hook);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn enqueue(&self, joins: Vec<Presence>, leaves: Vec<Presence>) {
        if joins.is_empty() && leaves.is_empty() {
            return;
        }
        let event = PresenceEvent {
            joins,
            leaves,
            queued_at: std::time::Instant::now(),
        };
        let dropped = self.queue.push(event);
        if dropped > 0 {
            self.metrics
                .presence_events_dropped_total
                .inc_by(dropped as u64);
            warn!(dropped, "presence event queue full, dropped entire backlog");
        }
    }

    // ---- Track family -------------------------------------------------

    /// Track a single presence. Returns `(success, is_new)` per §4.C.
    pub fn track(
        &self,
        sessions: &SessionRegistry,
        session_id: SessionId,
        stream: PresenceStream,
        user_id: UserId,
        mut meta: PresenceMeta,
    ) -> TrackResult {
        let Some(session) = sessions.get(session_id) else {
            return TrackResult {
                success: false,
                is_new: false,
            };
        };
        let (_guard, closed) = session.lock_for_mutation();
        if closed {
            return TrackResult {
                success: false,
                is_new: false,
            };
        }

        meta.reason = PresenceReason::Join;
        let presence_id = PresenceId {
            node: self.local_node.clone(),
            session_id,
        };

        let mut indices = self.indices.write();
        let is_new = indices.get(session_id, &stream, user_id).is_none();
        let presence = Presence {
            presence_id,
            stream: stream.clone(),
            user_id,
            meta,
        };
        let hidden = presence.meta.hidden;
        if is_new {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        indices.insert(presence.clone());
        drop(indices);

        if is_new && !hidden {
            self.enqueue(vec![presence], vec![]);
        }

        TrackResult {
            success: true,
            is_new,
        }
    }

    /// Batch `Track`: one lock acquisition, one event for every non-hidden
    /// join in the batch.
    pub fn track_multi(
        &self,
        sessions: &SessionRegistry,
        session_id: SessionId,
        ops: Vec<(PresenceStream, UserId, PresenceMeta)>,
    ) -> Vec<TrackResult> {
        let Some(session) = sessions.get(session_id) else {
            return vec![
                TrackResult {
                    success: false,
                    is_new: false
                };
                ops.len()
            ];
        };
        let (_guard, closed) = session.lock_for_mutation();
        if closed {
            return vec![
                TrackResult {
                    success: false,
                    is_new: false
                };
                ops.len()
            ];
        }

        let mut results = Vec::with_capacity(ops.len());
        let mut joins = Vec::new();
        let mut indices = self.indices.write();
        for (stream, user_id, mut meta) in ops {
            meta.reason = PresenceReason::Join;
            let is_new = indices.get(session_id, &stream, user_id).is_none();
            let presence = Presence {
                presence_id: PresenceId {
                    node: self.local_node.clone(),
                    session_id,
                },
                stream,
                user_id,
                meta,
            };
            if is_new {
                self.count.fetch_add(1, Ordering::AcqRel);
            }
            let hidden = presence.meta.hidden;
            indices.insert(presence.clone());
            if is_new && !hidden {
                joins.push(presence);
            }
            results.push(TrackResult {
                success: true,
                is_new,
            });
        }
        drop(indices);
        self.enqueue(joins, vec![]);
        results
    }

    // ---- Untrack family -------------------------------------------------

    pub fn untrack(&self, session_id: SessionId, stream: PresenceStream, user_id: UserId) {
        let mut indices = self.indices.write();
        let removed = indices.remove(session_id, &stream, user_id);
        drop(indices);
        if let Some(mut presence) = removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
            if !presence.meta.hidden {
                presence.meta.reason = PresenceReason::Leave;
                self.enqueue(vec![], vec![presence]);
            }
        }
    }

    pub fn untrack_multi(&self, session_id: SessionId, streams: Vec<(PresenceStream, UserId)>) {
        let mut leaves = Vec::new();
        let mut indices = self.indices.write();
        for (stream, user_id) in streams {
            if let Some(mut presence) = indices.remove(session_id, &stream, user_id) {
                self.count.fetch_sub(1, Ordering::AcqRel);
                if !presence.meta.hidden {
                    presence.meta.reason = PresenceReason::Leave;
                    leaves.push(presence);
                }
            }
        }
        drop(indices);
        self.enqueue(vec![], leaves);
    }

    /// Remove every presence for a session (disconnect path). Every
    /// removed presence's `reason` is overridden to `reason`, regardless
    /// of how it got there.
    pub fn untrack_all(&self, session_id: SessionId, reason: PresenceReason) {
        let mut indices = self.indices.write();
        let Some(removed) = indices.by_session.remove(&session_id) else {
            return;
        };
        let mut leaves = Vec::new();
        for (_, mut presence) in removed {
            if let Some(stream_map) = indices.by_stream.get_mut(&presence.stream) {
                stream_map.remove(&(session_id, presence.user_id));
                if stream_map.is_empty() {
                    indices.by_stream.remove(&presence.stream);
                }
            }
            self.count.fetch_sub(1, Ordering::AcqRel);
            if !presence.meta.hidden {
                presence.meta.reason = reason;
                leaves.push(presence);
            }
        }
        drop(indices);
        self.enqueue(vec![], leaves);
    }

    /// Upsert. Emits a leave for the previous non-hidden presence (if any)
    /// and a join for the new non-hidden presence, both tagged `Update`,
    /// in one event — unless the content is unchanged, in which case
    /// nothing is emitted even though the record is still refreshed.
    pub fn update(
        &self,
        session_id: SessionId,
        stream: PresenceStream,
        user_id: UserId,
        mut meta: PresenceMeta,
    ) {
        meta.reason = PresenceReason::Update;
        let new_presence = Presence {
            presence_id: PresenceId {
                node: self.local_node.clone(),
                session_id,
            },
            stream: stream.clone(),
            user_id,
            meta,
        };

        let mut indices = self.indices.write();
        let previous = indices.get(session_id, &stream, user_id).cloned();
        let unchanged = previous
            .as_ref()
            .is_some_and(|p| p.meta.content_eq(&new_presence.meta));
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        indices.insert(new_presence.clone());
        drop(indices);

        if unchanged {
            return;
        }

        let mut leaves = Vec::new();
        if let Some(mut prev) = previous {
            if !prev.meta.hidden {
                prev.meta.reason = PresenceReason::Update;
                leaves.push(prev);
            }
        }
        let mut joins = Vec::new();
        if !new_presence.meta.hidden {
            joins.push(new_presence);
        }
        self.enqueue(joins, leaves);
    }

    /// Whole-stream teardown: drops every presence in `stream` without
    /// emitting any events, per the explicit contract in §4.C.
    pub fn untrack_by_stream(&self, stream: &PresenceStream) {
        let mut indices = self.indices.write();
        if let Some(removed) = indices.by_stream.remove(stream) {
            for (sid, presence) in removed {
                self.count.fetch_sub(1, Ordering::AcqRel);
                if let Some(session_map) = indices.by_session.get_mut(&sid.0) {
                    session_map.remove(&(stream.clone(), presence.user_id));
                    if session_map.is_empty() {
                        indices.by_session.remove(&sid.0);
                    }
                }
            }
        }
    }

    /// Drop a session's presences in any of `modes`, except `skip_stream`.
    /// Materializes the target key set before mutating, per design note 3
    /// (iterating a map while mutating it is unsound here).
    pub fn untrack_local_by_modes(
        &self,
        session_id: SessionId,
        modes: &[StreamMode],
        skip_stream: Option<&PresenceStream>,
    ) {
        let mut indices = self.indices.write();
        let Some(session_map) = indices.by_session.get(&session_id) else {
            return;
        };
        let targets: Vec<(PresenceStream, UserId)> = session_map
            .keys()
            .filter(|(stream, _)| modes.contains(&stream.mode))
            .filter(|(stream, _)| Some(stream) != skip_stream)
            .cloned()
            .collect();

        let mut leaves = Vec::new();
        for (stream, user_id) in targets {
            if let Some(mut presence) = indices.remove(session_id, &stream, user_id) {
                self.count.fetch_sub(1, Ordering::AcqRel);
                if !presence.meta.hidden {
                    presence.meta.reason = PresenceReason::Leave;
                    leaves.push(presence);
                }
            }
        }
        drop(indices);
        self.enqueue(vec![], leaves);
    }

    // ---- Read-only queries ----------------------------------------------

    pub fn count_by_stream(&self, stream: &PresenceStream) -> usize {
        self.indices
            .read()
            .by_stream
            .get(stream)
            .map_or(0, |m| m.len())
    }

    /// Count presences in a stream, optionally filtering to a specific
    /// subset relevant to `ListMatches`' `min_size`/`max_size` step.
    pub fn count_by_stream_mode_filter(&self, mode: StreamMode) -> HashMap<uuid::Uuid, usize> {
        let indices = self.indices.read();
        let mut counts = HashMap::new();
        for (stream, members) in indices.by_stream.iter() {
            if stream.mode == mode {
                *counts.entry(stream.subject).or_insert(0) += members.len();
            }
        }
        counts
    }

    pub fn list_by_stream(&self, stream: &PresenceStream, include_hidden: bool, include_not_hidden: bool) -> Vec<Presence> {
        self.indices
            .read()
            .by_stream
            .get(stream)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|p| (p.meta.hidden && include_hidden) || (!p.meta.hidden && include_not_hidden))
            .cloned()
            .collect()
    }

    pub fn list_local_session_ids_by_stream(&self, stream: &PresenceStream) -> Vec<SessionId> {
        self.indices
            .read()
            .by_stream
            .get(stream)
            .into_iter()
            .flat_map(|m| m.keys())
            .map(|(sid, _)| *sid)
            .collect()
    }

    pub fn list_presence_ids_by_stream(&self, stream: &PresenceStream) -> Vec<PresenceId> {
        self.indices
            .read()
            .by_stream
            .get(stream)
            .into_iter()
            .flat_map(|m| m.values())
            .map(|p| p.presence_id.clone())
            .collect()
    }

    pub fn list_nodes_for_stream(&self, stream: &PresenceStream) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .indices
            .read()
            .by_stream
            .get(stream)
            .into_iter()
            .flat_map(|m| m.values())
            .map(|p| p.presence_id.node.clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn stream_exists(&self, stream: &PresenceStream) -> bool {
        self.indices.read().by_stream.contains_key(stream)
    }

    pub fn get_local(&self, session_id: SessionId, stream: &PresenceStream, user_id: UserId) -> Option<PresenceMeta> {
        self.indices
            .read()
            .get(session_id, stream, user_id)
            .map(|p| p.meta.clone())
    }
}

impl StreamSessionLookup for PresenceTracker {
    fn local_sessions_for_stream(
        &self,
        stream: &PresenceStream,
    ) -> Vec<(SessionId, crate::types::WireFormat)> {
        self.indices
            .read()
            .by_stream
            .get(stream)
            .into_iter()
            .flat_map(|m| m.values())
            .filter(|p| p.presence_id.node == self.local_node)
            .map(|p| (p.presence_id.session_id, p.meta.format))
            .collect()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.cancel.notify_one();
    }
}
