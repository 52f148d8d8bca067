//! Status Registry (§4.D) — follower-based user status broadcast.
//!
//! Structurally a smaller cousin of [`crate::presence::PresenceTracker`]:
//! one write lock guarding two index maps, one bounded queue, one consumer
//! task. It does not itself track presence — the presence tracker calls
//! into it via [`crate::presence::event::StatusEventSink`] for joins/leaves
//! on `Status` streams, and callers call `queue` directly for status-text
//! changes on an already-tracked presence.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StatusConfig;
use crate::metrics::CoreMetrics;
use crate::presence::event::StatusEventSink;
use crate::router::{Envelope, MessageRouter};
use crate::session::SessionRegistry;
use crate::types::{Presence, PresenceId, SessionId};
use std::sync::Arc;

/// One status change queued for delivery to `user_id`'s followers.
struct StatusEvent {
    user_id: Uuid,
    joins: Vec<Presence>,
    leaves: Vec<Presence>,
}

/// Bounded queue with the same producer-drains-on-overflow policy as the
/// presence tracker's event queue, for the same reason: only the producer
/// can see the full backlog and `tokio::sync::mpsc::Sender` offers no way
/// to drain it.
struct StatusQueue {
    inner: Mutex<VecDeque<StatusEvent>>,
    capacity: usize,
    notify: tokio::sync::Notify,
}

impl StatusQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            notify: tokio::sync::Notify::new(),
        }
    }

    fn push(&self, event: StatusEvent) -> usize {
        let mut dropped = 0;
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                dropped = queue.len() + 1;
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

    async fn pop(&self) -> StatusEvent {
        loop {
            if let Some(event) = self.inner.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// `by_session`: sessions following a given user. `by_user`: the set of
/// users a given session follows. Kept as a bijection under one lock, same
/// shape as the presence tracker's dual index.
#[derive(Default)]
struct Follows {
    followers_of: HashMap<Uuid, HashSet<SessionId>>,
    followed_by: HashMap<SessionId, HashSet<Uuid>>,
}

impl Follows {
    fn follow(&mut self, session_id: SessionId, user_id: Uuid) -> bool {
        let inserted = self.followers_of.entry(user_id).or_default().insert(session_id);
        self.followed_by.entry(session_id).or_default().insert(user_id);
        inserted
    }

    fn unfollow(&mut self, session_id: SessionId, user_id: Uuid) {
        if let Some(set) = self.followers_of.get_mut(&user_id) {
            set.remove(&session_id);
            if set.is_empty() {
                self.followers_of.remove(&user_id);
            }
        }
        if let Some(set) = self.followed_by.get_mut(&session_id) {
            set.remove(&user_id);
            if set.is_empty() {
                self.followed_by.remove(&session_id);
            }
        }
    }

    fn unfollow_all(&mut self, session_id: SessionId) {
        if let Some(followed) = self.followed_by.remove(&session_id) {
            for user_id in followed {
                if let Some(set) = self.followers_of.get_mut(&user_id) {
                    set.remove(&session_id);
                    if set.is_empty() {
                        self.followers_of.remove(&user_id);
                    }
                }
            }
        }
    }

    fn followers_of(&self, user_id: Uuid) -> Vec<SessionId> {
        self.followers_of
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

pub struct StatusRegistry {
    follows: RwLock<Follows>,
    queue: Arc<StatusQueue>,
    cancel: Arc<tokio::sync::Notify>,
    consumer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    metrics: Arc<CoreMetrics>,
}

impl StatusRegistry {
    pub fn new(
        local_node: impl Into<String>,
        config: StatusConfig,
        metrics: Arc<CoreMetrics>,
        sessions: Arc<SessionRegistry>,
        router: Arc<MessageRouter>,
    ) -> Arc<Self> {
        let queue = Arc::new(StatusQueue::new(config.event_queue_size));
        let cancel = Arc::new(tokio::sync::Notify::new());
        let registry = Arc::new(Self {
            follows: RwLock::new(Follows::default()),
            queue: queue.clone(),
            cancel: cancel.clone(),
            consumer: std::sync::Mutex::new(None),
            metrics,
        });

        let local_node = local_node.into();
        let weak = Arc::downgrade(&registry);
        let consumer = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = queue.pop() => event,
                    _ = cancel.notified() => {
                        debug!("status event consumer cancelled");
                        return;
                    }
                };
                let Some(registry) = weak.upgrade() else {
                    return;
                };
                registry.dispatch(&local_node, &sessions, &router, event);
            }
        });
        *registry.consumer.lock().unwrap() = Some(consumer);
        registry
    }

    fn dispatch(
        &self,
        local_node: &str,
        sessions: &SessionRegistry,
        router: &MessageRouter,
        event: StatusEvent,
    ) {
        let followers = self.follows.read().followers_of(event.user_id);
        if followers.is_empty() {
            return;
        }
        let ids: Vec<(PresenceId, crate::types::WireFormat)> = followers
            .into_iter()
            .filter_map(|session_id| sessions.get(session_id).map(|s| (session_id, s)))
            .map(|(session_id, session)| {
                (
                    PresenceId {
                        node: local_node.to_string(),
                        session_id,
                    },
                    session.format,
                )
            })
            .collect();
        let envelope = Envelope::StatusPresenceEvent {
            user_id: event.user_id,
            joins: event.joins.iter().map(|p| p.presence_id.clone()).collect(),
            leaves: event.leaves.iter().map(|p| p.presence_id.clone()).collect(),
        };
        router.send_to_presence_ids(sessions, local_node, &ids, &envelope, true);
    }

    /// §4.D `Follow`. Returns whether the follow was newly established.
    pub fn follow(&self, session_id: SessionId, user_id: Uuid) -> bool {
        self.follows.write().follow(session_id, user_id)
    }

    /// §4.D `Unfollow`.
    pub fn unfollow(&self, session_id: SessionId, user_id: Uuid) {
        self.follows.write().unfollow(session_id, user_id);
    }

    /// §4.D `UnfollowAll`, called from session disconnect.
    pub fn unfollow_all(&self, session_id: SessionId) {
        self.follows.write().unfollow_all(session_id);
    }

    /// §4.D `IsOnline`.
    pub fn is_online(&self, user_id: Uuid) -> bool {
        !self.follows.read().followers_of(user_id).is_empty()
    }

    /// §4.D `FillOnline` — of the given users, which have at least one
    /// follower (i.e. at least one live `Status` presence).
    pub fn fill_online(&self, user_ids: &[Uuid]) -> HashSet<Uuid> {
        let follows = self.follows.read();
        user_ids
            .iter()
            .copied()
            .filter(|uid| !follows.followers_of(*uid).is_empty())
            .collect()
    }

    /// §4.D `Queue`: push a status change for delivery, outside the
    /// presence-tracker event path (e.g. an explicit status-text update).
    pub fn queue(&self, user_id: Uuid, joins: Vec<Presence>, leaves: Vec<Presence>) {
        if joins.is_empty() && leaves.is_empty() {
            return;
        }
        let dropped = self.queue.push(StatusEvent { user_id, joins, leaves });
        if dropped > 0 {
            self.metrics.presence_events_dropped_total.inc_by(dropped as u64);
            warn!(dropped, "status event queue full, dropped entire backlog");
        }
    }
}

impl StatusEventSink for StatusRegistry {
    fn queue(&self, user_id: Uuid, joins: Vec<Presence>, leaves: Vec<Presence>) {
        StatusRegistry::queue(self, user_id, joins, leaves)
    }
}

impl Drop for StatusRegistry {
    fn drop(&mut self) {
        self.cancel.notify_one();
    }
}
