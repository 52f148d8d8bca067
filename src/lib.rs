#![allow(dead_code)]
//! Realtime coordination core for a multi-tenant game backend.
//!
//! This crate is the in-process, single-node engine every realtime feature
//! of such a backend is built on: presence tracking, message routing,
//! authoritative match lifecycle, parties, status broadcast, and user
//! notifications. HTTP/gRPC gateways, the SQL-backed account/leaderboard
//! CRUD, and the embedded scripting runtimes are external collaborators
//! that sit on top of [`RealtimeCore`], not part of it.
//!
//! # Layout
//!
//! - [`presence`] — the tracker: sole authority on which presences exist in
//!   which streams, and sole producer of join/leave events.
//! - [`router`] — pure envelope fan-out to sessions.
//! - [`session`] — owns live client sessions.
//! - [`status`] — follower-based user status broadcast.
//! - [`notification`] — persistent + live per-user notifications.
//! - [`match_registry`] — authoritative match lifecycle, label index, tick
//!   loop.
//! - [`party`] — leader-driven groups that feed a matchmaker.
//! - [`collab`] — small traits the above depend on instead of concrete
//!   collaborator types (storage, matchmaking).
//! - [`config`], [`error`], [`metrics`] — the ambient stack: one threaded
//!   configuration value, one error taxonomy, one metric set.

pub mod collab;
pub mod config;
pub mod error;
pub mod match_registry;
pub mod metrics;
pub mod notification;
pub mod party;
pub mod presence;
pub mod router;
pub mod session;
pub mod status;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;

pub use collab::{Matchmaker, NullMatchmaker, SharedMatchmaker, SharedStreamManager, StreamManager};
pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use match_registry::MatchRegistry;
pub use metrics::CoreMetrics;
pub use notification::{InMemoryNotificationStore, NotificationService, NotificationStore};
pub use party::PartyRegistry;
pub use presence::PresenceTracker;
pub use router::MessageRouter;
pub use session::SessionRegistry;
pub use status::StatusRegistry;
pub use types::*;

/// Everything one node of the realtime core needs, wired together.
///
/// Mirrors the teacher's `Database` — one struct built once from a config
/// value, owning every subsystem as a cloneable handle — except every field
/// here is a coordination component rather than a storage shard.
pub struct RealtimeCore {
    pub config: CoreConfig,
    pub metrics: Arc<CoreMetrics>,
    pub sessions: Arc<SessionRegistry>,
    pub router: Arc<MessageRouter>,
    pub presence: Arc<PresenceTracker>,
    pub status: Arc<StatusRegistry>,
    pub matches: Arc<MatchRegistry>,
    pub parties: Arc<PartyRegistry>,
    pub notifications: Arc<NotificationService>,
}

impl RealtimeCore {
    /// Build a node with an in-memory notification store and a no-op
    /// matchmaker. Real deployments replace both collaborators by
    /// constructing the components directly instead of going through this
    /// convenience constructor.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config
            .validate()
            .map_err(CoreError::Invalid)?;

        let metrics = Arc::new(CoreMetrics::new(&Registry::new()));
        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(MessageRouter::new());

        let presence = PresenceTracker::new(
            config.node.clone(),
            config.tracker,
            metrics.clone(),
            sessions.clone(),
            router.clone(),
        );

        let status = StatusRegistry::new(
            config.node.clone(),
            config.status,
            metrics.clone(),
            sessions.clone(),
            router.clone(),
        );
        presence.set_status_hook(status.clone());

        let matches = MatchRegistry::new(
            config.node.clone(),
            config.match_registry.clone(),
            config.match_handler,
            presence.clone(),
            sessions.clone(),
            router.clone(),
            metrics.clone(),
        );
        presence.set_match_hook(matches.clone());

        let matchmaker: SharedMatchmaker = Arc::new(NullMatchmaker);
        let parties = Arc::new(PartyRegistry::new(
            config.node.clone(),
            config.party,
            presence.clone(),
            sessions.clone(),
            router.clone(),
            matchmaker,
        ));
        presence.set_party_hook(parties.clone());

        let store: Arc<dyn NotificationStore> = Arc::new(InMemoryNotificationStore::new());
        let notifications = Arc::new(NotificationService::new(
            config.node.clone(),
            config.notification,
            store,
            presence.clone(),
            sessions.clone(),
            router.clone(),
        ));

        Ok(Self {
            config,
            metrics,
            sessions,
            router,
            presence,
            status,
            matches,
            parties,
            notifications,
        })
    }

    /// Register a new session and return its id. The caller supplies the
    /// byte sink (the actual socket lives outside this crate).
    pub fn connect(&self, user_id: UserId, format: WireFormat, sink: Arc<dyn session::ByteSink>) -> SessionId {
        let session_id = SessionId::new_v4();
        self.sessions
            .register(Arc::new(session::Session::new(session_id, user_id, format, sink)));
        session_id
    }

    /// Disconnect a session: mark it closed, drop every presence it held,
    /// and stop delivering status updates to it. Mirrors §4.A's contract
    /// that the session registry invokes `UntrackAll` before returning.
    pub fn disconnect(&self, session_id: SessionId) {
        if self.sessions.disconnect(session_id, PresenceReason::Disconnect).is_some() {
            self.presence.untrack_all(session_id, PresenceReason::Disconnect);
            self.status.unfollow_all(session_id);
            self.metrics.sessions_disconnected_total.inc();
        }
    }

    /// Stop the core: tear down every match with `grace`, then the presence
    /// tracker's and status registry's consumer tasks (dropped with this
    /// value, per their `Drop` impls).
    pub async fn shutdown(&self, match_grace: Duration) {
        self.matches.stop(match_grace).await;
        self.presence.shutdown();
    }
}
