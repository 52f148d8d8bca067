//! Collaborator traits the match and party handlers depend on by interface
//! rather than by concrete type (§6). Kept here rather than inline in
//! `match_registry`/`party` so both modules can share them without a
//! circular module dependency.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Presence, PresenceStream, SessionId, UserId};

/// A party or solo user's matchmaker entry: `Add`'s full candidate
/// description (spec §6's `str_props`/`num_props` are the queryable
/// properties a `query` clause can match against).
pub struct MatchmakerAddRequest<'a> {
    pub presences: &'a [Presence],
    pub session_id: SessionId,
    pub party_id: Option<Uuid>,
    pub query: &'a str,
    pub min_count: u32,
    pub max_count: u32,
    pub count_multiple: Option<u32>,
    pub string_properties: HashMap<String, String>,
    pub numeric_properties: HashMap<String, f64>,
}

/// Delegated to by the party handler instead of depending on a matchmaking
/// backend directly.
#[async_trait]
pub trait Matchmaker: Send + Sync {
    async fn add(&self, request: MatchmakerAddRequest<'_>) -> Result<String>;
    async fn remove_party(&self, party_id: Uuid, ticket: &str) -> Result<()>;
    async fn remove_party_all(&self, party_id: Uuid) -> Result<()>;
}

/// A matchmaker that accepts every call as a no-op success. Used by tests
/// and by deployments that have not wired a real matchmaking backend yet.
pub struct NullMatchmaker;

#[async_trait]
impl Matchmaker for NullMatchmaker {
    async fn add(&self, _request: MatchmakerAddRequest<'_>) -> Result<String> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn remove_party(&self, _party_id: Uuid, _ticket: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_party_all(&self, _party_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// `user_join`/`user_leave` against the stream subsystem. The only
/// implementation in this crate delegates to the presence tracker; the
/// trait seam exists so `match_registry`/`party` depend on an interface,
/// not the tracker concretely, per the dependency-inversion guidance.
pub trait StreamManager: Send + Sync {
    fn user_join(
        &self,
        sessions: &crate::session::SessionRegistry,
        session_id: SessionId,
        stream: PresenceStream,
        user_id: UserId,
        meta: crate::types::PresenceMeta,
    ) -> bool;

    fn user_leave(&self, session_id: SessionId, stream: PresenceStream, user_id: UserId);
}

impl StreamManager for crate::presence::PresenceTracker {
    fn user_join(
        &self,
        sessions: &crate::session::SessionRegistry,
        session_id: SessionId,
        stream: PresenceStream,
        user_id: UserId,
        meta: crate::types::PresenceMeta,
    ) -> bool {
        self.track(sessions, session_id, stream, user_id, meta).success
    }

    fn user_leave(&self, session_id: SessionId, stream: PresenceStream, user_id: UserId) {
        self.untrack(session_id, stream, user_id);
    }
}

pub type SharedMatchmaker = Arc<dyn Matchmaker>;
pub type SharedStreamManager = Arc<dyn StreamManager>;
