//! Party Handler (§4.H) — small, stateful groups feeding a matchmaker.
//!
//! Every party owns a `Party`-mode presence stream; membership there is the
//! presence tracker's job. This module owns the *ordering* and *leader*
//! state the tracker's unordered indices can't express (Y1–Y3), and is
//! registered as the tracker's [`PartyEventSink`] so joins/leaves on that
//! stream keep the ordered list in sync.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::collab::{SharedMatchmaker, SharedStreamManager};
use crate::config::PartyConfig;
use crate::error::{CoreError, Result};
use crate::presence::event::PartyEventSink;
use crate::presence::PresenceTracker;
use crate::router::{Envelope, MessageRouter};
use crate::session::SessionRegistry;
use crate::types::{Presence, PresenceId, PresenceMeta, PresenceStream, SessionId, StreamMode, UserId};

/// One member of a party, in join order.
#[derive(Debug, Clone)]
pub struct PartyMember {
    pub presence_id: PresenceId,
    pub user_id: UserId,
    pub username: String,
}

impl From<&Presence> for PartyMember {
    fn from(p: &Presence) -> Self {
        Self {
            presence_id: p.presence_id.clone(),
            user_id: p.user_id,
            username: p.meta.username.clone(),
        }
    }
}

/// A pending request to join a closed party.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub presence_id: PresenceId,
    pub user_id: UserId,
    pub username: String,
}

/// Wire snapshot of a party's full state, sent to a presence on join/accept.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PartySnapshot {
    pub party_id: Uuid,
    pub open: bool,
    pub max_size: usize,
    pub leader: Option<PresenceId>,
    pub members: Vec<PresenceId>,
}

struct PartyState {
    members: Vec<PartyMember>,
    join_requests: Vec<JoinRequest>,
    leader: Option<PartyMember>,
    matchmaker_ticket: Option<String>,
}

impl PartyState {
    fn snapshot(&self, party_id: Uuid, open: bool, max_size: usize) -> PartySnapshot {
        PartySnapshot {
            party_id,
            open,
            max_size,
            leader: self.leader.as_ref().map(|m| m.presence_id.clone()),
            members: self.members.iter().map(|m| m.presence_id.clone()).collect(),
        }
    }

    /// Y3: elect the oldest remaining member (list index order) as leader.
    fn elect_leader(&mut self) {
        self.leader = self.members.first().cloned();
    }
}

/// A single party's ordered state plus the stream it owns.
pub struct PartyHandler {
    pub id: Uuid,
    pub node: String,
    pub open: AtomicBool,
    pub max_size: usize,
    state: RwLock<PartyState>,
    stopped: AtomicBool,
}

impl PartyHandler {
    fn stream(&self) -> PresenceStream {
        PresenceStream::new(StreamMode::Party, self.id)
    }

    fn is_leader(&self, presence_id: &PresenceId) -> bool {
        self.state
            .read()
            .leader
            .as_ref()
            .is_some_and(|l| &l.presence_id == presence_id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CoreError::Closed(format!("party {} is closed", self.id)));
        }
        Ok(())
    }
}

/// Owns every live party and dispatches presence events from the tracker
/// into the right handler.
pub struct PartyRegistry {
    local_node: String,
    config: PartyConfig,
    parties: dashmap::DashMap<Uuid, Arc<PartyHandler>>,
    /// Read-side queries and the `Party`-stream routing lookup go straight
    /// to the tracker; joins/leaves go through `stream_manager` instead,
    /// per the dependency-inversion guidance (§9).
    tracker: Arc<PresenceTracker>,
    stream_manager: SharedStreamManager,
    sessions: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    matchmaker: SharedMatchmaker,
}

impl PartyRegistry {
    pub fn new(
        local_node: impl Into<String>,
        config: PartyConfig,
        tracker: Arc<PresenceTracker>,
        sessions: Arc<SessionRegistry>,
        router: Arc<MessageRouter>,
        matchmaker: SharedMatchmaker,
    ) -> Self {
        let stream_manager: SharedStreamManager = tracker.clone();
        Self {
            local_node: local_node.into(),
            config,
            parties: dashmap::DashMap::new(),
            tracker,
            stream_manager,
            sessions,
            router,
            matchmaker,
        }
    }

    fn get(&self, party_id: Uuid) -> Result<Arc<PartyHandler>> {
        self.parties
            .get(&party_id)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::NotFound(format!("party {party_id} not found")))
    }

    /// Create a party with `creator` as its sole member and leader.
    pub fn create(
        &self,
        open: bool,
        max_size: Option<usize>,
        creator_session: SessionId,
        creator_user: UserId,
        creator_username: impl Into<String>,
    ) -> Result<Uuid> {
        let party_id = Uuid::new_v4();
        let max_size = max_size.unwrap_or(self.config.default_max_size);
        let handler = Arc::new(PartyHandler {
            id: party_id,
            node: self.local_node.clone(),
            open: AtomicBool::new(open),
            max_size,
            state: RwLock::new(PartyState {
                members: Vec::new(),
                join_requests: Vec::new(),
                leader: None,
                matchmaker_ticket: None,
            }),
            stopped: AtomicBool::new(false),
        });
        self.parties.insert(party_id, handler.clone());

        let stream = handler.stream();
        let meta = PresenceMeta::new(crate::types::WireFormat::Json, creator_username);
        self.tracker
            .track(&self.sessions, creator_session, stream, creator_user, meta);
        info!(party_id = %party_id, "party created");
        Ok(party_id)
    }

    /// §4.H `JoinRequest`: joins immediately when the party is open;
    /// otherwise queues for leader approval (Y2). Returns whether the
    /// caller joined immediately.
    pub fn join_request(
        &self,
        party_id: Uuid,
        session_id: SessionId,
        user_id: UserId,
        meta: PresenceMeta,
    ) -> Result<bool> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        let open = handler.open.load(Ordering::Acquire);
        if handler.state.read().members.len() >= handler.max_size {
            return Err(CoreError::Full(format!("party {party_id} is full")));
        }
        if open {
            self.join(party_id, session_id, user_id, meta)?;
            return Ok(true);
        }
        let presence_id = PresenceId {
            node: self.local_node.clone(),
            session_id,
        };
        let mut state = handler.state.write();
        if state.join_requests.len() >= handler.max_size {
            return Err(CoreError::Full(format!("party {party_id} join queue is full")));
        }
        state.join_requests.push(JoinRequest {
            presence_id: presence_id.clone(),
            user_id,
            username: meta.username.clone(),
        });
        drop(state);
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::PartyJoinRequest {
                party_id: party_id.to_string(),
                presence: presence_id,
            },
            true,
        );
        Ok(false)
    }

    /// §4.H `Join`: actually add a presence to the stream and the ordered
    /// member list (called directly for open parties, or by `Accept`).
    pub fn join(&self, party_id: Uuid, session_id: SessionId, user_id: UserId, meta: PresenceMeta) -> Result<()> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        {
            let state = handler.state.read();
            if state.members.len() >= handler.max_size {
                return Err(CoreError::Full(format!("party {party_id} is full")));
            }
        }
        let stream = handler.stream();
        let result = self.tracker.track(&self.sessions, session_id, stream, user_id, meta);
        if !result.success {
            return Err(CoreError::Invalid("session is closed".to_string()));
        }
        Ok(())
    }

    /// §4.H `Leave`.
    pub fn leave(&self, party_id: Uuid, session_id: SessionId, user_id: UserId) -> Result<()> {
        let handler = self.get(party_id)?;
        self.tracker.untrack(session_id, handler.stream(), user_id);
        Ok(())
    }

    /// §4.H `Promote`: leader hands off leadership to another member.
    pub fn promote(&self, party_id: Uuid, by: &PresenceId, target: &PresenceId) -> Result<()> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        if !handler.is_leader(by) {
            return Err(CoreError::PermissionDenied("only the party leader can promote".to_string()));
        }
        let mut state = handler.state.write();
        let Some(member) = state.members.iter().find(|m| &m.presence_id == target).cloned() else {
            return Err(CoreError::NotFound("target is not a party member".to_string()));
        };
        state.leader = Some(member.clone());
        drop(state);
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::PartyLeader {
                party_id: party_id.to_string(),
                presence: member.presence_id,
            },
            true,
        );
        Ok(())
    }

    /// §4.H `Accept`: leader accepts a pending join request.
    pub fn accept(
        &self,
        party_id: Uuid,
        by: &PresenceId,
        target: &PresenceId,
        session_id: SessionId,
        meta: PresenceMeta,
    ) -> Result<()> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        if !handler.is_leader(by) {
            return Err(CoreError::PermissionDenied("only the party leader can accept".to_string()));
        }
        let user_id;
        {
            let mut state = handler.state.write();
            let Some(pos) = state.join_requests.iter().position(|r| &r.presence_id == target) else {
                return Err(CoreError::NotFound("no such join request".to_string()));
            };
            let request = state.join_requests.remove(pos);
            user_id = request.user_id;
        }
        self.join(party_id, session_id, user_id, meta)
    }

    /// §4.H `Remove`: leader kicks a member, or a member removes a pending
    /// join request.
    pub fn remove(&self, party_id: Uuid, by: &PresenceId, target: &PresenceId) -> Result<()> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        let is_pending_request = handler.state.read().join_requests.iter().any(|r| &r.presence_id == target);
        if is_pending_request {
            handler.state.write().join_requests.retain(|r| &r.presence_id != target);
            return Ok(());
        }
        if by == target {
            return Err(CoreError::PermissionDenied("use Leave to remove yourself".to_string()));
        }
        if !handler.is_leader(by) {
            return Err(CoreError::PermissionDenied("only the party leader can remove members".to_string()));
        }
        let member = handler
            .state
            .read()
            .members
            .iter()
            .find(|m| &m.presence_id == target)
            .cloned();
        let Some(member) = member else {
            return Err(CoreError::NotFound("target is not a party member".to_string()));
        };
        if let Some(session) = self.sessions.get(target.session_id) {
            self.router.send_to_presence_ids(
                &self.sessions,
                &self.local_node,
                &[(target.clone(), session.format)],
                &Envelope::PartyClose {
                    party_id: party_id.to_string(),
                },
                true,
            );
        }
        self.tracker.untrack(member.presence_id.session_id, handler.stream(), member.user_id);
        Ok(())
    }

    /// §4.H `Close`: stop the party, drop matchmaker tickets, untrack the
    /// stream, and remove it from the registry.
    pub fn close(&self, party_id: Uuid) -> Result<()> {
        let handler = self.get(party_id)?;
        handler.stopped.store(true, Ordering::Release);
        let ticket = handler.state.write().matchmaker_ticket.take();
        if let Some(ticket) = ticket {
            let matchmaker = self.matchmaker.clone();
            tokio::spawn(async move {
                let _ = matchmaker.remove_party(party_id, &ticket).await;
            });
        }
        self.tracker.untrack_by_stream(&handler.stream());
        self.parties.remove(&party_id);
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::PartyClose {
                party_id: party_id.to_string(),
            },
            true,
        );
        info!(party_id = %party_id, "party closed");
        Ok(())
    }

    /// §4.H `JoinRequestList`: leader-only view of pending requests.
    pub fn join_request_list(&self, party_id: Uuid, by: &PresenceId) -> Result<Vec<JoinRequest>> {
        let handler = self.get(party_id)?;
        if !handler.is_leader(by) {
            return Err(CoreError::PermissionDenied("only the party leader can list join requests".to_string()));
        }
        let result = handler.state.read().join_requests.clone();
        Ok(result)
    }

    /// §4.H `DataSend`: relay an opaque payload to every other member.
    pub fn data_send(&self, party_id: Uuid, sender: PresenceId, op_code: i64, payload: Vec<u8>) -> Result<()> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::PartyData {
                party_id: party_id.to_string(),
                presence: sender,
                op_code,
                payload,
            },
            true,
        );
        Ok(())
    }

    /// §4.H `MatchmakerAdd`.
    #[allow(clippy::too_many_arguments)]
    pub async fn matchmaker_add(
        &self,
        party_id: Uuid,
        query: &str,
        min_count: u32,
        max_count: u32,
        count_multiple: Option<u32>,
        string_properties: HashMap<String, String>,
        numeric_properties: HashMap<String, f64>,
    ) -> Result<String> {
        let handler = self.get(party_id)?;
        handler.ensure_open()?;
        let presences = self.tracker.list_by_stream(&handler.stream(), true, true);
        let leader_session = handler
            .state
            .read()
            .leader
            .as_ref()
            .map(|l| l.presence_id.session_id)
            .ok_or_else(|| CoreError::Invalid(format!("party {party_id} has no leader")))?;
        let ticket = self
            .matchmaker
            .add(crate::collab::MatchmakerAddRequest {
                presences: &presences,
                session_id: leader_session,
                party_id: Some(party_id),
                query,
                min_count,
                max_count,
                count_multiple,
                string_properties,
                numeric_properties,
            })
            .await?;
        handler.state.write().matchmaker_ticket = Some(ticket.clone());
        Ok(ticket)
    }

    /// §4.H `MatchmakerRemove`.
    pub async fn matchmaker_remove(&self, party_id: Uuid) -> Result<()> {
        let handler = self.get(party_id)?;
        let ticket = handler.state.write().matchmaker_ticket.take();
        if let Some(ticket) = ticket {
            self.matchmaker.remove_party(party_id, &ticket).await?;
        }
        Ok(())
    }

    pub fn snapshot(&self, party_id: Uuid) -> Result<PartySnapshot> {
        let handler = self.get(party_id)?;
        let open = handler.open.load(Ordering::Acquire);
        let result = handler.state.read().snapshot(party_id, open, handler.max_size);
        Ok(result)
    }

}

impl PartyEventSink for PartyRegistry {
    fn on_party_join(&self, party_id: Uuid, joins: Vec<Presence>) {
        let Ok(handler) = self.get(party_id) else {
            return;
        };
        let mut state = handler.state.write();
        for presence in &joins {
            state.members.push(PartyMember::from(presence));
        }
        if state.leader.is_none() {
            state.elect_leader();
        }
        let snapshot = state.snapshot(party_id, handler.open.load(Ordering::Acquire), handler.max_size);
        drop(state);
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::Party(snapshot),
            true,
        );
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::PartyPresenceEvent {
                party_id: party_id.to_string(),
                joins: joins.into_iter().map(|p| p.presence_id).collect(),
                leaves: Vec::new(),
            },
            true,
        );
        let matchmaker = self.matchmaker.clone();
        tokio::spawn(async move {
            let _ = matchmaker.remove_party_all(party_id).await;
        });
    }

    fn on_party_leave(&self, party_id: Uuid, leaves: Vec<Presence>) {
        let Ok(handler) = self.get(party_id) else {
            return;
        };
        let mut state = handler.state.write();
        for presence in &leaves {
            state.members.retain(|m| m.presence_id != presence.presence_id);
        }
        let leader_left = leaves
            .iter()
            .any(|p| state.leader.as_ref().is_some_and(|l| l.presence_id == p.presence_id));
        if leader_left {
            state.elect_leader();
        }
        let empty = state.members.is_empty();
        drop(state);
        self.router.send_to_stream(
            &self.sessions,
            self.tracker.as_ref(),
            &handler.stream(),
            &Envelope::PartyPresenceEvent {
                party_id: party_id.to_string(),
                joins: Vec::new(),
                leaves: leaves.into_iter().map(|p| p.presence_id).collect(),
            },
            true,
        );
        let matchmaker = self.matchmaker.clone();
        tokio::spawn(async move {
            let _ = matchmaker.remove_party_all(party_id).await;
        });
        if empty {
            let _ = self.close(party_id);
        }
    }
}
