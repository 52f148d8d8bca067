//! Message Router (§4.B) — pure envelope fan-out.
//!
//! The router never inspects envelope payloads; it only resolves
//! recipients and marshals each envelope at most once per wire format
//! across a whole broadcast. It depends on the session registry and on a
//! small [`StreamSessionLookup`] trait (implemented by the presence
//! tracker) rather than owning either, so the session/tracker/router cycle
//! is broken by dependency inversion instead of shared ownership.

use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::session::SessionRegistry;
use crate::types::{PresenceId, PresenceStream, SessionId, WireFormat};

/// Tagged sum of every realtime wire message the core can emit. The router
/// is generic over this enum; it never branches on payload content.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Envelope {
    Party(crate::party::PartySnapshot),
    PartyJoinRequest { party_id: String, presence: PresenceId },
    PartyLeader { party_id: String, presence: PresenceId },
    PartyPresenceEvent {
        party_id: String,
        joins: Vec<PresenceId>,
        leaves: Vec<PresenceId>,
    },
    PartyClose { party_id: String },
    PartyData {
        party_id: String,
        presence: PresenceId,
        op_code: i64,
        payload: Vec<u8>,
    },
    MatchData {
        match_id: String,
        presence: PresenceId,
        op_code: i64,
        payload: Vec<u8>,
    },
    MatchPresenceEvent {
        match_id: String,
        joins: Vec<PresenceId>,
        leaves: Vec<PresenceId>,
    },
    ChannelPresenceEvent {
        stream: PresenceStream,
        joins: Vec<PresenceId>,
        leaves: Vec<PresenceId>,
    },
    StreamPresenceEvent {
        stream: PresenceStream,
        joins: Vec<PresenceId>,
        leaves: Vec<PresenceId>,
    },
    StatusPresenceEvent {
        user_id: uuid::Uuid,
        joins: Vec<PresenceId>,
        leaves: Vec<PresenceId>,
    },
    LiveNotifications {
        notifications: Vec<crate::notification::Notification>,
    },
}

impl Envelope {
    /// Marshal this envelope for a given wire format. Real deployments
    /// would emit length-prefixed protobuf here; this crate's concern is
    /// the coordination core, so both formats are JSON under the hood with
    /// the `Protobuf` variant additionally length-prefixed, which is
    /// sufficient to exercise the "encode once per format" contract.
    pub fn encode(&self, format: WireFormat) -> Vec<u8> {
        let json = serde_json::to_vec(self).expect("envelope always serializes");
        match format {
            WireFormat::Json => json,
            WireFormat::Protobuf => {
                let mut framed = Vec::with_capacity(json.len() + 4);
                framed.extend_from_slice(&(json.len() as u32).to_be_bytes());
                framed.extend_from_slice(&json);
                framed
            }
        }
    }
}

/// Implemented by the presence tracker: resolves the local sessions
/// subscribed to a stream, without the router holding a reference to the
/// tracker itself.
pub trait StreamSessionLookup {
    fn local_sessions_for_stream(&self, stream: &PresenceStream) -> Vec<(SessionId, WireFormat)>;
}

#[derive(Default)]
pub struct MessageRouter;

impl MessageRouter {
    pub fn new() -> Self {
        Self
    }

    /// Fan an envelope out to an explicit list of presence ids. Only ids
    /// whose node matches `local_node` are deliverable from this process;
    /// others are silently skipped (a future multi-node layer would route
    /// them onward).
    pub fn send_to_presence_ids(
        &self,
        sessions: &SessionRegistry,
        local_node: &str,
        ids: &[(PresenceId, WireFormat)],
        envelope: &Envelope,
        reliable: bool,
    ) {
        let mut encoded: HashMap<WireFormat, Vec<u8>> = HashMap::new();
        for (presence_id, format) in ids {
            if presence_id.node != local_node {
                continue;
            }
            let Some(session) = sessions.get(presence_id.session_id) else {
                continue;
            };
            let bytes = encoded
                .entry(*format)
                .or_insert_with(|| envelope.encode(*format));
            if let Err(err) = session.send_bytes(bytes, reliable) {
                warn!(session_id = %presence_id.session_id, error = %err, "send_bytes failed");
            }
        }
    }

    /// Resolve a stream to its local sessions via `lookup`, then fan out.
    pub fn send_to_stream(
        &self,
        sessions: &SessionRegistry,
        lookup: &dyn StreamSessionLookup,
        stream: &PresenceStream,
        envelope: &Envelope,
        reliable: bool,
    ) {
        let mut encoded: HashMap<WireFormat, Vec<u8>> = HashMap::new();
        for (session_id, format) in lookup.local_sessions_for_stream(stream) {
            let Some(session) = sessions.get(session_id) else {
                continue;
            };
            let bytes = encoded
                .entry(format)
                .or_insert_with(|| envelope.encode(format));
            if let Err(err) = session.send_bytes(bytes, reliable) {
                warn!(session_id = %session_id, error = %err, "send_bytes failed");
            }
        }
    }
}
