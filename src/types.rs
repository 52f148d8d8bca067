//! Core value types shared by every component of the realtime core.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire encoding a session negotiated at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireFormat {
    Protobuf,
    Json,
}

/// Opaque session identifier (one per live socket).
pub type SessionId = Uuid;

/// Opaque account identifier.
pub type UserId = Uuid;

/// A presence id is unique across the (future) cluster: the node that owns
/// the session, plus the session id itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceId {
    pub node: String,
    pub session_id: SessionId,
}

impl fmt::Display for PresenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.session_id, self.node)
    }
}

/// Closed enumeration of routing topics. Ordinal values are stable because
/// they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamMode {
    Notifications = 0,
    Status = 1,
    Channel = 2,
    Group = 3,
    Dm = 4,
    MatchRelayed = 5,
    MatchAuthoritative = 6,
    Party = 7,
}

/// A routing topic. Streams are value types: equality is field-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceStream {
    pub mode: StreamMode,
    pub subject: Uuid,
    pub subcontext: Uuid,
    pub label: String,
}

impl PresenceStream {
    pub fn new(mode: StreamMode, subject: Uuid) -> Self {
        Self {
            mode,
            subject,
            subcontext: Uuid::nil(),
            label: String::new(),
        }
    }

    pub fn with_label(mode: StreamMode, subject: Uuid, label: impl Into<String>) -> Self {
        Self {
            mode,
            subject,
            subcontext: Uuid::nil(),
            label: label.into(),
        }
    }
}

/// Why a presence entered or left its stream. Carried on the event, not
/// just the presence, so a single `Update` can emit both a leave and a
/// join with the same reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceReason {
    Join,
    Update,
    Leave,
    Disconnect,
}

/// Per-presence metadata. `status` is only meaningful (and only ever sent
/// on the wire) when the owning stream's mode is `Status` (invariant P3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub format: WireFormat,
    pub hidden: bool,
    pub persistence: bool,
    pub username: String,
    pub status: Option<String>,
    pub reason: PresenceReason,
}

impl PresenceMeta {
    pub fn new(format: WireFormat, username: impl Into<String>) -> Self {
        Self {
            format,
            hidden: false,
            persistence: true,
            username: username.into(),
            status: None,
            reason: PresenceReason::Join,
        }
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Two metas are "the same" for the purposes of deciding whether an
    /// `Update` needs to emit a leave+join pair, ignoring `reason` (which
    /// is always overwritten by the operation performing the comparison).
    pub fn content_eq(&self, other: &PresenceMeta) -> bool {
        self.format == other.format
            && self.hidden == other.hidden
            && self.persistence == other.persistence
            && self.username == other.username
            && self.status == other.status
    }
}

/// The tuple tracked by the presence tracker while a session participates
/// in a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub presence_id: PresenceId,
    pub stream: PresenceStream,
    pub user_id: UserId,
    pub meta: PresenceMeta,
}

impl Presence {
    pub fn key(&self) -> (SessionId, UserId) {
        (self.presence_id.session_id, self.user_id)
    }
}
