//! Notification Service (§4.E) — persistent + live per-user notifications.
//!
//! Persistence is delegated to a [`NotificationStore`] collaborator (a
//! `DashMap`/`RwLock`-backed in-memory implementation ships for tests and
//! as the default), mirroring the teacher's split between an engine and the
//! storage trait it drives (`lumadb-storage::engine::StorageEngine` against
//! a `Db` handle). Live delivery goes through the same presence-tracker +
//! router path every other component uses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::error::{CoreError, Result};
use crate::presence::PresenceTracker;
use crate::router::{Envelope, MessageRouter};
use crate::session::SessionRegistry;
use crate::types::{PresenceStream, StreamMode};
use std::sync::Arc;

/// A single notification, persistent or ephemeral.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subject: String,
    pub content: Vec<u8>,
    pub code: i64,
    pub sender_id: Option<Uuid>,
    pub create_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub persistent: bool,
}

/// A notification plus the delivery mode the caller requested: persisted,
/// delivered live, or both.
pub struct NotificationRequest {
    pub notification: Notification,
    pub persist: bool,
}

/// Resumable cursor: `(expires_at, id)` under lexicographic order (N1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NotificationCursor {
    pub expires_at: DateTime<Utc>,
    pub id: Uuid,
}

impl NotificationCursor {
    /// Base64url of `"<expires_at_rfc3339>|<id>"`. Opaque to callers, so
    /// the encoding can change without breaking the public contract.
    pub fn encode(&self) -> String {
        let raw = format!("{}|{}", self.expires_at.to_rfc3339(), self.id);
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, raw)
    }

    pub fn decode(cursor: &str) -> Result<Self> {
        let raw = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, cursor)
            .map_err(|e| CoreError::Invalid(format!("malformed cursor: {e}")))?;
        let raw = String::from_utf8(raw).map_err(|e| CoreError::Invalid(format!("malformed cursor: {e}")))?;
        let (expires_at, id) = raw
            .split_once('|')
            .ok_or_else(|| CoreError::Invalid("malformed cursor".to_string()))?;
        let expires_at = DateTime::parse_from_rfc3339(expires_at)
            .map_err(|e| CoreError::Invalid(format!("malformed cursor timestamp: {e}")))?
            .with_timezone(&Utc);
        let id = Uuid::parse_str(id).map_err(|e| CoreError::Invalid(format!("malformed cursor id: {e}")))?;
        Ok(Self { expires_at, id })
    }
}

/// A page of `List`: the notifications plus a cursor for the next page.
/// `next_cursor` is unchanged from the request when the page is empty.
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub next_cursor: Option<NotificationCursor>,
}

/// Storage collaborator. Async so a real deployment can back it with a
/// database without blocking the tracker's executor.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn upsert_persistent(&self, notifications: Vec<Notification>) -> Result<()>;
    async fn list(&self, user_id: Uuid, limit: usize, after: Option<NotificationCursor>) -> Result<Vec<Notification>>;
    async fn soft_delete(&self, user_id: Uuid, ids: &[Uuid]) -> Result<()>;
}

/// Default store: a `RwLock<BTreeMap>` keyed by user, ordered by cursor —
/// in the spirit of the teacher's `DashMap`-backed in-memory shard, but a
/// `BTreeMap` here because `List` needs an ordered scan, not point lookup.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    by_user: RwLock<std::collections::HashMap<Uuid, BTreeMap<(DateTime<Utc>, Uuid), Notification>>>,
    deleted: RwLock<std::collections::HashSet<(Uuid, Uuid)>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn upsert_persistent(&self, notifications: Vec<Notification>) -> Result<()> {
        let mut by_user = self.by_user.write();
        for n in notifications {
            by_user
                .entry(n.user_id)
                .or_default()
                .insert((n.expires_at, n.id), n);
        }
        Ok(())
    }

    async fn list(&self, user_id: Uuid, limit: usize, after: Option<NotificationCursor>) -> Result<Vec<Notification>> {
        let by_user = self.by_user.read();
        let deleted = self.deleted.read();
        let now = Utc::now();
        let Some(map) = by_user.get(&user_id) else {
            return Ok(Vec::new());
        };
        let lower = after.map(|c| (c.expires_at, c.id));
        Ok(map
            .iter()
            .filter(|((expires_at, id), _)| {
                *expires_at >= now
                    && !deleted.contains(&(user_id, *id))
                    && match lower {
                        Some(lower) => (*expires_at, *id) > lower,
                        None => true,
                    }
            })
            .take(limit)
            .map(|(_, n)| n.clone())
            .collect())
    }

    async fn soft_delete(&self, user_id: Uuid, ids: &[Uuid]) -> Result<()> {
        let mut deleted = self.deleted.write();
        for id in ids {
            deleted.insert((user_id, *id));
        }
        Ok(())
    }
}

/// Orchestrates persistence and live delivery.
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    config: NotificationConfig,
    local_node: String,
    tracker: Arc<PresenceTracker>,
    sessions: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
}

impl NotificationService {
    pub fn new(
        local_node: impl Into<String>,
        config: NotificationConfig,
        store: Arc<dyn NotificationStore>,
        tracker: Arc<PresenceTracker>,
        sessions: Arc<SessionRegistry>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            store,
            config,
            local_node: local_node.into(),
            tracker,
            sessions,
            router,
        }
    }

    pub fn default_expiry(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.default_expiry).unwrap_or(chrono::Duration::days(30))
    }

    /// §4.E `Send`: persist (for persistent notifications) and deliver live
    /// to every `Notifications`-stream presence of each recipient. Delivery
    /// failures are logged and do not affect the persistence outcome.
    pub async fn send(&self, requests: Vec<NotificationRequest>) -> Result<()> {
        let mut by_user: std::collections::HashMap<Uuid, Vec<Notification>> = std::collections::HashMap::new();
        let mut to_persist = Vec::new();
        for req in requests {
            if req.persist {
                to_persist.push(req.notification.clone());
            }
            by_user.entry(req.notification.user_id).or_default().push(req.notification);
        }

        if !to_persist.is_empty() {
            self.store.upsert_persistent(to_persist).await?;
        }

        for (user_id, notifications) in by_user {
            let stream = PresenceStream::new(StreamMode::Notifications, user_id);
            let recipients = self.tracker.list_local_session_ids_by_stream(&stream);
            if recipients.is_empty() {
                continue;
            }
            let envelope = Envelope::LiveNotifications { notifications };
            let ids: Vec<_> = recipients
                .into_iter()
                .filter_map(|session_id| {
                    self.sessions.get(session_id).map(|s| {
                        (
                            crate::types::PresenceId {
                                node: self.local_node.clone(),
                                session_id,
                            },
                            s.format,
                        )
                    })
                })
                .collect();
            self.router
                .send_to_presence_ids(&self.sessions, &self.local_node, &ids, &envelope, true);
        }
        Ok(())
    }

    /// §4.E `List`.
    pub async fn list(&self, user_id: Uuid, limit: usize, cursor: Option<String>) -> Result<NotificationPage> {
        let after = cursor.as_deref().map(NotificationCursor::decode).transpose()?;
        let notifications = self.store.list(user_id, limit, after).await?;
        let next_cursor = notifications
            .last()
            .map(|n| NotificationCursor { expires_at: n.expires_at, id: n.id })
            .or(after);
        Ok(NotificationPage { notifications, next_cursor })
    }

    /// §4.E `Remove`: soft-delete.
    pub async fn remove(&self, user_id: Uuid, ids: &[Uuid]) -> Result<()> {
        if let Err(err) = self.store.soft_delete(user_id, ids).await {
            warn!(user_id = %user_id, error = %err, "notification soft-delete failed");
            return Err(err);
        }
        Ok(())
    }
}
