//! Authoritative match runtime (§4.G) — one tick-loop task per match.
//!
//! The call queue + oneshot-reply pattern for `JoinAttempt` mirrors the
//! teacher's `Proposal { callback: oneshot::Sender<...> }` shape in its
//! Raft module (`raft::multi_raft::Proposal`): a request is handed to the
//! owning task over an `mpsc` channel and the caller awaits a one-shot
//! reply instead of sharing match state directly.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::router::{Envelope, MessageRouter, StreamSessionLookup};
use crate::session::SessionRegistry;
use crate::types::{Presence, PresenceStream, StreamMode};

/// Parameters a factory receives when creating a match's core module.
pub struct MatchInitContext {
    pub match_id: Uuid,
    pub node: String,
    pub module: String,
    pub params: Value,
}

/// What `MatchCore::init` hands back: the initial label and tick rate.
pub struct MatchInitResult {
    pub label: String,
    pub tick_rate: u8,
}

/// Outcome of `MatchCore::join_attempt`.
pub struct JoinDecision {
    pub allow: bool,
    pub reason: Option<String>,
}

/// A data message delivered to a match during a tick, queued via
/// `Dispatcher`-independent `Data` calls.
pub struct MatchDataMessage {
    pub presence: Presence,
    pub op_code: i64,
    pub payload: Vec<u8>,
}

/// What a tick produces: whether the module asked to be torn down, plus
/// nothing else — deferred broadcasts go through `Dispatcher`, not a
/// return value, matching how real match modules only ever reach the
/// client through the dispatcher they're handed.
pub struct TickOutcome {
    pub terminate: bool,
}

/// The user-authored match module contract. Synchronous: a match's entire
/// per-tick budget is a handful of milliseconds, so nothing here should be
/// awaiting I/O — that belongs behind the collaborator traits a real
/// module would hold (not modeled in this crate).
pub trait MatchCore: Send {
    fn init(&mut self, ctx: &MatchInitContext) -> Result<MatchInitResult>;
    fn join_attempt(&mut self, presence: &Presence, metadata: &Value) -> JoinDecision;
    fn join(&mut self, presences: &[Presence]);
    fn leave(&mut self, presences: &[Presence]);
    fn tick(&mut self, tick: u64, dispatcher: &dyn Dispatcher, messages: &[MatchDataMessage]) -> TickOutcome;
    fn terminate(&mut self, grace: Duration);
    fn signal(&mut self, data: &str) -> String {
        let _ = data;
        String::new()
    }
}

pub type MatchCoreFactory = Arc<dyn Fn(&MatchInitContext) -> Result<Box<dyn MatchCore>> + Send + Sync>;

/// What a `MatchCore` implementation is given each tick to reach clients
/// and the registry. All four calls fail `Closed` once the match has
/// begun terminating.
pub trait Dispatcher: Send + Sync {
    fn broadcast_message(&self, op_code: i64, payload: &[u8], recipients: Option<&[Uuid]>, sender: Option<Uuid>) -> Result<()>;
    fn broadcast_message_deferred(&self, op_code: i64, payload: Vec<u8>, recipients: Option<Vec<Uuid>>, sender: Option<Uuid>) -> Result<()>;
    fn match_kick(&self, presences: &[Presence]) -> Result<()>;
    fn match_label_update(&self, label: String) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Initializing,
    Running,
    Terminating,
    Stopped,
}

pub struct JoinAttemptResult {
    pub found: bool,
    pub allowed: bool,
    pub reason: Option<String>,
    pub label: String,
}

enum MatchCall {
    Join(Vec<Presence>),
    Leave(Vec<Presence>),
    Data(MatchDataMessage),
    JoinAttempt {
        presence: Presence,
        metadata: Value,
        reply: oneshot::Sender<JoinAttemptResult>,
    },
    Terminate {
        grace: Duration,
    },
    LabelUpdate {
        label: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

struct DeferredMessage {
    op_code: i64,
    payload: Vec<u8>,
    recipients: Option<Vec<Uuid>>,
    sender: Option<Uuid>,
}

/// Dispatcher implementation handed to the running `MatchCore`. Shares the
/// handler's stopped flag and deferred-broadcast buffer.
struct HandlerDispatcher {
    local_node: String,
    match_id: Uuid,
    stream: PresenceStream,
    stopped: Arc<AtomicBool>,
    deferred: parking_lot::Mutex<Vec<DeferredMessage>>,
    deferred_cap: usize,
    sessions: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    lookup: Arc<dyn StreamSessionLookup + Send + Sync>,
    label: parking_lot::Mutex<Option<String>>,
    current_label: Arc<parking_lot::Mutex<String>>,
    on_label_update: Arc<dyn Fn(Uuid, String) + Send + Sync>,
    max_label_bytes: usize,
}

impl HandlerDispatcher {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CoreError::Closed(format!("match {} is closed", self.match_id)));
        }
        Ok(())
    }

    fn send_now(&self, op_code: i64, payload: &[u8], recipients: Option<&[Uuid]>, sender: Option<Uuid>) {
        let envelope = Envelope::MatchData {
            match_id: format!("{}.{}", self.match_id, self.local_node),
            presence: crate::types::PresenceId {
                node: self.local_node.clone(),
                session_id: sender.unwrap_or(self.match_id),
            },
            op_code,
            payload: payload.to_vec(),
        };
        match recipients {
            Some(ids) => {
                let targets: Vec<_> = self
                    .lookup
                    .local_sessions_for_stream(&self.stream)
                    .into_iter()
                    .filter(|(sid, _)| ids.contains(sid))
                    .map(|(sid, fmt)| (crate::types::PresenceId { node: self.local_node.clone(), session_id: sid }, fmt))
                    .collect();
                self.router.send_to_presence_ids(&self.sessions, &self.local_node, &targets, &envelope, true);
            }
            None => self.router.send_to_stream(&self.sessions, self.lookup.as_ref(), &self.stream, &envelope, true),
        }
    }

    fn flush_deferred(&self) {
        let batch = std::mem::take(&mut *self.deferred.lock());
        for msg in batch {
            self.send_now(msg.op_code, &msg.payload, msg.recipients.as_deref(), msg.sender);
        }
        if let Some(label) = self.label.lock().take() {
            (self.on_label_update)(self.match_id, label);
        }
    }
}

impl Dispatcher for HandlerDispatcher {
    fn broadcast_message(&self, op_code: i64, payload: &[u8], recipients: Option<&[Uuid]>, sender: Option<Uuid>) -> Result<()> {
        self.ensure_running()?;
        if let Some(ids) = recipients {
            if ids.is_empty() {
                return Ok(());
            }
        }
        self.send_now(op_code, payload, recipients, sender);
        Ok(())
    }

    fn broadcast_message_deferred(&self, op_code: i64, payload: Vec<u8>, recipients: Option<Vec<Uuid>>, sender: Option<Uuid>) -> Result<()> {
        self.ensure_running()?;
        let mut deferred = self.deferred.lock();
        if deferred.len() >= self.deferred_cap {
            return Err(CoreError::Full("deferred broadcast buffer is full".to_string()));
        }
        deferred.push(DeferredMessage { op_code, payload, recipients, sender });
        Ok(())
    }

    fn match_kick(&self, presences: &[Presence]) -> Result<()> {
        self.ensure_running()?;
        self.router.send_to_stream(
            &self.sessions,
            self.lookup.as_ref(),
            &self.stream,
            &Envelope::MatchPresenceEvent {
                match_id: format!("{}.{}", self.match_id, self.local_node),
                joins: Vec::new(),
                leaves: presences.iter().map(|p| p.presence_id.clone()).collect(),
            },
            true,
        );
        Ok(())
    }

    fn match_label_update(&self, label: String) -> Result<()> {
        self.ensure_running()?;
        if label.len() > self.max_label_bytes {
            return Err(CoreError::Invalid(format!(
                "match label exceeds {} bytes",
                self.max_label_bytes
            )));
        }
        *self.current_label.lock() = label.clone();
        *self.label.lock() = Some(label);
        Ok(())
    }
}

/// A running match's handle: the registry holds one per live match and
/// talks to the tick-loop task only through `call_tx`.
pub struct MatchHandler {
    pub id: Uuid,
    pub node: String,
    pub module: String,
    pub create_time: chrono::DateTime<chrono::Utc>,
    pub tick_rate: u8,
    call_tx: mpsc::Sender<MatchCall>,
    stopped: Arc<AtomicBool>,
    tick_count: Arc<AtomicU64>,
    current_label: Arc<parking_lot::Mutex<String>>,
}

impl MatchHandler {
    /// A match's presence stream carries the owning node as its `label`
    /// (not the match's searchable game-state label) — the presence
    /// tracker's event dispatcher routes `MatchAuthoritative` events to
    /// match hooks only when `stream.label == local_node` (§4.C).
    pub fn stream(&self) -> PresenceStream {
        PresenceStream::with_label(StreamMode::MatchAuthoritative, self.id, self.node.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    /// The match's current searchable label, as last accepted by the
    /// running module (may be ahead of the registry's label index, which
    /// only learns of the change on its next batch flush).
    pub fn current_label(&self) -> String {
        self.current_label.lock().clone()
    }

    pub fn notify_join(&self, presences: Vec<Presence>) {
        let _ = self.call_tx.try_send(MatchCall::Join(presences));
    }

    pub fn notify_leave(&self, presences: Vec<Presence>) {
        let _ = self.call_tx.try_send(MatchCall::Leave(presences));
    }

    pub fn send_data(&self, message: MatchDataMessage) -> Result<()> {
        self.call_tx
            .try_send(MatchCall::Data(message))
            .map_err(|_| CoreError::Full(format!("match {} call queue is full", self.id)))
    }

    pub async fn join_attempt(&self, presence: Presence, metadata: Value, deadline: Duration) -> JoinAttemptResult {
        let (tx, rx) = oneshot::channel();
        match self.call_tx.try_send(MatchCall::JoinAttempt { presence, metadata, reply: tx }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                return JoinAttemptResult {
                    found: true,
                    allowed: false,
                    reason: Some("not accepting joins".to_string()),
                    label: self.current_label(),
                };
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return JoinAttemptResult {
                    found: true,
                    allowed: false,
                    reason: Some("match is closed".to_string()),
                    label: self.current_label(),
                };
            }
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => JoinAttemptResult {
                found: true,
                allowed: false,
                reason: Some("match is closed".to_string()),
                label: self.current_label(),
            },
            Err(_) => {
                warn!(match_id = %self.id, "join attempt timed out");
                JoinAttemptResult {
                    found: true,
                    allowed: false,
                    reason: Some("timed out".to_string()),
                    label: self.current_label(),
                }
            }
        }
    }

    pub async fn update_label(&self, label: String) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.call_tx
            .send(MatchCall::LabelUpdate { label, reply: tx })
            .await
            .map_err(|_| CoreError::Closed(format!("match {} is closed", self.id)))?;
        rx.await.map_err(CoreError::from)?
    }

    pub async fn terminate(&self, grace: Duration) {
        let _ = self.call_tx.send(MatchCall::Terminate { grace }).await;
    }

    pub async fn close(&self) {
        let _ = self.call_tx.send(MatchCall::Close).await;
    }

    /// Start a new match's tick-loop task and return the handle.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: Uuid,
        local_node: String,
        module: String,
        mut core: Box<dyn MatchCore>,
        init: MatchInitResult,
        max_calls_per_tick: usize,
        deferred_broadcast_cap: usize,
        max_label_bytes: usize,
        sessions: Arc<SessionRegistry>,
        router: Arc<MessageRouter>,
        lookup: Arc<dyn StreamSessionLookup + Send + Sync>,
        on_stop: Arc<dyn Fn(Uuid, String) + Send + Sync>,
        on_label_update: Arc<dyn Fn(Uuid, String) + Send + Sync>,
    ) -> Arc<MatchHandler> {
        let tick_rate = init.tick_rate.clamp(1, 60);
        let (call_tx, mut call_rx) = mpsc::channel(1024);
        let stopped = Arc::new(AtomicBool::new(false));
        let tick_count = Arc::new(AtomicU64::new(0));
        let create_time = chrono::Utc::now();
        let current_label = Arc::new(parking_lot::Mutex::new(init.label.clone()));

        let handler = Arc::new(MatchHandler {
            id,
            node: local_node.clone(),
            module: module.clone(),
            create_time,
            tick_rate,
            call_tx,
            stopped: stopped.clone(),
            tick_count: tick_count.clone(),
            current_label: current_label.clone(),
        });

        let stream = handler.stream();
        let dispatcher = Arc::new(HandlerDispatcher {
            local_node: local_node.clone(),
            match_id: id,
            stream,
            stopped: stopped.clone(),
            deferred: parking_lot::Mutex::new(Vec::new()),
            deferred_cap: deferred_broadcast_cap,
            sessions,
            router,
            lookup,
            label: parking_lot::Mutex::new(None),
            current_label,
            on_label_update,
            max_label_bytes,
        });

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_rate as f64));
            let mut state = MatchState::Running;
            let mut terminate_grace: Option<Duration> = None;
            let mut terminate_deadline: Option<tokio::time::Instant> = None;

            loop {
                interval.tick().await;
                if state == MatchState::Stopped {
                    break;
                }

                let mut incoming = Vec::new();
                let mut calls_drained = 0;
                while calls_drained < max_calls_per_tick {
                    let Ok(call) = call_rx.try_recv() else { break };
                    calls_drained += 1;
                    match call {
                        MatchCall::Join(presences) => core.join(&presences),
                        MatchCall::Leave(presences) => core.leave(&presences),
                        MatchCall::Data(message) => incoming.push(message),
                        MatchCall::JoinAttempt { presence, metadata, reply } => {
                            let decision = core.join_attempt(&presence, &metadata);
                            let _ = reply.send(JoinAttemptResult {
                                found: true,
                                allowed: decision.allow,
                                reason: decision.reason,
                                label: dispatcher.current_label.lock().clone(),
                            });
                        }
                        MatchCall::Terminate { grace } => {
                            state = MatchState::Terminating;
                            terminate_grace = Some(grace);
                            terminate_deadline = Some(tokio::time::Instant::now() + grace);
                        }
                        MatchCall::LabelUpdate { label, reply } => {
                            let result = dispatcher.match_label_update(label);
                            let _ = reply.send(result);
                        }
                        MatchCall::Close => {
                            state = MatchState::Terminating;
                            terminate_grace = Some(Duration::ZERO);
                            terminate_deadline = Some(tokio::time::Instant::now());
                        }
                    }
                }

                let tick = tick_count.fetch_add(1, Ordering::AcqRel) + 1;
                let outcome = core.tick(tick, dispatcher.as_ref(), &incoming);
                dispatcher.flush_deferred();

                let grace_expired = terminate_deadline.is_some_and(|d| tokio::time::Instant::now() >= d);
                if outcome.terminate || (state == MatchState::Terminating && grace_expired) {
                    core.terminate(terminate_grace.unwrap_or(Duration::ZERO));
                    stopped.store(true, Ordering::Release);
                    state = MatchState::Stopped;
                    info!(match_id = %id, ticks = tick, "match terminated");
                    on_stop(id, local_node.clone());
                    break;
                }
            }
        });

        handler
    }
}
