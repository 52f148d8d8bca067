//! Match Registry (§4.F) — creates authoritative matches, owns their
//! handlers, maintains the searchable label index, and arbitrates joins.

pub mod handler;
pub mod label_index;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::{MatchHandlerConfig, MatchRegistryConfig};
use crate::error::{CoreError, Result};
use crate::metrics::CoreMetrics;
use crate::presence::event::MatchEventSink;
use crate::presence::PresenceTracker;
use crate::router::{MessageRouter, StreamSessionLookup};
use crate::session::SessionRegistry;
use crate::types::{Presence, StreamMode};

pub use handler::{
    Dispatcher, JoinAttemptResult, MatchCore, MatchCoreFactory, MatchDataMessage, MatchHandler,
    MatchInitContext, MatchInitResult,
};
pub use label_index::{parse_query_string, LabelDocument, LabelIndex, LabelQuery};

/// A summary row returned by `ListMatches`/`GetMatch`.
#[derive(Debug, Clone)]
pub struct MatchInfo {
    pub match_id: Uuid,
    pub node: String,
    pub authoritative: bool,
    pub label: String,
    pub tick_rate: u8,
    pub handler_name: String,
    pub size: usize,
}

impl MatchInfo {
    pub fn wire_id(&self) -> String {
        format!("{}.{}", self.match_id, self.node)
    }
}

/// Filter set accepted by `ListMatches` (§4.F).
#[derive(Default)]
pub struct ListMatchesFilter {
    pub limit: usize,
    pub authoritative: Option<bool>,
    pub label: Option<String>,
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub query: Option<LabelQuery>,
    pub node: Option<String>,
}

pub struct MatchRegistry {
    local_node: String,
    config: MatchRegistryConfig,
    handler_config: MatchHandlerConfig,
    handlers: DashMap<Uuid, Arc<MatchHandler>>,
    index: Arc<LabelIndex>,
    tracker: Arc<PresenceTracker>,
    sessions: Arc<SessionRegistry>,
    router: Arc<MessageRouter>,
    metrics: Arc<CoreMetrics>,
    shutting_down: AtomicBool,
    pending_label_updates: Mutex<HashMap<(Uuid, String), LabelDocument>>,
    batch_cancel: Arc<tokio::sync::Notify>,
    batch_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MatchRegistry {
    pub fn new(
        local_node: impl Into<String>,
        config: MatchRegistryConfig,
        handler_config: MatchHandlerConfig,
        tracker: Arc<PresenceTracker>,
        sessions: Arc<SessionRegistry>,
        router: Arc<MessageRouter>,
        metrics: Arc<CoreMetrics>,
    ) -> Arc<Self> {
        let batch_interval = config.label_index_batch_interval;
        let batch_cancel = Arc::new(tokio::sync::Notify::new());
        let registry = Arc::new(Self {
            local_node: local_node.into(),
            config,
            handler_config,
            handlers: DashMap::new(),
            index: Arc::new(LabelIndex::new()),
            tracker,
            sessions,
            router,
            metrics,
            shutting_down: AtomicBool::new(false),
            pending_label_updates: Mutex::new(HashMap::new()),
            batch_cancel: batch_cancel.clone(),
            batch_task: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&registry);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batch_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = batch_cancel.notified() => return,
                }
                let Some(registry) = weak.upgrade() else { return };
                let batch: Vec<LabelDocument> = {
                    let mut pending = registry.pending_label_updates.lock();
                    if pending.is_empty() {
                        continue;
                    }
                    std::mem::take(&mut *pending).into_values().collect()
                };
                registry.index.process_label_updates(batch);
            }
        });
        *registry.batch_task.lock().unwrap() = Some(task);

        registry
    }

    /// Enqueue a label document for the next batch flush (§4.F
    /// `UpdateMatchLabel` is O(1): only the pending-update map is touched).
    /// A second update to the same match before the next tick overwrites
    /// the first rather than growing the batch.
    fn enqueue_label_update(&self, doc: LabelDocument) {
        self.pending_label_updates.lock().insert((doc.match_id, doc.node.clone()), doc);
    }

    /// §4.F `CreateMatch`.
    pub fn create_match(self: &Arc<Self>, factory: MatchCoreFactory, module: impl Into<String>, params: serde_json::Value) -> Result<Uuid> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        let match_id = Uuid::new_v4();
        let module = module.into();
        let ctx = MatchInitContext {
            match_id,
            node: self.local_node.clone(),
            module: module.clone(),
            params,
        };
        let mut core = (factory.as_ref())(&ctx)?;
        let init = core.init(&ctx)?;
        if init.label.len() > self.config.max_label_bytes {
            return Err(CoreError::Invalid(format!(
                "match label exceeds {} bytes",
                self.config.max_label_bytes
            )));
        }

        let lookup: Arc<dyn StreamSessionLookup + Send + Sync> = self.tracker.clone();
        let registry = self.clone();
        let on_stop: Arc<dyn Fn(Uuid, String) + Send + Sync> = Arc::new(move |id, node| {
            registry.handlers.remove(&id);
            registry.index.remove(id, &node);
            registry.tracker.untrack_by_stream(&crate::types::PresenceStream::with_label(
                StreamMode::MatchAuthoritative,
                id,
                node,
            ));
            registry.metrics.matches_terminated_total.inc();
        });
        let registry = self.clone();
        let module_for_label = module.clone();
        let on_label_update: Arc<dyn Fn(Uuid, String) + Send + Sync> = Arc::new(move |id, label| {
            let Some(handler) = registry.handlers.get(&id).map(|e| e.clone()) else {
                return;
            };
            registry.enqueue_label_update(LabelDocument {
                match_id: id,
                node: handler.node.clone(),
                label_string: label.clone(),
                label: parse_label_json(&label),
                authoritative: true,
                tick_rate: handler.tick_rate,
                handler_name: module_for_label.clone(),
            });
        });

        let label = init.label.clone();
        let tick_rate = init.tick_rate;
        let handler = MatchHandler::spawn(
            match_id,
            self.local_node.clone(),
            module.clone(),
            core,
            init,
            self.handler_config.max_calls_per_tick,
            self.handler_config.deferred_broadcast_cap,
            self.config.max_label_bytes,
            self.sessions.clone(),
            self.router.clone(),
            lookup,
            on_stop,
            on_label_update,
        );
        self.handlers.insert(match_id, handler);
        self.index.upsert(LabelDocument {
            match_id,
            node: self.local_node.clone(),
            label_string: label.clone(),
            label: parse_label_json(&label),
            authoritative: true,
            tick_rate,
            handler_name: module,
        });
        self.metrics.matches_created_total.inc();
        info!(match_id = %match_id, "match created");
        Ok(match_id)
    }

    fn handler(&self, match_id: Uuid) -> Option<Arc<MatchHandler>> {
        self.handlers.get(&match_id).map(|e| e.clone())
    }

    /// §4.F `GetMatch`.
    pub fn get_match(&self, match_id: Uuid) -> Result<MatchInfo> {
        let handler = self.handler(match_id).ok_or_else(|| CoreError::NotFound(format!("match {match_id} not found")))?;
        let doc = self.index.get(match_id, &handler.node);
        Ok(MatchInfo {
            match_id,
            node: handler.node.clone(),
            authoritative: true,
            label: doc.map(|d| d.label_string).unwrap_or_default(),
            tick_rate: handler.tick_rate,
            handler_name: handler.module.clone(),
            size: self.tracker.count_by_stream(&handler.stream()),
        })
    }

    /// §4.F `GetMatchLabel`.
    pub fn get_match_label(&self, match_id: Uuid) -> Result<String> {
        let handler = self.handler(match_id).ok_or_else(|| CoreError::NotFound(format!("match {match_id} not found")))?;
        Ok(self.index.get(match_id, &handler.node).map(|d| d.label_string).unwrap_or_default())
    }

    /// §4.F `GetState`: fails `NotFound` once the handler has stopped.
    pub fn get_state(&self, match_id: Uuid) -> Result<Vec<crate::types::PresenceId>> {
        let handler = self.handler(match_id).ok_or_else(|| CoreError::NotFound(format!("match {match_id} not found")))?;
        if handler.is_stopped() {
            return Err(CoreError::NotFound(format!("match {match_id} has terminated")));
        }
        Ok(self.tracker.list_presence_ids_by_stream(&handler.stream()))
    }

    /// §4.F `JoinAttempt`.
    pub async fn join_attempt(&self, match_id: Uuid, presence: Presence, metadata: serde_json::Value) -> JoinAttemptResult {
        self.metrics.join_attempts_total.inc();
        let Some(handler) = self.handler(match_id) else {
            return JoinAttemptResult { found: false, allowed: false, reason: None, label: String::new() };
        };
        if handler.is_stopped() {
            return JoinAttemptResult {
                found: true,
                allowed: false,
                reason: Some("match has terminated".to_string()),
                label: handler.current_label(),
            };
        }
        let result = handler.join_attempt(presence, metadata, self.config.join_attempt_timeout).await;
        if !result.allowed && result.reason.as_deref() == Some("timed out") {
            self.metrics.join_attempts_timed_out_total.inc();
        }
        result
    }

    /// §4.F `UpdateMatchLabel`: enqueue is O(1) on the handler's call
    /// queue; the handler applies it on its own tick, and the registry's
    /// label-index batcher picks it up on its next tick (at most
    /// `label_index_batch_interval` later).
    pub async fn update_match_label(&self, match_id: Uuid, label: String) -> Result<()> {
        if label.len() > self.config.max_label_bytes {
            return Err(CoreError::Invalid(format!("match label exceeds {} bytes", self.config.max_label_bytes)));
        }
        let handler = self.handler(match_id).ok_or_else(|| CoreError::NotFound(format!("match {match_id} not found")))?;
        handler.update_label(label.clone()).await?;
        self.enqueue_label_update(LabelDocument {
            match_id,
            node: handler.node.clone(),
            label_string: label.clone(),
            label: parse_label_json(&label),
            authoritative: true,
            tick_rate: handler.tick_rate,
            handler_name: handler.module.clone(),
        });
        Ok(())
    }

    /// Force the label-index batcher to apply every pending update now,
    /// instead of waiting for its next tick. Exposed for callers (and
    /// tests) that need a label change to be immediately queryable.
    pub fn flush_label_updates(&self) {
        let batch: Vec<LabelDocument> = {
            let mut pending = self.pending_label_updates.lock();
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending).into_values().collect()
        };
        self.index.process_label_updates(batch);
    }

    /// §4.F `ListMatches`, five-step algorithm:
    /// 1. if `label`/`query` are both absent and `authoritative=false`
    ///    explicitly, skip label work entirely and enumerate only relayed
    ///    matches via the tracker;
    /// 2. if `query` is present, run it against the label index
    ///    (authoritative-only);
    /// 3. if `label` is present (without `query`), filter the index on
    ///    `label_string` (authoritative-only);
    /// 4. otherwise, union every indexed label with every relayed stream
    ///    the tracker knows about;
    /// 5. apply `node`/`min_size`/`max_size` and truncate to `limit`.
    pub fn list_matches(&self, filter: ListMatchesFilter) -> Vec<MatchInfo> {
        let relayed_only = filter.authoritative == Some(false) && filter.label.is_none() && filter.query.is_none();

        let mut candidates: Vec<MatchInfo> = Vec::new();
        if !relayed_only {
            let authoritative_docs: Vec<LabelDocument> = if let Some(query) = &filter.query {
                self.index.query(query)
            } else if let Some(label) = &filter.label {
                self.index
                    .query(&LabelQuery::MatchAll)
                    .into_iter()
                    .filter(|d| &d.label_string == label)
                    .collect()
            } else {
                self.index.query(&LabelQuery::MatchAll)
            };
            for doc in authoritative_docs {
                let Some(handler) = self.handler(doc.match_id) else { continue };
                if handler.is_stopped() {
                    continue;
                }
                candidates.push(MatchInfo {
                    match_id: doc.match_id,
                    node: doc.node,
                    authoritative: doc.authoritative,
                    label: doc.label_string,
                    tick_rate: doc.tick_rate,
                    handler_name: doc.handler_name,
                    size: self.tracker.count_by_stream(&handler.stream()),
                });
            }
        }

        // Relayed matches have no label index entry and no handler; they
        // are routing-only streams the tracker already knows the size of.
        if relayed_only || (filter.query.is_none() && filter.label.is_none()) {
            for (match_id, size) in self.tracker.count_by_stream_mode_filter(StreamMode::MatchRelayed) {
                candidates.push(MatchInfo {
                    match_id,
                    node: String::new(),
                    authoritative: false,
                    label: String::new(),
                    tick_rate: 0,
                    handler_name: String::new(),
                    size,
                });
            }
        }

        let mut results = Vec::new();
        for info in candidates {
            if let Some(node) = &filter.node {
                if &info.node != node {
                    continue;
                }
            }
            if let Some(authoritative) = filter.authoritative {
                if info.authoritative != authoritative {
                    continue;
                }
            }
            if info.size == 0 {
                let empty_eligible = matches!(filter.min_size, None | Some(0));
                if !empty_eligible {
                    continue;
                }
            } else if let Some(min_size) = filter.min_size {
                if info.size < min_size {
                    continue;
                }
            }
            if let Some(max_size) = filter.max_size {
                if info.size > max_size {
                    continue;
                }
            }

            results.push(info);
            if filter.limit > 0 && results.len() >= filter.limit {
                break;
            }
        }
        results
    }

    /// §4.F `Stop`: `grace == 0` closes every handler immediately;
    /// otherwise every handler is asked to terminate with that grace
    /// period and this call returns once they have all stopped.
    pub async fn stop(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let handlers: Vec<Arc<MatchHandler>> = self.handlers.iter().map(|e| e.clone()).collect();
        if grace.is_zero() {
            for handler in &handlers {
                handler.close().await;
            }
        } else {
            for handler in &handlers {
                handler.terminate(grace).await;
            }
        }
        let deadline = tokio::time::Instant::now() + grace + Duration::from_secs(1);
        while !self.handlers.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

impl Drop for MatchRegistry {
    fn drop(&mut self) {
        self.batch_cancel.notify_one();
    }
}

/// Match labels are free-form strings on the wire but indexed as parsed
/// JSON when they look like a JSON object; non-JSON labels index as
/// `{"text": "<label>"}` so `MatchQuery`/`QueryStringQuery` still resolve
/// a single implicit field.
fn parse_label_json(label: &str) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(label) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => {
            let mut map = serde_json::Map::new();
            map.insert("text".to_string(), serde_json::Value::String(label.to_string()));
            map
        }
    }
}

impl MatchEventSink for MatchRegistry {
    fn on_match_join(&self, match_id: Uuid, joins: Vec<Presence>) {
        if let Some(handler) = self.handler(match_id) {
            handler.notify_join(joins);
        }
    }

    fn on_match_leave(&self, match_id: Uuid, leaves: Vec<Presence>) {
        if let Some(handler) = self.handler(match_id) {
            handler.notify_leave(leaves);
        }
    }
}
