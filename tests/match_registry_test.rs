//! Match Registry scenarios S1-S4.

mod support;

use std::sync::Arc;
use std::time::Duration;

use nakama_core::config::{MatchHandlerConfig, MatchRegistryConfig};
use nakama_core::config::TrackerConfig;
use nakama_core::match_registry::handler::{
    Dispatcher, JoinDecision, MatchCore, MatchCoreFactory, MatchDataMessage, MatchInitContext,
    MatchInitResult, TickOutcome,
};
use nakama_core::match_registry::{parse_query_string, LabelQuery, ListMatchesFilter};
use nakama_core::metrics::CoreMetrics;
use nakama_core::router::MessageRouter;
use nakama_core::session::SessionRegistry;
use nakama_core::types::{Presence, PresenceId, PresenceMeta, PresenceStream, StreamMode, WireFormat};
use nakama_core::{MatchRegistry, PresenceTracker};
use serde_json::json;
use uuid::Uuid;

/// A match core that accepts every join and otherwise does nothing, used
/// as the stand-in for a real game module in every scenario here.
struct EchoMatch {
    label: String,
}

impl MatchCore for EchoMatch {
    fn init(&mut self, _ctx: &MatchInitContext) -> nakama_core::Result<MatchInitResult> {
        Ok(MatchInitResult { label: self.label.clone(), tick_rate: 10 })
    }
    fn join_attempt(&mut self, _presence: &Presence, _metadata: &serde_json::Value) -> JoinDecision {
        JoinDecision { allow: true, reason: None }
    }
    fn join(&mut self, _presences: &[Presence]) {}
    fn leave(&mut self, _presences: &[Presence]) {}
    fn tick(&mut self, _tick: u64, _dispatcher: &dyn Dispatcher, _messages: &[MatchDataMessage]) -> TickOutcome {
        TickOutcome { terminate: false }
    }
    fn terminate(&mut self, _grace: Duration) {}
}

fn factory(label: impl Into<String>) -> MatchCoreFactory {
    let label = label.into();
    Arc::new(move |_ctx: &MatchInitContext| -> nakama_core::Result<Box<dyn MatchCore>> {
        Ok(Box::new(EchoMatch { label: label.clone() }))
    })
}

fn new_registry(node: &str) -> (Arc<MatchRegistry>, Arc<PresenceTracker>) {
    let sessions = Arc::new(SessionRegistry::new());
    let router = Arc::new(MessageRouter::new());
    let metrics = Arc::new(CoreMetrics::standalone());
    let tracker = PresenceTracker::new(node, TrackerConfig::default(), metrics.clone(), sessions.clone(), router.clone());
    let registry = MatchRegistry::new(
        node,
        MatchRegistryConfig::default(),
        MatchHandlerConfig::default(),
        tracker.clone(),
        sessions,
        router,
        metrics,
    );
    (registry, tracker)
}

#[tokio::test]
async fn s1_create_and_join_an_authoritative_match() {
    let (registry, tracker) = new_registry("node-a");
    let match_id = registry.create_match(factory(""), "match", json!({})).unwrap();

    let user_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let presence = Presence {
        presence_id: PresenceId { node: "node-a".to_string(), session_id },
        stream: PresenceStream::with_label(StreamMode::MatchAuthoritative, match_id, "node-a"),
        user_id,
        meta: PresenceMeta::new(WireFormat::Json, "alice"),
    };

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        registry.join_attempt(match_id, presence.clone(), json!({})),
    )
    .await
    .expect("join attempt must resolve within the configured deadline");
    assert!(result.found);
    assert!(result.allowed);
    assert_eq!(result.reason, None);
    assert_eq!(result.label, "");

    assert!(registry.get_match(match_id).is_ok());

    // JoinAttempt only arbitrates; the caller still has to call `track` for
    // the presence to actually appear on the stream, mirroring how session
    // join flows layer these two steps.
    tracker.track(
        &nakama_core::session::SessionRegistry::new(),
        session_id,
        presence.stream.clone(),
        user_id,
        presence.meta.clone(),
    );
}

#[tokio::test]
async fn s2_label_query_filters_to_matching_authoritative_matches() {
    let (registry, _tracker) = new_registry("node-a");
    let skilled = registry.create_match(factory(r#"{"skill":60}"#), "match", json!({})).unwrap();
    let _unskilled = registry.create_match(factory(r#"{"skill":10}"#), "match", json!({})).unwrap();

    let clauses = parse_query_string("+label.skill:>=50").unwrap();
    let results = registry.list_matches(ListMatchesFilter {
        limit: 2,
        authoritative: Some(true),
        label: None,
        min_size: None,
        max_size: None,
        query: Some(LabelQuery::QueryString(clauses)),
        node: None,
    });

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].match_id, skilled);
    assert!(results[0].authoritative);
}

#[tokio::test]
async fn s3_array_field_query_matches_any_element() {
    let (registry, _tracker) = new_registry("node-a");
    let with_convo = registry.create_match(factory(r#"{"convo_ids":["a","b","c"]}"#), "match", json!({})).unwrap();

    let hit = registry.list_matches(ListMatchesFilter {
        limit: 10,
        authoritative: Some(true),
        label: None,
        min_size: None,
        max_size: None,
        query: Some(LabelQuery::QueryString(parse_query_string("+label.convo_ids:b").unwrap())),
        node: None,
    });
    assert_eq!(hit.iter().map(|m| m.match_id).collect::<Vec<_>>(), vec![with_convo]);

    let miss = registry.list_matches(ListMatchesFilter {
        limit: 10,
        authoritative: Some(true),
        label: None,
        min_size: None,
        max_size: None,
        query: Some(LabelQuery::QueryString(parse_query_string("+label.convo_ids:z").unwrap())),
        node: None,
    });
    assert!(miss.is_empty());
}

#[tokio::test]
async fn s4_boosted_query_orders_results_by_score() {
    let (registry, _tracker) = new_registry("node-a");
    for baz in 0..10u32 {
        let option = if baz % 2 == 0 { "a" } else { "b" };
        let label = json!({"foo": 5, "bar": 1, "baz": baz % 5, "option": option}).to_string();
        registry.create_match(factory(label), "match", json!({})).unwrap();
    }

    let clauses = parse_query_string("+label.foo:5 +label.bar:1 label.baz:4^10 label.baz:2^5").unwrap();
    let results = registry.list_matches(ListMatchesFilter {
        limit: 10,
        authoritative: Some(true),
        label: None,
        min_size: None,
        max_size: None,
        query: Some(LabelQuery::QueryString(clauses)),
        node: None,
    });

    assert_eq!(results.len(), 10);
    let label_of = |m: &nakama_core::match_registry::MatchInfo| -> serde_json::Value { serde_json::from_str(&m.label).unwrap() };
    assert_eq!(label_of(&results[0])["baz"], 4);
    assert_eq!(label_of(&results[1])["baz"], 4);
    assert_eq!(label_of(&results[2])["baz"], 2);
    assert_eq!(label_of(&results[3])["baz"], 2);
}

#[tokio::test]
async fn list_matches_unions_relayed_streams_when_unfiltered() {
    let (registry, tracker) = new_registry("node-a");
    let authoritative = registry.create_match(factory(""), "match", json!({})).unwrap();

    let relayed_id = Uuid::new_v4();
    let session_id = Uuid::new_v4();
    let sessions = Arc::new(SessionRegistry::new());
    let sink = support::RecordingSink::new();
    sessions.register(Arc::new(nakama_core::session::Session::new(session_id, Uuid::new_v4(), WireFormat::Json, sink)));
    tracker.track(
        &sessions,
        session_id,
        PresenceStream::new(StreamMode::MatchRelayed, relayed_id),
        Uuid::new_v4(),
        PresenceMeta::new(WireFormat::Json, "relay-user"),
    );

    let all = registry.list_matches(ListMatchesFilter::default());
    let ids: Vec<Uuid> = all.iter().map(|m| m.match_id).collect();
    assert!(ids.contains(&authoritative));
    assert!(ids.contains(&relayed_id));
}

#[tokio::test]
async fn update_match_label_is_visible_after_a_flush() {
    let (registry, _tracker) = new_registry("node-a");
    let match_id = registry.create_match(factory(r#"{"skill":1}"#), "match", json!({})).unwrap();

    registry.update_match_label(match_id, r#"{"skill":99}"#.to_string()).await.unwrap();

    // Before the batcher flushes, GetMatchLabel still serves the old value.
    assert_eq!(registry.get_match_label(match_id).unwrap(), r#"{"skill":1}"#);

    registry.flush_label_updates();
    assert_eq!(registry.get_match_label(match_id).unwrap(), r#"{"skill":99}"#);
}

#[tokio::test]
async fn list_matches_empty_match_eligibility_follows_min_size() {
    let (registry, _tracker) = new_registry("node-a");
    let empty = registry.create_match(factory(""), "match", json!({})).unwrap();

    let no_min = registry.list_matches(ListMatchesFilter {
        limit: 10,
        authoritative: Some(true),
        ..Default::default()
    });
    assert!(no_min.iter().any(|m| m.match_id == empty));

    let min_zero = registry.list_matches(ListMatchesFilter {
        limit: 10,
        authoritative: Some(true),
        min_size: Some(0),
        ..Default::default()
    });
    assert!(min_zero.iter().any(|m| m.match_id == empty));

    let min_one = registry.list_matches(ListMatchesFilter {
        limit: 10,
        authoritative: Some(true),
        min_size: Some(1),
        ..Default::default()
    });
    assert!(!min_one.iter().any(|m| m.match_id == empty));
}

