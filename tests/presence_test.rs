//! Presence Tracker invariants and idempotence properties.

mod support;

use std::sync::Arc;
use std::time::Duration;

use nakama_core::config::TrackerConfig;
use nakama_core::metrics::CoreMetrics;
use nakama_core::router::MessageRouter;
use nakama_core::session::{Session, SessionRegistry};
use nakama_core::types::{PresenceMeta, PresenceReason, PresenceStream, StreamMode, WireFormat};
use nakama_core::PresenceTracker;
use support::{wait_until, RecordingSink};
use uuid::Uuid;

fn new_tracker() -> (Arc<PresenceTracker>, Arc<SessionRegistry>) {
    let sessions = Arc::new(SessionRegistry::new());
    let router = Arc::new(MessageRouter::new());
    let metrics = Arc::new(CoreMetrics::standalone());
    let tracker = PresenceTracker::new("node1", TrackerConfig::default(), metrics, sessions.clone(), router);
    (tracker, sessions)
}

fn connect(sessions: &SessionRegistry) -> Uuid {
    let session_id = Uuid::new_v4();
    let session = Arc::new(Session::new(session_id, Uuid::new_v4(), WireFormat::Json, RecordingSink::new()));
    sessions.register(session);
    session_id
}

#[tokio::test]
async fn track_is_a_bijection_between_by_session_and_by_stream() {
    let (tracker, sessions) = new_tracker();
    let session_id = connect(&sessions);
    let user_id = Uuid::new_v4();
    let stream = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());

    let result = tracker.track(&sessions, session_id, stream.clone(), user_id, PresenceMeta::new(WireFormat::Json, "alice"));
    assert!(result.success && result.is_new);
    assert_eq!(tracker.count(), 1);
    assert_eq!(tracker.count_by_stream(&stream), 1);
    assert_eq!(tracker.list_local_session_ids_by_stream(&stream), vec![session_id]);

    tracker.untrack(session_id, stream.clone(), user_id);
    assert_eq!(tracker.count(), 0);
    assert_eq!(tracker.count_by_stream(&stream), 0);
    assert!(tracker.list_by_stream(&stream, true, true).is_empty());
}

#[tokio::test]
async fn hidden_presence_is_counted_but_emits_no_events() {
    let (tracker, sessions) = new_tracker();
    let session_id = connect(&sessions);
    let user_id = Uuid::new_v4();
    let stream = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());
    let meta = PresenceMeta::new(WireFormat::Json, "ghost").hidden(true);

    let result = tracker.track(&sessions, session_id, stream.clone(), user_id, meta);
    assert!(result.success);
    assert_eq!(tracker.count(), 1, "hidden presences still count toward invariant 3");

    let visible = tracker.list_by_stream(&stream, false, true);
    assert!(visible.is_empty());
    let all = tracker.list_by_stream(&stream, true, true);
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn double_untrack_is_a_no_op() {
    let (tracker, sessions) = new_tracker();
    let session_id = connect(&sessions);
    let user_id = Uuid::new_v4();
    let stream = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());
    tracker.track(&sessions, session_id, stream.clone(), user_id, PresenceMeta::new(WireFormat::Json, "alice"));

    tracker.untrack(session_id, stream.clone(), user_id);
    assert_eq!(tracker.count(), 0);
    // Second untrack of the same (session, stream, user) has nothing to remove.
    tracker.untrack(session_id, stream, user_id);
    assert_eq!(tracker.count(), 0);
}

#[tokio::test]
async fn track_with_identical_meta_twice_stays_a_single_presence() {
    let (tracker, sessions) = new_tracker();
    let session_id = connect(&sessions);
    let user_id = Uuid::new_v4();
    let stream = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());
    let meta = PresenceMeta::new(WireFormat::Json, "alice");

    let first = tracker.track(&sessions, session_id, stream.clone(), user_id, meta.clone());
    let second = tracker.track(&sessions, session_id, stream.clone(), user_id, meta);
    assert!(first.is_new);
    assert!(!second.is_new, "re-tracking the same (session, stream, user) is an upsert, not a new join");
    assert_eq!(tracker.count_by_stream(&stream), 1);
}

#[tokio::test]
async fn update_with_unchanged_content_emits_nothing_but_changed_content_emits_leave_then_join() {
    let (tracker, sessions) = new_tracker();
    let session_id = connect(&sessions);
    let user_id = Uuid::new_v4();
    let stream = PresenceStream::new(StreamMode::Status, Uuid::new_v4());
    let meta = PresenceMeta::new(WireFormat::Json, "alice").status("idle");
    tracker.track(&sessions, session_id, stream.clone(), user_id, meta.clone());

    // Identical content: the record is refreshed but stays a single entry.
    tracker.update(session_id, stream.clone(), user_id, meta);
    assert_eq!(tracker.count_by_stream(&stream), 1);

    // Changed content: still exactly one presence, reason is Update.
    let changed = PresenceMeta::new(WireFormat::Json, "alice").status("busy");
    tracker.update(session_id, stream.clone(), user_id, changed);
    assert_eq!(tracker.count_by_stream(&stream), 1);
    let current = tracker.get_local(session_id, &stream, user_id).unwrap();
    assert_eq!(current.status.as_deref(), Some("busy"));
    assert_eq!(current.reason, PresenceReason::Update);
}

#[tokio::test]
async fn untrack_by_stream_drops_everyone_with_no_events() {
    let (tracker, sessions) = new_tracker();
    let stream = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());
    for _ in 0..3 {
        let session_id = connect(&sessions);
        tracker.track(&sessions, session_id, stream.clone(), Uuid::new_v4(), PresenceMeta::new(WireFormat::Json, "p"));
    }
    assert_eq!(tracker.count_by_stream(&stream), 3);

    tracker.untrack_by_stream(&stream);
    assert!(tracker.list_by_stream(&stream, true, true).is_empty());
    assert_eq!(tracker.count_by_stream(&stream), 0);
    assert!(!tracker.stream_exists(&stream));
}

#[tokio::test]
async fn untrack_local_by_modes_skips_the_excluded_stream() {
    let (tracker, sessions) = new_tracker();
    let session_id = connect(&sessions);
    let user_id = Uuid::new_v4();
    let channel = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());
    let status_stream = PresenceStream::new(StreamMode::Status, user_id);
    let keep = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());

    tracker.track(&sessions, session_id, channel.clone(), user_id, PresenceMeta::new(WireFormat::Json, "a"));
    tracker.track(&sessions, session_id, status_stream.clone(), user_id, PresenceMeta::new(WireFormat::Json, "a"));
    tracker.track(&sessions, session_id, keep.clone(), user_id, PresenceMeta::new(WireFormat::Json, "a"));

    tracker.untrack_local_by_modes(session_id, &[StreamMode::Channel, StreamMode::Status], Some(&keep));

    assert!(!tracker.stream_exists(&channel));
    assert!(!tracker.stream_exists(&status_stream));
    assert!(tracker.stream_exists(&keep), "the skip_stream argument must survive the sweep");
}

#[tokio::test]
async fn join_events_reach_a_second_subscriber_on_the_same_stream() {
    let (tracker, sessions) = new_tracker();
    tracker.set_status_hook(Arc::new(NullStatusSink));
    let stream = PresenceStream::new(StreamMode::Channel, Uuid::new_v4());

    let watcher_session = connect(&sessions);
    let watcher_sink = RecordingSink::new();
    sessions.register(Arc::new(Session::new(watcher_session, Uuid::new_v4(), WireFormat::Json, watcher_sink.clone())));
    tracker.track(&sessions, watcher_session, stream.clone(), Uuid::new_v4(), PresenceMeta::new(WireFormat::Json, "watcher"));

    let joiner_session = connect(&sessions);
    tracker.track(&sessions, joiner_session, stream.clone(), Uuid::new_v4(), PresenceMeta::new(WireFormat::Json, "joiner"));

    // The watcher's own join is delivered too, so two sends are expected in total.
    assert!(wait_until(Duration::from_secs(1), || watcher_sink.count() >= 2).await);
}

struct NullStatusSink;
impl nakama_core::presence::event::StatusEventSink for NullStatusSink {
    fn queue(&self, _user_id: Uuid, _joins: Vec<nakama_core::Presence>, _leaves: Vec<nakama_core::Presence>) {}
}
