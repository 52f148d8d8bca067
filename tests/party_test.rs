//! Party Handler scenario S5 (closed-party join flow) and invariant Y3
//! (exactly one leader while the party is non-empty).

mod support;

use std::sync::Arc;
use std::time::Duration;

use nakama_core::collab::{NullMatchmaker, SharedMatchmaker};
use nakama_core::config::{PartyConfig, TrackerConfig};
use nakama_core::error::CoreError;
use nakama_core::metrics::CoreMetrics;
use nakama_core::router::MessageRouter;
use nakama_core::session::{Session, SessionRegistry};
use nakama_core::types::{PresenceId, PresenceMeta, WireFormat};
use nakama_core::{PartyRegistry, PresenceTracker};
use support::{wait_until, RecordingSink};
use uuid::Uuid;

fn new_parties() -> (Arc<PartyRegistry>, Arc<PresenceTracker>, Arc<SessionRegistry>) {
    let sessions = Arc::new(SessionRegistry::new());
    let router = Arc::new(MessageRouter::new());
    let metrics = Arc::new(CoreMetrics::standalone());
    let tracker = PresenceTracker::new("node-a", TrackerConfig::default(), metrics, sessions.clone(), router.clone());
    let matchmaker: SharedMatchmaker = Arc::new(NullMatchmaker);
    let parties = Arc::new(PartyRegistry::new("node-a", PartyConfig::default(), tracker.clone(), sessions.clone(), router, matchmaker));
    tracker.set_party_hook(parties.clone());
    (parties, tracker, sessions)
}

fn connect(sessions: &SessionRegistry) -> (Uuid, Arc<RecordingSink>) {
    let session_id = Uuid::new_v4();
    let sink = RecordingSink::new();
    sessions.register(Arc::new(Session::new(session_id, Uuid::new_v4(), WireFormat::Json, sink.clone())));
    (session_id, sink)
}

#[tokio::test]
async fn s5_closed_party_join_request_then_leader_accept() {
    let (parties, _tracker, sessions) = new_parties();
    let (leader_session, leader_sink) = connect(&sessions);
    let leader_user = Uuid::new_v4();
    let party_id = parties.create(false, Some(4), leader_session, leader_user, "alice").unwrap();

    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().leader.is_some()).await);
    let snapshot = parties.snapshot(party_id).unwrap();
    let leader = snapshot.leader.clone().unwrap();
    assert_eq!(snapshot.members.len(), 1);

    let (joiner_session, joiner_sink) = connect(&sessions);
    let joiner_user = Uuid::new_v4();
    let joined_immediately = parties
        .join_request(party_id, joiner_session, joiner_user, PresenceMeta::new(WireFormat::Json, "bob"))
        .unwrap();
    assert!(!joined_immediately, "a closed party must queue the request for leader approval");

    assert!(wait_until(Duration::from_secs(1), || leader_sink.count() >= 1).await, "leader must receive the join request notification");

    let requests = parties.join_request_list(party_id, &leader).unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_id, joiner_user);
    let target = requests[0].presence_id.clone();

    parties
        .accept(party_id, &leader, &target, joiner_session, PresenceMeta::new(WireFormat::Json, "bob"))
        .unwrap();

    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().members.len() == 2).await);
    assert!(wait_until(Duration::from_secs(1), || joiner_sink.count() >= 1).await, "the new member must receive the updated membership snapshot");

    let final_snapshot = parties.snapshot(party_id).unwrap();
    assert_eq!(final_snapshot.members.len(), 2);
    assert_eq!(final_snapshot.leader, Some(leader));
}

#[tokio::test]
async fn leader_reelects_when_the_current_leader_leaves() {
    let (parties, tracker, sessions) = new_parties();
    let (first_session, _first_sink) = connect(&sessions);
    let first_user = Uuid::new_v4();
    let party_id = parties.create(true, Some(4), first_session, first_user, "alice").unwrap();
    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().leader.is_some()).await);

    let (second_session, _second_sink) = connect(&sessions);
    let second_user = Uuid::new_v4();
    parties.join(party_id, second_session, second_user, PresenceMeta::new(WireFormat::Json, "bob")).unwrap();
    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().members.len() == 2).await);

    let stream = {
        // Leaving is a presence-tracker operation keyed on the party's stream.
        let snapshot = parties.snapshot(party_id).unwrap();
        assert_eq!(snapshot.leader.as_ref().map(|l| l.session_id), Some(first_session));
        nakama_core::types::PresenceStream::new(nakama_core::types::StreamMode::Party, party_id)
    };
    tracker.untrack(first_session, stream, first_user);

    assert!(
        wait_until(Duration::from_secs(1), || {
            parties.snapshot(party_id).map(|s| s.leader.as_ref().map(|l| l.session_id) == Some(second_session)).unwrap_or(false)
        })
        .await,
        "the remaining member must become leader once the old leader leaves"
    );
    assert_eq!(parties.snapshot(party_id).unwrap().members.len(), 1);
}

#[tokio::test]
async fn remove_rejects_self_removal() {
    let (parties, _tracker, sessions) = new_parties();
    let (leader_session, _leader_sink) = connect(&sessions);
    let leader_user = Uuid::new_v4();
    let party_id = parties.create(true, Some(4), leader_session, leader_user, "alice").unwrap();
    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().leader.is_some()).await);

    let leader = PresenceId { node: "node-a".to_string(), session_id: leader_session };
    let err = parties.remove(party_id, &leader, &leader).unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));
    assert_eq!(parties.snapshot(party_id).unwrap().members.len(), 1, "self-removal must not remove the member");
}

#[tokio::test]
async fn remove_notifies_the_kicked_member_with_party_close() {
    let (parties, _tracker, sessions) = new_parties();
    let (leader_session, _leader_sink) = connect(&sessions);
    let leader_user = Uuid::new_v4();
    let party_id = parties.create(true, Some(4), leader_session, leader_user, "alice").unwrap();
    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().leader.is_some()).await);

    let (member_session, member_sink) = connect(&sessions);
    let member_user = Uuid::new_v4();
    parties.join(party_id, member_session, member_user, PresenceMeta::new(WireFormat::Json, "bob")).unwrap();
    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().members.len() == 2).await);

    let leader = PresenceId { node: "node-a".to_string(), session_id: leader_session };
    let member = PresenceId { node: "node-a".to_string(), session_id: member_session };
    parties.remove(party_id, &leader, &member).unwrap();

    assert!(
        wait_until(Duration::from_secs(1), || member_sink.count() >= 1).await,
        "the kicked member must receive an explicit PartyClose envelope"
    );
    assert!(wait_until(Duration::from_secs(1), || parties.snapshot(party_id).unwrap().members.len() == 1).await);
}
