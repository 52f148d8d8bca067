//! Status Registry: follow/unfollow bookkeeping and online-fill queries.

use std::collections::HashSet;
use std::sync::Arc;

use nakama_core::config::StatusConfig;
use nakama_core::metrics::CoreMetrics;
use nakama_core::router::MessageRouter;
use nakama_core::session::SessionRegistry;
use nakama_core::StatusRegistry;
use uuid::Uuid;

fn new_status() -> Arc<StatusRegistry> {
    let sessions = Arc::new(SessionRegistry::new());
    let router = Arc::new(MessageRouter::new());
    let metrics = Arc::new(CoreMetrics::standalone());
    StatusRegistry::new("node-a", StatusConfig::default(), metrics, sessions, router)
}

#[tokio::test]
async fn follow_unfollow_and_is_online_agree() {
    let status = new_status();
    let follower = Uuid::new_v4();
    let target = Uuid::new_v4();

    assert!(!status.is_online(target));
    assert!(status.follow(follower, target), "the first follow of a pair must report newly established");
    assert!(!status.follow(follower, target), "a repeat follow is not newly established");
    assert!(status.is_online(target));

    status.unfollow(follower, target);
    assert!(!status.is_online(target));
}

#[tokio::test]
async fn fill_online_reports_only_followed_users() {
    let status = new_status();
    let follower = Uuid::new_v4();
    let followed = Uuid::new_v4();
    let unfollowed = Uuid::new_v4();
    status.follow(follower, followed);

    let result = status.fill_online(&[followed, unfollowed]);
    assert_eq!(result, HashSet::from([followed]));
}

#[tokio::test]
async fn unfollow_all_drops_every_subscription_for_a_session() {
    let status = new_status();
    let session_id = Uuid::new_v4();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    status.follow(session_id, a);
    status.follow(session_id, b);

    status.unfollow_all(session_id);

    assert!(!status.is_online(a));
    assert!(!status.is_online(b));
}
