//! Notification Service scenario S6 (cursor pagination) and invariant 6
//! (cursor encode/decode round-trip).

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use nakama_core::config::{NotificationConfig, TrackerConfig};
use nakama_core::metrics::CoreMetrics;
use nakama_core::notification::{InMemoryNotificationStore, Notification, NotificationCursor, NotificationRequest, NotificationStore};
use nakama_core::router::MessageRouter;
use nakama_core::session::SessionRegistry;
use nakama_core::{NotificationService, PresenceTracker};
use uuid::Uuid;

fn new_service() -> NotificationService {
    let sessions = Arc::new(SessionRegistry::new());
    let router = Arc::new(MessageRouter::new());
    let metrics = Arc::new(CoreMetrics::standalone());
    let tracker = PresenceTracker::new("node-a", TrackerConfig::default(), metrics, sessions.clone(), router.clone());
    let store: Arc<dyn NotificationStore> = Arc::new(InMemoryNotificationStore::new());
    NotificationService::new("node-a", NotificationConfig::default(), store, tracker, sessions, router)
}

fn notification(user_id: Uuid, subject: &str, expires_at: chrono::DateTime<Utc>) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id,
        subject: subject.to_string(),
        content: Vec::new(),
        code: 0,
        sender_id: None,
        create_time: Utc::now(),
        expires_at,
        persistent: true,
    }
}

#[tokio::test]
async fn s6_cursor_pagination_over_persistent_notifications() {
    let service = new_service();
    let user_id = Uuid::new_v4();
    let now = Utc::now();

    let mut requests = Vec::new();
    for (i, subject) in ["first", "second", "third"].iter().enumerate() {
        let n = notification(user_id, subject, now + ChronoDuration::minutes(i as i64 + 1));
        requests.push(NotificationRequest { notification: n, persist: true });
    }
    service.send(requests).await.unwrap();

    let page1 = service.list(user_id, 2, None).await.unwrap();
    assert_eq!(page1.notifications.len(), 2);
    assert_eq!(page1.notifications[0].subject, "first");
    assert_eq!(page1.notifications[1].subject, "second");
    let cursor1 = page1.next_cursor.expect("a full page must carry a cursor for the next one");

    let page2 = service.list(user_id, 2, Some(cursor1.encode())).await.unwrap();
    assert_eq!(page2.notifications.len(), 1);
    assert_eq!(page2.notifications[0].subject, "third");
    let cursor2 = page2.next_cursor.expect("the last page still carries a cursor");

    let page3 = service.list(user_id, 2, Some(cursor2.encode())).await.unwrap();
    assert!(page3.notifications.is_empty());
    assert_eq!(page3.next_cursor, Some(cursor2), "an empty page must return the cursor unchanged");
}

#[tokio::test]
async fn cursor_survives_an_encode_decode_round_trip() {
    let cursor = NotificationCursor { expires_at: Utc::now(), id: Uuid::new_v4() };
    let decoded = NotificationCursor::decode(&cursor.encode()).unwrap();
    assert_eq!(cursor, decoded);
}

#[tokio::test]
async fn remove_soft_deletes_so_future_lists_skip_it() {
    let service = new_service();
    let user_id = Uuid::new_v4();
    let n = notification(user_id, "gone", Utc::now() + ChronoDuration::minutes(5));
    let id = n.id;
    service.send(vec![NotificationRequest { notification: n, persist: true }]).await.unwrap();

    service.remove(user_id, &[id]).await.unwrap();

    let page = service.list(user_id, 10, None).await.unwrap();
    assert!(page.notifications.is_empty());
}
