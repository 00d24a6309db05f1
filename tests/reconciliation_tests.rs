use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatsync::core::error::RemoteError;
use chatsync::core::ids::UuidGenerator;
use chatsync::core::models::{ConversationKind, Message, MessageKind, MessageStatus, NetworkStatus};
use chatsync::remote::memory::MemoryRemote;
use chatsync::remote::{ConversationDoc, MessageDoc};
use chatsync::sync::bridge::SubscriptionKey;
use chatsync::sync::connectivity::ConnectivityMonitor;
use chatsync::{CacheHandle, ChatSession, Config};

fn open_session(cache: &CacheHandle, remote: &Arc<MemoryRemote>) -> ChatSession {
    let config = Config {
        data_dir: std::env::temp_dir(),
        database_file: "unused.db".into(),
        read_receipt_window_ms: 20,
        max_delivery_attempts: None,
    };
    ChatSession::open(
        "u1",
        config,
        cache.clone(),
        remote.clone(),
        ConnectivityMonitor::with_status(NetworkStatus::online()),
        Arc::new(UuidGenerator),
    )
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn doc(id: &str, timestamp: i64, status: MessageStatus) -> MessageDoc {
    MessageDoc {
        id: id.into(),
        conversation_id: "c1".into(),
        sender_id: "u2".into(),
        kind: Some(MessageKind::Text),
        content: Some(format!("text of {id}")),
        timestamp: Some(timestamp),
        status: Some(status),
        ..Default::default()
    }
}

fn cached(id: &str, timestamp: i64, status: MessageStatus) -> Message {
    Message {
        id: id.into(),
        conversation_id: "c1".into(),
        sender_id: "u2".into(),
        kind: MessageKind::Text,
        content: format!("text of {id}"),
        image_url: None,
        timestamp,
        status,
        delivered_to: BTreeSet::new(),
        read_by: BTreeSet::new(),
        local_id: None,
    }
}

#[tokio::test]
async fn snapshot_wins_over_stale_cache() {
    let cache = CacheHandle::open_in_memory().unwrap();
    cache
        .upsert_message(cached("m1", 10, MessageStatus::Sent))
        .await
        .unwrap();

    let remote = Arc::new(MemoryRemote::new());
    remote.put_message(doc("m2", 20, MessageStatus::Sent));
    remote.put_message(doc("m1", 10, MessageStatus::Read));

    let session = open_session(&cache, &remote);
    let first = session.load_messages("c1").await.unwrap();
    assert_eq!(first, vec![cached("m1", 10, MessageStatus::Sent)]);

    let s = &session;
    wait_for(move || async move { s.view_revision("c1") >= 1 }).await;

    let expected = vec![
        cached("m1", 10, MessageStatus::Read),
        cached("m2", 20, MessageStatus::Sent),
    ];
    assert_eq!(cache.messages_for_conversation("c1").await.unwrap(), expected);
    assert_eq!(session.messages("c1"), expected);

    session.shutdown().await;
}

#[tokio::test]
async fn repeated_loads_keep_one_listener() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.put_message(doc("m1", 10, MessageStatus::Sent));
    let session = open_session(&cache, &remote);

    session.load_messages("c1").await.unwrap();
    session.load_messages("c1").await.unwrap();

    let r = &remote;
    wait_for(move || async move { r.message_listener_count("c1") == 1 }).await;
    assert_eq!(session.subscriptions().len(), 1);
    assert!(session
        .subscriptions()
        .is_active(&SubscriptionKey::Messages("c1".into())));

    let s = &session;
    wait_for(move || async move { s.messages("c1").len() == 1 }).await;
    // Let the surviving listener's first snapshot land
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = session.view_revision("c1");

    // One more remote change is applied exactly once
    remote.put_message(doc("m2", 20, MessageStatus::Sent));
    wait_for(move || async move { s.messages("c1").len() == 2 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.view_revision("c1"), settled + 1);

    session.shutdown().await;
}

#[tokio::test]
async fn listener_error_is_reported_and_cache_kept() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.put_message(doc("m1", 10, MessageStatus::Sent));
    let session = open_session(&cache, &remote);

    session.load_messages("c1").await.unwrap();
    let s = &session;
    wait_for(move || async move { s.messages("c1").len() == 1 }).await;

    remote.fail_message_listeners("c1", RemoteError::PermissionDenied("rules".into()));
    wait_for(move || async move { s.view_error("c1").is_some() }).await;

    assert!(session.view_error("c1").unwrap().contains("rules"));
    assert_eq!(cache.messages_for_conversation("c1").await.unwrap().len(), 1);
    assert_eq!(session.messages("c1").len(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn closing_releases_listener_and_flushes_receipts() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.put_message(doc("m1", 10, MessageStatus::Sent));
    remote.put_message(doc("m2", 20, MessageStatus::Sent));
    let session = open_session(&cache, &remote);

    session.load_messages("c1").await.unwrap();
    session.mark_read("c1", "m1");
    session.mark_read("c1", "m2");
    session.mark_read("c1", "m1");
    session.close_conversation("c1").await;

    assert_eq!(
        remote.read_batches(),
        vec![vec!["m1".to_string(), "m2".to_string()]]
    );
    assert!(session.subscriptions().is_empty());
    assert!(session.messages("c1").is_empty());

    let r = &remote;
    wait_for(move || async move { r.message_listener_count("c1") == 0 }).await;

    session.shutdown().await;
}

#[tokio::test]
async fn read_receipts_batch_after_quiet_period() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.put_message(doc("m1", 10, MessageStatus::Sent));
    remote.put_message(doc("m2", 20, MessageStatus::Sent));
    let session = open_session(&cache, &remote);
    session.load_messages("c1").await.unwrap();

    session.mark_read("c1", "m2");
    session.mark_read("c1", "m1");

    let r = &remote;
    wait_for(move || async move { !r.read_batches().is_empty() }).await;
    assert_eq!(
        remote.read_batches(),
        vec![vec!["m1".to_string(), "m2".to_string()]]
    );

    let s = &session;
    wait_for(move || async move {
        s.messages("c1")
            .iter()
            .all(|m| m.read_by.contains("u1"))
    })
    .await;
    assert_eq!(session.flush_read_receipts("c1").await.unwrap(), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn delivery_acknowledged_once() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.put_message(doc("m1", 10, MessageStatus::Sent));
    let session = open_session(&cache, &remote);
    session.load_messages("c1").await.unwrap();

    let s = &session;
    wait_for(move || async move { s.messages("c1").len() == 1 }).await;
    assert_eq!(session.acknowledge_delivery("c1").await.unwrap(), 1);

    wait_for(move || async move {
        s.messages("c1")[0].delivered_to.contains("u1")
    })
    .await;
    assert_eq!(session.acknowledge_delivery("c1").await.unwrap(), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn conversation_list_follows_remote() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.put_conversation(ConversationDoc {
        id: "stale".into(),
        kind: ConversationKind::Direct,
        name: None,
        participants: vec!["u1".into(), "u9".into()],
        last_message: Some("old".into()),
        last_message_timestamp: Some(5),
        group_picture_url: None,
        created_at: Some(1),
        created_by: "u9".into(),
    });
    let session = open_session(&cache, &remote);

    assert!(session.load_conversations().await.unwrap().is_empty());
    let s = &session;
    wait_for(move || async move { s.conversations().len() == 1 }).await;

    let id = session
        .create_conversation(&["u2", "u3"], ConversationKind::Group, Some("trip"))
        .await
        .unwrap();
    wait_for(move || async move { s.conversations().len() == 2 }).await;

    let created = cache.get_conversation(&id).await.unwrap().unwrap();
    assert_eq!(created.name.as_deref(), Some("trip"));
    assert!(created.has_participant("u1"));
    assert_eq!(created.participants.len(), 3);

    // Quiet conversations sort after ones with activity
    let order: Vec<String> = session.conversations().into_iter().map(|c| c.id).collect();
    assert_eq!(order, vec!["stale".to_string(), id]);

    session.shutdown().await;
}
