use super::*;
use chrono::Utc;
use shared::{
    domain::{ChannelKind, Message, MessageId, Reactions, ThreadId},
    protocol::DataChange,
};
use storage::Storage;

use crate::{bus::LocalHub, persistence::EmbeddedBackend};

struct World {
    hub: Arc<LocalHub>,
    backend: Arc<EmbeddedBackend>,
    alice: UserId,
    bob: UserId,
    scope: MessageScope,
}

async fn world() -> World {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("alice");
    let bob = storage.create_user("bob").await.expect("bob");
    let server = storage.create_server("home", alice).await.expect("server");
    let channel = storage
        .create_channel(server, "general", ChannelKind::Text)
        .await
        .expect("channel");
    let hub = LocalHub::new();
    World {
        backend: Arc::new(EmbeddedBackend::new(storage, Arc::clone(&hub))),
        hub,
        alice,
        bob,
        scope: MessageScope::Channel(channel),
    }
}

async fn open(world: &World, me: UserId) -> ConversationView {
    ConversationView::open(
        me,
        world.scope,
        Arc::new(world.hub.connect()),
        world.backend.clone(),
        ViewOptions::default(),
    )
    .await
    .expect("open view")
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn stray_message(id: i64, scope: MessageScope) -> Message {
    let now = Utc::now();
    Message {
        id: MessageId(id),
        scope,
        sender_id: UserId(77),
        content: "late".into(),
        created_at: now,
        updated_at: now,
        is_deleted: false,
        is_edited: false,
        edited_at: None,
        parent_message_id: None,
        reactions: Reactions::new(),
    }
}

#[tokio::test]
async fn send_and_echo_leave_a_single_entry_in_every_view() {
    let w = world().await;
    let alice = open(&w, w.alice).await;
    let bob = open(&w, w.bob).await;

    let sent = alice.messages().send("hello", None).await.expect("send");

    let bob_store = Arc::clone(bob.messages());
    wait_until(|| {
        let store = Arc::clone(&bob_store);
        async move { store.entries().await.len() == 1 }
    })
    .await;
    // Give the echo time to reach the sender's own view as well.
    tokio::time::sleep(Duration::from_millis(20)).await;

    for view in [&alice, &bob] {
        let entries = view.messages().entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message_id(), Some(sent.id));
        assert_eq!(entries[0].content(), "hello");
        assert!(!entries[0].is_pending());
    }
}

#[tokio::test]
async fn typing_roster_spans_views_and_excludes_self() {
    let w = world().await;
    let alice = open(&w, w.alice).await;
    let bob = open(&w, w.bob).await;

    alice
        .typing()
        .expect("channel view tracks typing")
        .start_typing()
        .await
        .expect("start");

    let bob_typing = Arc::clone(bob.typing().expect("typing"));
    let alice_id = w.alice;
    wait_until(|| {
        let tracker = Arc::clone(&bob_typing);
        async move {
            tracker
                .roster()
                .await
                .iter()
                .any(|entry| entry.user_id == alice_id)
        }
    })
    .await;
    assert!(alice.typing().expect("typing").roster().await.is_empty());

    alice.close().await;
    wait_until(|| {
        let tracker = Arc::clone(&bob_typing);
        async move { tracker.roster().await.is_empty() }
    })
    .await;
}

#[tokio::test]
async fn closed_view_stops_receiving_changes() {
    let w = world().await;
    let view = open(&w, w.alice).await;
    let store = Arc::clone(view.messages());

    view.close().await;
    w.hub.publish_data(
        Topic::messages(w.scope),
        DataChange::Insert(stray_message(900, w.scope)),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.entries().await.is_empty());
}

#[tokio::test]
async fn dropped_view_releases_its_subscriptions() {
    let w = world().await;
    let view = open(&w, w.alice).await;
    let store = Arc::clone(view.messages());

    drop(view);
    tokio::time::sleep(Duration::from_millis(20)).await;
    w.hub.publish_data(
        Topic::messages(w.scope),
        DataChange::Insert(stray_message(901, w.scope)),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.entries().await.is_empty());
}

#[tokio::test]
async fn thread_views_have_no_typing_roster() {
    let w = world().await;
    let view = ConversationView::open(
        w.alice,
        MessageScope::Thread(ThreadId(1)),
        Arc::new(w.hub.connect()),
        w.backend.clone(),
        ViewOptions::default(),
    )
    .await
    .expect("open");
    assert!(view.typing().is_none());
    assert!(view.messages().entries().await.is_empty());
}

#[tokio::test]
async fn open_loads_the_newest_page() {
    let w = world().await;
    for text in ["one", "two", "three"] {
        w.backend
            .insert_message(w.alice, w.scope, text, None)
            .await
            .expect("seed");
    }

    let view = ConversationView::open(
        w.bob,
        w.scope,
        Arc::new(w.hub.connect()),
        w.backend.clone(),
        ViewOptions {
            page_size: 2,
            ..ViewOptions::default()
        },
    )
    .await
    .expect("open");
    let contents = view
        .messages()
        .entries()
        .await
        .iter()
        .map(|entry| entry.content().to_string())
        .collect::<Vec<_>>();
    assert_eq!(contents, vec!["two", "three"]);

    view.messages().load_older(2).await.expect("older");
    assert_eq!(view.messages().entries().await.len(), 3);
}

#[tokio::test]
async fn reopening_on_a_shared_bus_keeps_the_new_view_live() {
    let w = world().await;
    let bus: Arc<dyn RealtimeBus> = Arc::new(w.hub.connect());
    let reopen = || {
        ConversationView::open(
            w.alice,
            w.scope,
            Arc::clone(&bus),
            w.backend.clone(),
            ViewOptions::default(),
        )
    };
    let old = reopen().await.expect("old view");
    let new = reopen().await.expect("new view");
    let watcher = open(&w, w.bob).await;

    for view in [&old, &new] {
        view.typing()
            .expect("typing")
            .start_typing()
            .await
            .expect("start");
    }
    old.close().await;

    w.backend
        .insert_message(w.bob, w.scope, "after remount", None)
        .await
        .expect("insert");
    let store = Arc::clone(new.messages());
    wait_until(|| {
        let store = Arc::clone(&store);
        async move { store.entries().await.len() == 1 }
    })
    .await;

    // The surviving view still holds alice's typing entry.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let roster = watcher.typing().expect("typing").roster().await;
    assert_eq!(
        roster.iter().map(|entry| entry.user_id).collect::<Vec<_>>(),
        vec![w.alice]
    );
    assert!(new.typing().expect("typing").is_typing().await);
}
