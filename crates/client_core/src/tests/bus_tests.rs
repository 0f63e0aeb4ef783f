use super::*;
use chrono::Utc;
use shared::domain::{ChannelId, MessageId, MessageScope, UserId};
use std::time::Duration;
use tokio::time::timeout;

fn entry(user: i64, channel: i64) -> TypingPresenceEntry {
    TypingPresenceEntry {
        user_id: UserId(user),
        channel_id: ChannelId(channel),
        started_at: Utc::now(),
    }
}

#[tokio::test]
async fn data_changes_reach_only_subscribers_of_the_topic() {
    let hub = LocalHub::new();
    let bus = hub.connect();
    let general = Topic::messages(MessageScope::Channel(ChannelId(1)));
    let random = Topic::messages(MessageScope::Channel(ChannelId(2)));

    let mut general_stream = bus.subscribe_data(general).await.expect("subscribe");
    let mut random_stream = bus.subscribe_data(random).await.expect("subscribe");

    hub.publish_data(general, DataChange::Delete { id: MessageId(5) });

    let got = timeout(Duration::from_secs(1), general_stream.next())
        .await
        .expect("event in time")
        .expect("stream open");
    assert_eq!(got, DataChange::Delete { id: MessageId(5) });
    assert!(timeout(Duration::from_millis(50), random_stream.next())
        .await
        .is_err());
}

#[tokio::test]
async fn presence_subscription_starts_with_a_snapshot() {
    let hub = LocalHub::new();
    let alice = hub.connect();
    let bob = hub.connect();
    let topic = Topic::typing(ChannelId(3));

    alice
        .publish_presence(topic, entry(1, 3))
        .await
        .expect("track");

    let mut stream = bob.subscribe_presence(topic).await.expect("subscribe");
    match stream.next().await.expect("snapshot") {
        PresenceEvent::Sync(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].user_id, UserId(1));
        }
        other => panic!("expected sync, got {other:?}"),
    }

    alice.withdraw_presence(topic).await.expect("untrack");
    match stream.next().await.expect("leave") {
        PresenceEvent::Leave(entries) => assert_eq!(entries[0].user_id, UserId(1)),
        other => panic!("expected leave, got {other:?}"),
    }
}

#[tokio::test]
async fn unsubscribe_ends_open_streams() {
    let hub = LocalHub::new();
    let bus = hub.connect();
    let topic = Topic::messages(MessageScope::Channel(ChannelId(4)));
    let mut stream = bus.subscribe_data(topic).await.expect("subscribe");

    bus.unsubscribe(topic).await.expect("unsubscribe");

    let ended = timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream finishes");
    assert!(ended.is_none());
}

#[tokio::test]
async fn dropping_a_connection_withdraws_its_presence() {
    let hub = LocalHub::new();
    let watcher = hub.connect();
    let topic = Topic::typing(ChannelId(9));
    let mut stream = watcher.subscribe_presence(topic).await.expect("subscribe");
    let _ = stream.next().await;

    {
        let typist = hub.connect();
        typist
            .publish_presence(topic, entry(2, 9))
            .await
            .expect("track");
        assert!(matches!(
            stream.next().await,
            Some(PresenceEvent::Join(_))
        ));
    }

    match timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("leave in time")
    {
        Some(PresenceEvent::Leave(entries)) => assert_eq!(entries[0].user_id, UserId(2)),
        other => panic!("expected leave, got {other:?}"),
    }
    assert!(hub.presence_snapshot(topic).is_empty());
}

#[tokio::test]
async fn topics_stay_open_until_the_last_holder_unsubscribes() {
    let hub = LocalHub::new();
    let bus = hub.connect();
    let topic = Topic::messages(MessageScope::Channel(ChannelId(6)));
    let _first = bus.subscribe_data(topic).await.expect("subscribe");
    let mut second = bus.subscribe_data(topic).await.expect("subscribe");

    bus.unsubscribe(topic).await.expect("unsubscribe");
    hub.publish_data(topic, DataChange::Delete { id: MessageId(7) });
    let got = timeout(Duration::from_secs(1), second.next())
        .await
        .expect("event in time");
    assert_eq!(got, Some(DataChange::Delete { id: MessageId(7) }));

    bus.unsubscribe(topic).await.expect("unsubscribe");
    let ended = timeout(Duration::from_secs(1), second.next())
        .await
        .expect("stream finishes");
    assert!(ended.is_none());
}

#[tokio::test]
async fn shared_presence_is_withdrawn_by_the_last_holder() {
    let hub = LocalHub::new();
    let bus = hub.connect();
    let topic = Topic::typing(ChannelId(8));

    bus.publish_presence(topic, entry(1, 8)).await.expect("track");
    bus.publish_presence(topic, entry(1, 8)).await.expect("track");
    bus.withdraw_presence(topic).await.expect("untrack");
    assert_eq!(hub.presence_snapshot(topic).len(), 1);

    bus.withdraw_presence(topic).await.expect("untrack");
    assert!(hub.presence_snapshot(topic).is_empty());
}
