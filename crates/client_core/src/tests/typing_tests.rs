use super::*;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bus::{DataStream, LocalHub, PresenceStream};

const ME: UserId = UserId(1);
const CHANNEL: ChannelId = ChannelId(7);

fn entry(user: i64, channel: ChannelId) -> TypingPresenceEntry {
    TypingPresenceEntry {
        user_id: UserId(user),
        channel_id: channel,
        started_at: Utc::now(),
    }
}

#[derive(Default)]
struct CountingBus {
    published: AtomicUsize,
    withdrawn: AtomicUsize,
}

#[async_trait]
impl RealtimeBus for CountingBus {
    async fn subscribe_data(&self, _topic: Topic) -> Result<DataStream> {
        Ok(futures::stream::empty().boxed())
    }

    async fn subscribe_presence(&self, _topic: Topic) -> Result<PresenceStream> {
        Ok(futures::stream::empty().boxed())
    }

    async fn unsubscribe(&self, _topic: Topic) -> Result<()> {
        Ok(())
    }

    async fn publish_presence(&self, _topic: Topic, _entry: TypingPresenceEntry) -> Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn withdraw_presence(&self, _topic: Topic) -> Result<()> {
        self.withdrawn.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn roster_never_contains_the_local_user() {
    let tracker = TypingTracker::new(
        ME,
        CHANNEL,
        Arc::new(CountingBus::default()),
        DEFAULT_TYPING_DEBOUNCE,
    );

    tracker
        .apply_presence(PresenceEvent::Sync(vec![entry(1, CHANNEL), entry(2, CHANNEL)]))
        .await;
    tracker
        .apply_presence(PresenceEvent::Join(vec![entry(1, CHANNEL)]))
        .await;

    let roster = tracker.roster().await;
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].user_id, UserId(2));
}

#[tokio::test]
async fn sync_replaces_and_leave_removes() {
    let tracker = TypingTracker::new(
        ME,
        CHANNEL,
        Arc::new(CountingBus::default()),
        DEFAULT_TYPING_DEBOUNCE,
    );

    tracker
        .apply_presence(PresenceEvent::Join(vec![entry(2, CHANNEL), entry(3, CHANNEL)]))
        .await;
    tracker
        .apply_presence(PresenceEvent::Join(vec![entry(4, ChannelId(99))]))
        .await;
    assert_eq!(tracker.roster().await.len(), 2);

    tracker
        .apply_presence(PresenceEvent::Leave(vec![entry(2, CHANNEL)]))
        .await;
    assert_eq!(
        tracker
            .roster()
            .await
            .iter()
            .map(|e| e.user_id)
            .collect::<Vec<_>>(),
        vec![UserId(3)]
    );

    tracker
        .apply_presence(PresenceEvent::Sync(vec![entry(5, CHANNEL)]))
        .await;
    assert_eq!(
        tracker
            .roster()
            .await
            .iter()
            .map(|e| e.user_id)
            .collect::<Vec<_>>(),
        vec![UserId(5)]
    );
}

#[tokio::test(start_paused = true)]
async fn repeated_keystrokes_only_push_the_deadline_back() {
    let bus = Arc::new(CountingBus::default());
    let tracker = TypingTracker::new(ME, CHANNEL, bus.clone(), DEFAULT_TYPING_DEBOUNCE);

    tracker.start_typing().await.expect("start");
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    tracker.start_typing().await.expect("keystroke");
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert!(tracker.is_typing().await);
    assert_eq!(bus.published.load(Ordering::SeqCst), 1);
    assert_eq!(bus.withdrawn.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(!tracker.is_typing().await);
    assert_eq!(bus.withdrawn.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_stop_withdraws_once_and_cancels_the_timer() {
    let bus = Arc::new(CountingBus::default());
    let tracker = TypingTracker::new(ME, CHANNEL, bus.clone(), Duration::from_millis(500));

    tracker.stop_typing().await.expect("idle stop");
    assert_eq!(bus.withdrawn.load(Ordering::SeqCst), 0);

    tracker.start_typing().await.expect("start");
    tracker.stop_typing().await.expect("stop");
    tokio::time::sleep(Duration::from_millis(2_000)).await;

    assert_eq!(bus.published.load(Ordering::SeqCst), 1);
    assert_eq!(bus.withdrawn.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_expiry_removes_the_entry_for_other_clients() {
    let hub = LocalHub::new();
    let alice_bus: Arc<dyn RealtimeBus> = Arc::new(hub.connect());
    let bob_bus: Arc<dyn RealtimeBus> = Arc::new(hub.connect());

    let alice = TypingTracker::new(UserId(1), CHANNEL, alice_bus, DEFAULT_TYPING_DEBOUNCE);
    let bob = TypingTracker::new(UserId(2), CHANNEL, bob_bus.clone(), DEFAULT_TYPING_DEBOUNCE);
    let mut bob_presence = bob_bus
        .subscribe_presence(Topic::typing(CHANNEL))
        .await
        .expect("subscribe");
    bob.apply_presence(bob_presence.next().await.expect("snapshot"))
        .await;

    alice.start_typing().await.expect("start");
    bob.apply_presence(bob_presence.next().await.expect("join"))
        .await;
    assert_eq!(bob.roster().await.len(), 1);

    tokio::time::sleep(Duration::from_millis(2_100)).await;
    let leave = bob_presence.next().await.expect("leave");
    assert!(matches!(leave, PresenceEvent::Leave(_)));
    bob.apply_presence(leave).await;

    assert!(bob.roster().await.is_empty());
    assert!(!alice.is_typing().await);
}
