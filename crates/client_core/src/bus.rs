use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::TypingPresenceEntry,
    protocol::{DataChange, PresenceEvent, Topic},
};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

const TOPIC_CHANNEL_CAPACITY: usize = 256;

pub type DataStream = BoxStream<'static, DataChange>;
pub type PresenceStream = BoxStream<'static, PresenceEvent>;

/// Topic-scoped publish/subscribe collaborator.
///
/// Presence published through a bus belongs to that bus connection: it is
/// withdrawn explicitly or when the connection goes away.
///
/// Several holders may share one connection. Every subscribe is paired with
/// one `unsubscribe` and every `publish_presence` with one
/// `withdraw_presence`; a topic is only closed, or its presence withdrawn,
/// when the last holder lets go.
#[async_trait]
pub trait RealtimeBus: Send + Sync {
    async fn subscribe_data(&self, topic: Topic) -> Result<DataStream>;
    /// The first event of a presence stream is a `Sync` snapshot.
    async fn subscribe_presence(&self, topic: Topic) -> Result<PresenceStream>;
    async fn unsubscribe(&self, topic: Topic) -> Result<()>;
    async fn publish_presence(&self, topic: Topic, entry: TypingPresenceEntry) -> Result<()>;
    async fn withdraw_presence(&self, topic: Topic) -> Result<()>;
}

struct TopicChannels {
    data: broadcast::Sender<DataChange>,
    presence: broadcast::Sender<PresenceEvent>,
    tracked: HashMap<u64, TypingPresenceEntry>,
}

impl TopicChannels {
    fn new() -> Self {
        Self {
            data: broadcast::channel(TOPIC_CHANNEL_CAPACITY).0,
            presence: broadcast::channel(TOPIC_CHANNEL_CAPACITY).0,
            tracked: HashMap::new(),
        }
    }

    fn snapshot(&self) -> Vec<TypingPresenceEntry> {
        let mut entries = self.tracked.values().cloned().collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.user_id);
        entries
    }
}

/// Holder counts per topic for one bus connection.
#[derive(Default)]
pub(crate) struct Holders(HashMap<Topic, usize>);

impl Holders {
    /// True for the first holder of `topic`.
    pub(crate) fn acquire(&mut self, topic: Topic) -> bool {
        let count = self.0.entry(topic).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// True once no holder of `topic` is left.
    pub(crate) fn release(&mut self, topic: Topic) -> bool {
        match self.0.get_mut(&topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                self.0.remove(&topic);
                true
            }
        }
    }
}

/// In-process topic hub. Every [`LocalBus`] handed out by [`LocalHub::connect`]
/// is one connection.
#[derive(Default)]
pub struct LocalHub {
    topics: Mutex<HashMap<Topic, TopicChannels>>,
    next_connection: AtomicU64,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>) -> LocalBus {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        LocalBus {
            hub: Arc::clone(self),
            connection,
            subscriptions: Mutex::new(Subscriptions::default()),
            presence: Mutex::new(Holders::default()),
        }
    }

    /// Fans a data change out to every subscriber of `topic`.
    pub fn publish_data(&self, topic: Topic, change: DataChange) {
        let Ok(topics) = self.topics.lock() else {
            warn!(%topic, "bus: hub state poisoned, dropping data change");
            return;
        };
        if let Some(channels) = topics.get(&topic) {
            let delivered = channels.data.send(change).unwrap_or(0);
            debug!(%topic, delivered, "bus: published data change");
        }
    }

    pub fn presence_snapshot(&self, topic: Topic) -> Vec<TypingPresenceEntry> {
        self.topics
            .lock()
            .map(|topics| topics.get(&topic).map(TopicChannels::snapshot).unwrap_or_default())
            .unwrap_or_default()
    }

    fn data_receiver(&self, topic: Topic) -> Result<broadcast::Receiver<DataChange>> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| anyhow!("bus hub state poisoned"))?;
        Ok(topics
            .entry(topic)
            .or_insert_with(TopicChannels::new)
            .data
            .subscribe())
    }

    fn presence_receiver(
        &self,
        topic: Topic,
    ) -> Result<(broadcast::Receiver<PresenceEvent>, Vec<TypingPresenceEntry>)> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| anyhow!("bus hub state poisoned"))?;
        let channels = topics.entry(topic).or_insert_with(TopicChannels::new);
        Ok((channels.presence.subscribe(), channels.snapshot()))
    }

    fn track(&self, connection: u64, topic: Topic, entry: TypingPresenceEntry) -> Result<()> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| anyhow!("bus hub state poisoned"))?;
        let channels = topics.entry(topic).or_insert_with(TopicChannels::new);
        channels.tracked.insert(connection, entry.clone());
        let _ = channels.presence.send(PresenceEvent::Join(vec![entry]));
        Ok(())
    }

    fn untrack(&self, connection: u64, topic: Topic) {
        let Ok(mut topics) = self.topics.lock() else {
            return;
        };
        let Some(channels) = topics.get_mut(&topic) else {
            return;
        };
        if let Some(entry) = channels.tracked.remove(&connection) {
            let _ = channels.presence.send(PresenceEvent::Leave(vec![entry]));
        }
    }

    fn untrack_all(&self, connection: u64) {
        let Ok(mut topics) = self.topics.lock() else {
            return;
        };
        for (topic, channels) in topics.iter_mut() {
            if let Some(entry) = channels.tracked.remove(&connection) {
                debug!(%topic, user_id = entry.user_id.0, "bus: presence withdrawn on disconnect");
                let _ = channels.presence.send(PresenceEvent::Leave(vec![entry]));
            }
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    holders: Holders,
    closed: HashMap<Topic, watch::Sender<bool>>,
}

/// One connection to a [`LocalHub`]. Dropping it withdraws its presence.
pub struct LocalBus {
    hub: Arc<LocalHub>,
    connection: u64,
    subscriptions: Mutex<Subscriptions>,
    presence: Mutex<Holders>,
}

impl LocalBus {
    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    fn closed_signal(&self, topic: Topic) -> Result<watch::Receiver<bool>> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| anyhow!("bus subscriptions poisoned"))?;
        subscriptions.holders.acquire(topic);
        let sender = subscriptions
            .closed
            .entry(topic)
            .or_insert_with(|| watch::channel(false).0);
        Ok(sender.subscribe())
    }
}

/// Broadcast receiver as a stream; lag is logged and skipped.
pub(crate) fn lossy_stream<T>(
    topic: Topic,
    receiver: broadcast::Receiver<T>,
) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(receiver)
        .filter_map(move |item| async move {
            match item {
                Ok(value) => Some(value),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%topic, skipped, "bus: subscriber lagged, events dropped");
                    None
                }
            }
        })
        .boxed()
}

fn until_closed<T>(
    topic: Topic,
    receiver: broadcast::Receiver<T>,
    mut closed: watch::Receiver<bool>,
) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    lossy_stream(topic, receiver)
        .take_until(async move {
            while !*closed.borrow_and_update() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        })
        .boxed()
}

#[async_trait]
impl RealtimeBus for LocalBus {
    async fn subscribe_data(&self, topic: Topic) -> Result<DataStream> {
        let closed = self.closed_signal(topic)?;
        let receiver = self.hub.data_receiver(topic)?;
        Ok(until_closed(topic, receiver, closed))
    }

    async fn subscribe_presence(&self, topic: Topic) -> Result<PresenceStream> {
        let closed = self.closed_signal(topic)?;
        let (receiver, snapshot) = self.hub.presence_receiver(topic)?;
        let initial = futures::stream::once(async move { PresenceEvent::Sync(snapshot) });
        Ok(initial
            .chain(until_closed(topic, receiver, closed))
            .boxed())
    }

    async fn unsubscribe(&self, topic: Topic) -> Result<()> {
        let removed = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .map_err(|_| anyhow!("bus subscriptions poisoned"))?;
            if !subscriptions.holders.release(topic) {
                return Ok(());
            }
            subscriptions.closed.remove(&topic)
        };
        if let Some(closed) = removed {
            let _ = closed.send(true);
        }
        Ok(())
    }

    async fn publish_presence(&self, topic: Topic, entry: TypingPresenceEntry) -> Result<()> {
        self.presence
            .lock()
            .map_err(|_| anyhow!("bus presence poisoned"))?
            .acquire(topic);
        let tracked = self.hub.track(self.connection, topic, entry);
        if tracked.is_err() {
            if let Ok(mut presence) = self.presence.lock() {
                presence.release(topic);
            }
        }
        tracked
    }

    async fn withdraw_presence(&self, topic: Topic) -> Result<()> {
        let last = self
            .presence
            .lock()
            .map_err(|_| anyhow!("bus presence poisoned"))?
            .release(topic);
        if last {
            self.hub.untrack(self.connection, topic);
        }
        Ok(())
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.hub.untrack_all(self.connection);
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            for (_, closed) in subscriptions.closed.drain() {
                let _ = closed.send(true);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod tests;
