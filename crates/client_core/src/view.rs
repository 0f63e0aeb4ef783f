use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{
    domain::{MessageScope, UserId},
    protocol::Topic,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    bus::RealtimeBus,
    error::{SyncError, SyncResult},
    messages::MessageStore,
    persistence::MessagePersistence,
    typing::{TypingTracker, DEFAULT_TYPING_DEBOUNCE},
};

#[derive(Debug, Clone, Copy)]
pub struct ViewOptions {
    pub page_size: u32,
    pub typing_debounce: Duration,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
        }
    }
}

/// An open channel or thread: its message store, its typing roster (channels
/// only) and the bus subscriptions feeding them. Closing or dropping the view
/// releases its own hold on those subscriptions; other views on the same bus
/// keep theirs, and the voice session is not touched.
pub struct ConversationView {
    scope: MessageScope,
    bus: Arc<dyn RealtimeBus>,
    messages: Arc<MessageStore>,
    typing: Option<Arc<TypingTracker>>,
    topics: Vec<Topic>,
    pumps: Vec<JoinHandle<()>>,
}

impl ConversationView {
    pub async fn open(
        me: UserId,
        scope: MessageScope,
        bus: Arc<dyn RealtimeBus>,
        persistence: Arc<dyn MessagePersistence>,
        options: ViewOptions,
    ) -> SyncResult<Self> {
        let messages = MessageStore::new(me, scope, persistence);
        let mut view = Self {
            scope,
            bus: Arc::clone(&bus),
            messages: Arc::clone(&messages),
            typing: None,
            topics: Vec::new(),
            pumps: Vec::new(),
        };

        // Subscribe before the first page so nothing falls in between.
        let data_topic = Topic::messages(scope);
        let mut changes = bus
            .subscribe_data(data_topic)
            .await
            .map_err(SyncError::from_collaborator)?;
        view.topics.push(data_topic);
        let store = Arc::clone(&messages);
        view.pumps.push(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                store.apply_remote_event(change).await;
            }
        }));

        if let MessageScope::Channel(channel_id) = scope {
            let tracker =
                TypingTracker::new(me, channel_id, Arc::clone(&bus), options.typing_debounce);
            let typing_topic = tracker.topic();
            let mut presence = bus
                .subscribe_presence(typing_topic)
                .await
                .map_err(SyncError::from_collaborator)?;
            view.topics.push(typing_topic);
            let roster = Arc::clone(&tracker);
            view.pumps.push(tokio::spawn(async move {
                while let Some(event) = presence.next().await {
                    roster.apply_presence(event).await;
                }
            }));
            view.typing = Some(tracker);
        }

        messages.load_initial(options.page_size, 0).await?;
        debug!(scope = %scope, "view: opened");
        Ok(view)
    }

    pub fn scope(&self) -> MessageScope {
        self.scope
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    pub fn typing(&self) -> Option<&Arc<TypingTracker>> {
        self.typing.as_ref()
    }

    pub async fn close(mut self) {
        if let Some(typing) = self.typing.take() {
            if let Err(err) = typing.stop_typing().await {
                warn!(scope = %self.scope, "view: failed to stop typing: {err}");
            }
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        for topic in std::mem::take(&mut self.topics) {
            if let Err(err) = self.bus.unsubscribe(topic).await {
                warn!(%topic, "view: unsubscribe failed: {err:#}");
            }
        }
        debug!(scope = %self.scope, "view: closed");
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        if self.topics.is_empty() && self.typing.is_none() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let bus = Arc::clone(&self.bus);
        let topics = std::mem::take(&mut self.topics);
        let typing = self.typing.take();
        runtime.spawn(async move {
            if let Some(typing) = typing {
                let _ = typing.stop_typing().await;
            }
            for topic in topics {
                let _ = bus.unsubscribe(topic).await;
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
