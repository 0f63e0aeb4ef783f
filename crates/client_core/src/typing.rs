use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{ChannelId, TypingPresenceEntry, UserId},
    protocol::{PresenceEvent, Topic},
    rules::TYPING_IDLE_TIMEOUT_MS,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    bus::RealtimeBus,
    error::{SyncError, SyncResult},
};

pub const DEFAULT_TYPING_DEBOUNCE: Duration = Duration::from_millis(TYPING_IDLE_TIMEOUT_MS);

#[derive(Default)]
struct LocalTyping {
    active: bool,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

/// Tracks who else is typing in one channel and publishes the local user's
/// own typing state with an idle debounce.
pub struct TypingTracker {
    me: UserId,
    channel_id: ChannelId,
    bus: Arc<dyn RealtimeBus>,
    debounce: Duration,
    local: Mutex<LocalTyping>,
    roster: RwLock<BTreeMap<UserId, TypingPresenceEntry>>,
    updates: broadcast::Sender<Vec<TypingPresenceEntry>>,
}

impl TypingTracker {
    pub fn new(
        me: UserId,
        channel_id: ChannelId,
        bus: Arc<dyn RealtimeBus>,
        debounce: Duration,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            me,
            channel_id,
            bus,
            debounce,
            local: Mutex::new(LocalTyping::default()),
            roster: RwLock::new(BTreeMap::new()),
            updates,
        })
    }

    pub fn topic(&self) -> Topic {
        Topic::typing(self.channel_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TypingPresenceEntry>> {
        self.updates.subscribe()
    }

    /// Other users currently typing, ordered by user id.
    pub async fn roster(&self) -> Vec<TypingPresenceEntry> {
        self.roster.read().await.values().cloned().collect()
    }

    pub async fn is_typing(&self) -> bool {
        self.local.lock().await.active
    }

    /// Publishes on the first keystroke after idle; later keystrokes only
    /// push the idle deadline back.
    pub async fn start_typing(self: &Arc<Self>) -> SyncResult<()> {
        let mut local = self.local.lock().await;
        if !local.active {
            let entry = TypingPresenceEntry {
                user_id: self.me,
                channel_id: self.channel_id,
                started_at: Utc::now(),
            };
            self.bus
                .publish_presence(self.topic(), entry)
                .await
                .map_err(SyncError::from_collaborator)?;
            local.active = true;
            debug!(channel_id = self.channel_id.0, "typing: started");
        }

        if let Some(timer) = local.idle_timer.take() {
            timer.abort();
        }
        local.generation += 1;
        let generation = local.generation;
        let debounce = self.debounce;
        let tracker = Arc::downgrade(self);
        local.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire(generation).await;
            }
        }));
        Ok(())
    }

    pub async fn stop_typing(&self) -> SyncResult<()> {
        let mut local = self.local.lock().await;
        if let Some(timer) = local.idle_timer.take() {
            timer.abort();
        }
        local.generation += 1;
        if !local.active {
            return Ok(());
        }
        local.active = false;
        self.bus
            .withdraw_presence(self.topic())
            .await
            .map_err(SyncError::from_collaborator)
    }

    async fn expire(&self, generation: u64) {
        let mut local = self.local.lock().await;
        if local.generation != generation || !local.active {
            return;
        }
        local.active = false;
        local.idle_timer = None;
        debug!(channel_id = self.channel_id.0, "typing: idle timeout");
        if let Err(err) = self.bus.withdraw_presence(self.topic()).await {
            warn!(
                channel_id = self.channel_id.0,
                "typing: failed to withdraw presence: {err:#}"
            );
        }
    }

    pub async fn apply_presence(&self, event: PresenceEvent) {
        let relevant = |entry: &TypingPresenceEntry| {
            entry.user_id != self.me && entry.channel_id == self.channel_id
        };

        let mut roster = self.roster.write().await;
        let before = roster.clone();
        match event {
            PresenceEvent::Sync(entries) => {
                roster.clear();
                for entry in entries.into_iter().filter(|e| relevant(e)) {
                    roster.insert(entry.user_id, entry);
                }
            }
            PresenceEvent::Join(entries) => {
                for entry in entries.into_iter().filter(|e| relevant(e)) {
                    roster.insert(entry.user_id, entry);
                }
            }
            PresenceEvent::Leave(entries) => {
                for entry in entries.iter().filter(|e| relevant(e)) {
                    roster.remove(&entry.user_id);
                }
            }
        }

        if *roster != before {
            let _ = self.updates.send(roster.values().cloned().collect());
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        if let Some(timer) = self.local.get_mut().idle_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
