use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Message, MessageId, MessageScope, MessageUpdate, UserId},
    protocol::DataChange,
    rules::{ensure_edit_window, validate_message_content},
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::{
    error::{SyncError, SyncResult},
    persistence::MessagePersistence,
};

/// Client-assigned id of a write that persistence has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub local_id: LocalId,
    pub scope: MessageScope,
    pub sender_id: UserId,
    pub content: String,
    pub parent_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl TimelineEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Pending(pending) => pending.created_at,
            TimelineEntry::Confirmed(message) => message.created_at,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Pending(pending) => &pending.content,
            TimelineEntry::Confirmed(message) => &message.content,
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            TimelineEntry::Confirmed(message) => Some(message.id),
            TimelineEntry::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TimelineEntry::Pending(_))
    }

    // created_at, then confirmed before pending, then id / local id.
    fn sort_key(&self) -> (DateTime<Utc>, u8, i64) {
        match self {
            TimelineEntry::Confirmed(message) => (message.created_at, 0, message.id.0),
            TimelineEntry::Pending(pending) => (pending.created_at, 1, pending.local_id.0 as i64),
        }
    }
}

/// Ordered, deduplicated message list for one scope.
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    tombstones: HashSet<MessageId>,
    next_local_id: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.entries.iter().find_map(|entry| match entry {
            TimelineEntry::Confirmed(message) if message.id == id => Some(message),
            _ => None,
        })
    }

    pub fn confirmed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, TimelineEntry::Confirmed(m) if !m.is_deleted))
            .count()
    }

    pub fn is_tombstoned(&self, id: MessageId) -> bool {
        self.tombstones.contains(&id)
    }

    fn position(&self, id: MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.message_id() == Some(id))
    }

    fn insert_sorted(&mut self, entry: TimelineEntry) {
        let key = entry.sort_key();
        let at = self
            .entries
            .partition_point(|existing| existing.sort_key().cmp(&key) != Ordering::Greater);
        self.entries.insert(at, entry);
    }

    pub fn push_pending(
        &mut self,
        scope: MessageScope,
        sender_id: UserId,
        content: String,
        parent_message_id: Option<MessageId>,
    ) -> LocalId {
        self.next_local_id += 1;
        let local_id = LocalId(self.next_local_id);
        self.insert_sorted(TimelineEntry::Pending(PendingMessage {
            local_id,
            scope,
            sender_id,
            content,
            parent_message_id,
            created_at: Utc::now(),
        }));
        local_id
    }

    pub fn discard_pending(&mut self, local_id: LocalId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            !matches!(entry, TimelineEntry::Pending(pending) if pending.local_id == local_id)
        });
        before != self.entries.len()
    }

    /// Collapses a pending entry into the persisted message. If the bus echo
    /// already delivered the same id, the pending entry is simply dropped.
    pub fn confirm(&mut self, local_id: LocalId, message: Message) {
        self.discard_pending(local_id);
        self.upsert(message);
    }

    /// Inserts when unknown and not tombstoned, otherwise applies the record
    /// as an update.
    pub fn upsert(&mut self, message: Message) -> bool {
        if self.tombstones.contains(&message.id) {
            return false;
        }
        match self.position(message.id) {
            Some(_) => self.apply_update(message),
            None => {
                self.insert_sorted(TimelineEntry::Confirmed(message));
                true
            }
        }
    }

    pub fn merge_page(&mut self, page: Vec<Message>) -> usize {
        page.into_iter()
            .filter(|message| self.upsert(message.clone()))
            .count()
    }

    fn apply_update(&mut self, incoming: Message) -> bool {
        let Some(at) = self.position(incoming.id) else {
            return false;
        };
        let TimelineEntry::Confirmed(current) = &self.entries[at] else {
            return false;
        };
        if current.is_deleted && !incoming.is_deleted {
            return false;
        }
        if incoming.updated_at < current.updated_at {
            return false;
        }
        if *current == incoming {
            return false;
        }
        self.entries[at] = TimelineEntry::Confirmed(incoming);
        true
    }

    /// Applies a bus change. Returns whether the rendered list changed.
    pub fn apply(&mut self, change: DataChange) -> bool {
        match change {
            DataChange::Insert(message) => {
                if self.tombstones.contains(&message.id) || self.position(message.id).is_some() {
                    return false;
                }
                self.insert_sorted(TimelineEntry::Confirmed(message));
                true
            }
            DataChange::Update(message) => self.apply_update(message),
            DataChange::Delete { id } => {
                // Tombstone even unknown ids so an insert delivered late
                // cannot bring the row back.
                self.tombstones.insert(id);
                match self.position(id) {
                    Some(at) => {
                        self.entries.remove(at);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

/// Reconciled message list of one channel or thread, as seen by `me`.
pub struct MessageStore {
    me: UserId,
    scope: MessageScope,
    persistence: Arc<dyn MessagePersistence>,
    timeline: RwLock<Timeline>,
    updates: broadcast::Sender<Vec<TimelineEntry>>,
}

impl MessageStore {
    pub fn new(
        me: UserId,
        scope: MessageScope,
        persistence: Arc<dyn MessagePersistence>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            me,
            scope,
            persistence,
            timeline: RwLock::new(Timeline::new()),
            updates,
        })
    }

    pub fn scope(&self) -> MessageScope {
        self.scope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TimelineEntry>> {
        self.updates.subscribe()
    }

    pub async fn entries(&self) -> Vec<TimelineEntry> {
        self.timeline.read().await.entries().to_vec()
    }

    fn notify(&self, timeline: &Timeline) {
        let _ = self.updates.send(timeline.entries().to_vec());
    }

    pub async fn load_initial(&self, limit: u32, offset: u32) -> SyncResult<usize> {
        let page = self
            .persistence
            .query_messages(self.me, self.scope, limit, offset)
            .await
            .map_err(SyncError::from_collaborator)?;
        let fetched = page.len();
        let mut timeline = self.timeline.write().await;
        let merged = timeline.merge_page(page);
        if merged > 0 {
            self.notify(&timeline);
        }
        debug!(scope = %self.scope, fetched, merged, "messages: page loaded");
        Ok(fetched)
    }

    /// Fetches the page preceding everything already held.
    pub async fn load_older(&self, limit: u32) -> SyncResult<usize> {
        let offset = self.timeline.read().await.confirmed_count();
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        self.load_initial(limit, offset).await
    }

    pub async fn send(
        &self,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> SyncResult<Message> {
        let content = validate_message_content(content)?;

        let local_id = {
            let mut timeline = self.timeline.write().await;
            let local_id =
                timeline.push_pending(self.scope, self.me, content.clone(), parent_message_id);
            self.notify(&timeline);
            local_id
        };

        match self
            .persistence
            .insert_message(self.me, self.scope, &content, parent_message_id)
            .await
        {
            Ok(message) => {
                let mut timeline = self.timeline.write().await;
                timeline.confirm(local_id, message.clone());
                self.notify(&timeline);
                Ok(message)
            }
            Err(err) => {
                warn!(scope = %self.scope, "messages: send failed: {err:#}");
                let mut timeline = self.timeline.write().await;
                timeline.discard_pending(local_id);
                self.notify(&timeline);
                Err(SyncError::from_collaborator(err))
            }
        }
    }

    pub async fn apply_remote_event(&self, change: DataChange) {
        if let DataChange::Insert(message) | DataChange::Update(message) = &change {
            if message.scope != self.scope {
                debug!(
                    scope = %self.scope,
                    other = %message.scope,
                    "messages: ignoring foreign scope"
                );
                return;
            }
        }
        let mut timeline = self.timeline.write().await;
        if timeline.apply(change) {
            self.notify(&timeline);
        }
    }

    async fn own_message(&self, message_id: MessageId) -> SyncResult<Message> {
        let timeline = self.timeline.read().await;
        let message = timeline
            .get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("message {message_id} not loaded")))?;
        if message.sender_id != self.me {
            return Err(SyncError::Authorization(
                "only the sender can change a message".into(),
            ));
        }
        Ok(message)
    }

    async fn apply_persisted(&self, message: &Message) {
        let mut timeline = self.timeline.write().await;
        if timeline.upsert(message.clone()) {
            self.notify(&timeline);
        }
    }

    pub async fn edit(&self, message_id: MessageId, content: &str) -> SyncResult<Message> {
        let content = validate_message_content(content)?;
        let current = self.own_message(message_id).await?;
        if current.is_deleted {
            return Err(SyncError::Validation("deleted messages cannot be edited".into()));
        }
        let now = Utc::now();
        ensure_edit_window(current.created_at, now)?;

        let message = self
            .persistence
            .update_message(
                self.me,
                message_id,
                MessageUpdate::Edit {
                    content,
                    edited_at: now,
                },
            )
            .await
            .map_err(SyncError::from_collaborator)?;
        self.apply_persisted(&message).await;
        Ok(message)
    }

    pub async fn delete(&self, message_id: MessageId) -> SyncResult<Message> {
        self.own_message(message_id).await?;
        let message = self
            .persistence
            .update_message(
                self.me,
                message_id,
                MessageUpdate::SoftDelete {
                    deleted_at: Utc::now(),
                },
            )
            .await
            .map_err(SyncError::from_collaborator)?;
        self.apply_persisted(&message).await;
        Ok(message)
    }

    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> SyncResult<Message> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(SyncError::Validation("reaction cannot be empty".into()));
        }
        let message = self
            .persistence
            .toggle_reaction(self.me, message_id, emoji)
            .await
            .map_err(SyncError::from_collaborator)?;
        self.apply_persisted(&message).await;
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
