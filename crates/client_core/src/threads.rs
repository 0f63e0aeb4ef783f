use std::sync::Arc;

use shared::{
    domain::{DirectPairKey, ThreadId, ThreadInsert, UserId},
    protocol::ThreadSummary,
};
use tracing::{debug, info};

use crate::{
    error::{SyncError, SyncResult},
    persistence::ThreadPersistence,
};

/// Finds or creates the one-to-one thread of an unordered user pair.
#[derive(Clone)]
pub struct DirectThreadResolver {
    persistence: Arc<dyn ThreadPersistence>,
}

impl DirectThreadResolver {
    pub fn new(persistence: Arc<dyn ThreadPersistence>) -> Self {
        Self { persistence }
    }

    pub async fn ensure_direct_thread(&self, me: UserId, target: UserId) -> SyncResult<ThreadId> {
        if me == target {
            return Err(SyncError::Validation(
                "cannot open a direct thread with yourself".into(),
            ));
        }

        if let Some(existing) = self.find_shared_thread(me, target).await? {
            debug!(me = me.0, target = target.0, thread_id = existing.0, "dm: reusing thread");
            return Ok(existing);
        }

        let pair = DirectPairKey::new(me, target);
        let outcome = self
            .persistence
            .insert_direct_thread(pair)
            .await
            .map_err(SyncError::from_collaborator)?;
        let thread_id = outcome.thread_id();

        // Both racers run this; participant inserts are idempotent.
        self.persistence
            .insert_participants(thread_id, &pair.members())
            .await
            .map_err(SyncError::from_collaborator)?;

        match outcome {
            ThreadInsert::Created(_) => {
                info!(pair = %pair, thread_id = thread_id.0, "dm: created thread")
            }
            ThreadInsert::Existing(_) => {
                debug!(pair = %pair, thread_id = thread_id.0, "dm: pair already had a thread")
            }
        }
        Ok(thread_id)
    }

    async fn find_shared_thread(&self, me: UserId, target: UserId) -> SyncResult<Option<ThreadId>> {
        let mine = self
            .persistence
            .query_participant_threads(me)
            .await
            .map_err(SyncError::from_collaborator)?;
        if mine.is_empty() {
            return Ok(None);
        }
        let shared = self
            .persistence
            .query_threads_with_participant(&mine, target)
            .await
            .map_err(SyncError::from_collaborator)?;
        Ok(shared.into_iter().min())
    }

    /// The user's threads, most recently active first.
    pub async fn list_threads(&self, me: UserId) -> SyncResult<Vec<ThreadSummary>> {
        let threads = self
            .persistence
            .list_threads(me)
            .await
            .map_err(SyncError::from_collaborator)?;
        Ok(threads
            .into_iter()
            .map(|thread| ThreadSummary {
                other_user_id: thread.other_participant(me),
                thread,
            })
            .collect())
    }
}

#[cfg(test)]
#[path = "tests/threads_tests.rs"]
mod tests;
