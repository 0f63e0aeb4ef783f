use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{
        DirectPairKey, DirectThread, Message, MessageId, MessageScope, MessageUpdate, ThreadId,
        ThreadInsert, UserId,
    },
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        DataChange, EditMessageRequest, InsertParticipantsRequest, InsertThreadRequest,
        ListMessagesQuery, SendMessageRequest, SharedThreadsRequest, ThreadSummary,
        ToggleReactionRequest, Topic,
    },
};
use storage::Storage;

use crate::bus::LocalHub;

/// Message reads and writes on behalf of `actor`.
#[async_trait]
pub trait MessagePersistence: Send + Sync {
    async fn insert_message(
        &self,
        actor: UserId,
        scope: MessageScope,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message>;
    /// Newest first, soft-deleted rows excluded.
    async fn query_messages(
        &self,
        actor: UserId,
        scope: MessageScope,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>>;
    async fn update_message(
        &self,
        actor: UserId,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> Result<Message>;
    async fn toggle_reaction(
        &self,
        actor: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Message>;
}

#[async_trait]
pub trait ThreadPersistence: Send + Sync {
    async fn query_participant_threads(&self, user_id: UserId) -> Result<Vec<ThreadId>>;
    async fn query_threads_with_participant(
        &self,
        thread_ids: &[ThreadId],
        user_id: UserId,
    ) -> Result<Vec<ThreadId>>;
    async fn insert_direct_thread(&self, pair: DirectPairKey) -> Result<ThreadInsert>;
    async fn insert_participants(&self, thread_id: ThreadId, user_ids: &[UserId]) -> Result<()>;
    async fn list_threads(&self, user_id: UserId) -> Result<Vec<DirectThread>>;
}

fn not_found(message_id: MessageId) -> anyhow::Error {
    ApiException::new(ErrorCode::NotFound, format!("message {message_id} not found")).into()
}

#[async_trait]
impl MessagePersistence for Storage {
    async fn insert_message(
        &self,
        actor: UserId,
        scope: MessageScope,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message> {
        Storage::insert_message(self, scope, actor, content, parent_message_id).await
    }

    async fn query_messages(
        &self,
        _actor: UserId,
        scope: MessageScope,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        self.list_messages(scope, limit, offset).await
    }

    async fn update_message(
        &self,
        _actor: UserId,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> Result<Message> {
        Storage::update_message(self, message_id, &update)
            .await?
            .ok_or_else(|| not_found(message_id))
    }

    async fn toggle_reaction(
        &self,
        actor: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Message> {
        Storage::toggle_reaction(self, message_id, actor, emoji)
            .await?
            .ok_or_else(|| not_found(message_id))
    }
}

#[async_trait]
impl ThreadPersistence for Storage {
    async fn query_participant_threads(&self, user_id: UserId) -> Result<Vec<ThreadId>> {
        self.participant_thread_ids(user_id).await
    }

    async fn query_threads_with_participant(
        &self,
        thread_ids: &[ThreadId],
        user_id: UserId,
    ) -> Result<Vec<ThreadId>> {
        self.threads_with_participant(thread_ids, user_id).await
    }

    async fn insert_direct_thread(&self, pair: DirectPairKey) -> Result<ThreadInsert> {
        Storage::insert_direct_thread(self, pair).await
    }

    async fn insert_participants(&self, thread_id: ThreadId, user_ids: &[UserId]) -> Result<()> {
        Storage::insert_participants(self, thread_id, user_ids).await
    }

    async fn list_threads(&self, user_id: UserId) -> Result<Vec<DirectThread>> {
        self.list_threads_for_user(user_id).await
    }
}

/// Storage plus an in-process hub: every committed write is echoed on the
/// scope's topic the way the server does it.
#[derive(Clone)]
pub struct EmbeddedBackend {
    storage: Storage,
    hub: Arc<LocalHub>,
}

impl EmbeddedBackend {
    pub fn new(storage: Storage, hub: Arc<LocalHub>) -> Self {
        Self { storage, hub }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn echo(&self, change: DataChange, scope: MessageScope) {
        self.hub.publish_data(Topic::messages(scope), change);
    }
}

#[async_trait]
impl MessagePersistence for EmbeddedBackend {
    async fn insert_message(
        &self,
        actor: UserId,
        scope: MessageScope,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message> {
        let message = MessagePersistence::insert_message(
            &self.storage,
            actor,
            scope,
            content,
            parent_message_id,
        )
        .await?;
        self.echo(DataChange::Insert(message.clone()), scope);
        Ok(message)
    }

    async fn query_messages(
        &self,
        actor: UserId,
        scope: MessageScope,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        self.storage.query_messages(actor, scope, limit, offset).await
    }

    async fn update_message(
        &self,
        actor: UserId,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> Result<Message> {
        let message =
            MessagePersistence::update_message(&self.storage, actor, message_id, update).await?;
        self.echo(DataChange::Update(message.clone()), message.scope);
        Ok(message)
    }

    async fn toggle_reaction(
        &self,
        actor: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Message> {
        let message =
            MessagePersistence::toggle_reaction(&self.storage, actor, message_id, emoji).await?;
        self.echo(DataChange::Update(message.clone()), message.scope);
        Ok(message)
    }
}

#[async_trait]
impl ThreadPersistence for EmbeddedBackend {
    async fn query_participant_threads(&self, user_id: UserId) -> Result<Vec<ThreadId>> {
        self.storage.query_participant_threads(user_id).await
    }

    async fn query_threads_with_participant(
        &self,
        thread_ids: &[ThreadId],
        user_id: UserId,
    ) -> Result<Vec<ThreadId>> {
        self.storage
            .query_threads_with_participant(thread_ids, user_id)
            .await
    }

    async fn insert_direct_thread(&self, pair: DirectPairKey) -> Result<ThreadInsert> {
        ThreadPersistence::insert_direct_thread(&self.storage, pair).await
    }

    async fn insert_participants(&self, thread_id: ThreadId, user_ids: &[UserId]) -> Result<()> {
        ThreadPersistence::insert_participants(&self.storage, thread_id, user_ids).await
    }

    async fn list_threads(&self, user_id: UserId) -> Result<Vec<DirectThread>> {
        self.storage.list_threads(user_id).await
    }
}

/// Persistence over the server's REST routes.
#[derive(Clone)]
pub struct HttpPersistence {
    http: Client,
    base_url: String,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Decodes a success body, or lifts the server's `ApiError` into an
/// [`ApiException`] so callers can classify it.
pub(crate) async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .context("failed to decode response body");
    }
    let body = response.text().await.unwrap_or_default();
    let api_error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        let code = match status.as_u16() {
            400 => ErrorCode::Validation,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::Conflict,
            502 => ErrorCode::Provider,
            503 => ErrorCode::Unavailable,
            _ => ErrorCode::Internal,
        };
        ApiError::new(code, format!("request failed with status {status}: {body}"))
    });
    Err(ApiException::from(api_error).into())
}

#[async_trait]
impl MessagePersistence for HttpPersistence {
    async fn insert_message(
        &self,
        actor: UserId,
        scope: MessageScope,
        content: &str,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message> {
        let response = self
            .http
            .post(self.url("/messages"))
            .json(&SendMessageRequest {
                scope,
                user_id: actor,
                content: content.to_string(),
                parent_message_id,
            })
            .send()
            .await
            .context("failed to send message")?;
        decode_response(response).await
    }

    async fn query_messages(
        &self,
        actor: UserId,
        scope: MessageScope,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Message>> {
        let response = self
            .http
            .get(self.url("/messages"))
            .query(&ListMessagesQuery {
                scope,
                user_id: actor,
                limit: Some(limit),
                offset: Some(offset),
            })
            .send()
            .await
            .context("failed to fetch messages")?;
        decode_response(response).await
    }

    async fn update_message(
        &self,
        actor: UserId,
        message_id: MessageId,
        update: MessageUpdate,
    ) -> Result<Message> {
        let url = self.url(&format!("/messages/{}", message_id.0));
        let request = match update {
            MessageUpdate::Edit { content, .. } => self.http.patch(url).json(&EditMessageRequest {
                user_id: actor,
                content,
            }),
            MessageUpdate::SoftDelete { .. } => {
                self.http.delete(url).query(&[("user_id", actor.0)])
            }
        };
        let response = request.send().await.context("failed to update message")?;
        decode_response(response).await
    }

    async fn toggle_reaction(
        &self,
        actor: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Message> {
        let response = self
            .http
            .post(self.url(&format!("/messages/{}/reactions", message_id.0)))
            .json(&ToggleReactionRequest {
                user_id: actor,
                emoji: emoji.to_string(),
            })
            .send()
            .await
            .context("failed to toggle reaction")?;
        decode_response(response).await
    }
}

#[async_trait]
impl ThreadPersistence for HttpPersistence {
    async fn query_participant_threads(&self, user_id: UserId) -> Result<Vec<ThreadId>> {
        let response = self
            .http
            .get(self.url(&format!("/dms/participants/{}/threads", user_id.0)))
            .send()
            .await
            .context("failed to fetch participant threads")?;
        decode_response(response).await
    }

    async fn query_threads_with_participant(
        &self,
        thread_ids: &[ThreadId],
        user_id: UserId,
    ) -> Result<Vec<ThreadId>> {
        let response = self
            .http
            .post(self.url("/dms/threads/shared"))
            .json(&SharedThreadsRequest {
                thread_ids: thread_ids.to_vec(),
                user_id,
            })
            .send()
            .await
            .context("failed to query shared threads")?;
        decode_response(response).await
    }

    async fn insert_direct_thread(&self, pair: DirectPairKey) -> Result<ThreadInsert> {
        let response = self
            .http
            .post(self.url("/dms/threads"))
            .json(&InsertThreadRequest {
                user_ids: pair.members(),
            })
            .send()
            .await
            .context("failed to insert direct thread")?;
        decode_response(response).await
    }

    async fn insert_participants(&self, thread_id: ThreadId, user_ids: &[UserId]) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/dms/threads/{}/participants", thread_id.0)))
            .json(&InsertParticipantsRequest {
                user_ids: user_ids.to_vec(),
            })
            .send()
            .await
            .context("failed to insert thread participants")?;
        decode_response::<serde_json::Value>(response).await?;
        Ok(())
    }

    async fn list_threads(&self, user_id: UserId) -> Result<Vec<DirectThread>> {
        let response = self
            .http
            .get(self.url("/dms/threads"))
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .context("failed to list threads")?;
        let summaries: Vec<ThreadSummary> = decode_response(response).await?;
        Ok(summaries.into_iter().map(|summary| summary.thread).collect())
    }
}

#[cfg(test)]
#[path = "tests/persistence_tests.rs"]
mod tests;
