use std::sync::Arc;

use chrono::Utc;
use client_core::{DirectThreadResolver, SyncError};
use livekit_integration::{
    mint_token, room_name_for_voice_channel, LiveKitConfig, RoomService, RoomServiceError,
    TokenGrant,
};
use shared::{
    domain::{
        Channel, ChannelId, ChannelKind, DirectPairKey, Message, MessageId, MessageScope,
        MessageUpdate, Role, ServerId, ThreadId, ThreadInsert, UserId, VoiceParticipant,
    },
    error::{ApiError, ApiException, ErrorCode},
    protocol::{
        EditMessageRequest, EnsureDirectThreadRequest, EnsureDirectThreadResponse,
        InsertParticipantsRequest, InsertThreadRequest, ListMessagesQuery, SendMessageRequest,
        SharedThreadsRequest, ThreadSummary, ToggleReactionRequest, VoiceJoinRequest,
        VoiceParticipantsRequest, VoiceParticipantsResponse, VoiceTokenResponse,
    },
    rules::{ensure_edit_window, validate_message_content},
};
use storage::Storage;
use tracing::debug;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;
const MIN_TOKEN_TTL_SECONDS: i64 = 60;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub livekit: LiveKitConfig,
    pub room_service: Arc<dyn RoomService>,
}

pub async fn send_message(ctx: &ApiContext, req: SendMessageRequest) -> Result<Message, ApiError> {
    let content = validate_message_content(&req.content)?;
    ensure_scope_access(ctx, req.scope, req.user_id).await?;
    if let Some(parent_id) = req.parent_message_id {
        let parent = load_message(ctx, parent_id).await?;
        if parent.scope != req.scope {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "reply must stay in the parent's conversation",
            ));
        }
    }
    ctx.storage
        .insert_message(req.scope, req.user_id, &content, req.parent_message_id)
        .await
        .map_err(internal)
}

/// Newest first; soft-deleted messages are left out.
pub async fn list_messages(
    ctx: &ApiContext,
    query: ListMessagesQuery,
) -> Result<Vec<Message>, ApiError> {
    ensure_scope_access(ctx, query.scope, query.user_id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    ctx.storage
        .list_messages(query.scope, limit, offset)
        .await
        .map_err(internal)
}

pub async fn edit_message(
    ctx: &ApiContext,
    message_id: MessageId,
    req: EditMessageRequest,
) -> Result<Message, ApiError> {
    let content = validate_message_content(&req.content)?;
    let message = load_own_message(ctx, message_id, req.user_id).await?;
    if message.is_deleted {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "deleted messages cannot be edited",
        ));
    }
    let now = Utc::now();
    ensure_edit_window(message.created_at, now)?;

    ctx.storage
        .update_message(
            message_id,
            &MessageUpdate::Edit {
                content,
                edited_at: now,
            },
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| message_not_found(message_id))
}

pub async fn delete_message(
    ctx: &ApiContext,
    message_id: MessageId,
    user_id: UserId,
) -> Result<Message, ApiError> {
    load_own_message(ctx, message_id, user_id).await?;
    ctx.storage
        .update_message(
            message_id,
            &MessageUpdate::SoftDelete {
                deleted_at: Utc::now(),
            },
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| message_not_found(message_id))
}

pub async fn toggle_reaction(
    ctx: &ApiContext,
    message_id: MessageId,
    req: ToggleReactionRequest,
) -> Result<Message, ApiError> {
    let emoji = req.emoji.trim();
    if emoji.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "reaction cannot be empty"));
    }
    let message = load_message(ctx, message_id).await?;
    ensure_scope_access(ctx, message.scope, req.user_id).await?;
    ctx.storage
        .toggle_reaction(message_id, req.user_id, emoji)
        .await
        .map_err(internal)?
        .ok_or_else(|| message_not_found(message_id))
}

pub async fn ensure_direct_thread(
    ctx: &ApiContext,
    req: EnsureDirectThreadRequest,
) -> Result<EnsureDirectThreadResponse, ApiError> {
    let resolver = DirectThreadResolver::new(Arc::new(ctx.storage.clone()));
    let thread_id = resolver
        .ensure_direct_thread(req.user_id, req.target_user_id)
        .await
        .map_err(sync_error)?;
    Ok(EnsureDirectThreadResponse { thread_id })
}

pub async fn list_threads(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ThreadSummary>, ApiError> {
    DirectThreadResolver::new(Arc::new(ctx.storage.clone()))
        .list_threads(user_id)
        .await
        .map_err(sync_error)
}

pub async fn participant_threads(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ThreadId>, ApiError> {
    ctx.storage
        .participant_thread_ids(user_id)
        .await
        .map_err(internal)
}

pub async fn shared_threads(
    ctx: &ApiContext,
    req: SharedThreadsRequest,
) -> Result<Vec<ThreadId>, ApiError> {
    ctx.storage
        .threads_with_participant(&req.thread_ids, req.user_id)
        .await
        .map_err(internal)
}

pub async fn insert_direct_thread(
    ctx: &ApiContext,
    req: InsertThreadRequest,
) -> Result<ThreadInsert, ApiError> {
    let [a, b] = req.user_ids;
    if a == b {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a direct thread needs two distinct users",
        ));
    }
    ctx.storage
        .insert_direct_thread(DirectPairKey::new(a, b))
        .await
        .map_err(internal)
}

pub async fn insert_participants(
    ctx: &ApiContext,
    thread_id: ThreadId,
    req: InsertParticipantsRequest,
) -> Result<(), ApiError> {
    ctx.storage
        .insert_participants(thread_id, &req.user_ids)
        .await
        .map_err(internal)
}

pub async fn join_voice(
    ctx: &ApiContext,
    req: VoiceJoinRequest,
) -> Result<VoiceTokenResponse, ApiError> {
    let channel = load_channel(ctx, req.channel_id).await?;
    if channel.server_id != req.server_id {
        return Err(ApiError::new(ErrorCode::NotFound, "channel not found"));
    }
    if channel.kind != ChannelKind::Voice {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "invalid channel: voice tokens are only issued for voice channels",
        ));
    }
    ensure_member(ctx, channel.server_id, req.user_id).await?;

    let room_name = room_name_for_voice_channel(channel.server_id, channel.id);
    let display_name = ctx
        .storage
        .display_names(&[req.user_id])
        .await
        .map_err(internal)?
        .remove(&req.user_id);
    let ttl_seconds = req
        .ttl_seconds
        .unwrap_or(ctx.livekit.ttl_seconds)
        .clamp(MIN_TOKEN_TTL_SECONDS, ctx.livekit.ttl_seconds.max(MIN_TOKEN_TTL_SECONDS));
    let config = LiveKitConfig {
        ttl_seconds,
        ..ctx.livekit.clone()
    };
    let token = mint_token(
        &config,
        &req.user_id.to_string(),
        display_name.as_deref(),
        &TokenGrant::participant(room_name.clone()),
    )
    .map_err(|e| ApiError::new(ErrorCode::Internal, format!("token mint failed: {e}")))?;

    Ok(VoiceTokenResponse {
        token,
        url: ctx.livekit.url.clone(),
        room_name,
    })
}

/// Lists a voice room through the room service. A room nobody has joined
/// yet does not exist and reads as empty.
pub async fn voice_participants(
    ctx: &ApiContext,
    req: VoiceParticipantsRequest,
) -> Result<VoiceParticipantsResponse, ApiError> {
    let room_name = room_name_for_voice_channel(req.server_id, req.channel_id);
    let infos = match ctx.room_service.list_participants(&room_name).await {
        Ok(infos) => infos,
        Err(RoomServiceError::RoomNotFound(_)) => {
            debug!(room = %room_name, "voice: room not found, reporting empty roster");
            return Ok(VoiceParticipantsResponse {
                participants: Vec::new(),
            });
        }
        Err(err) => return Err(ApiError::new(ErrorCode::Provider, err.to_string())),
    };

    let user_ids = infos
        .iter()
        .filter_map(|info| info.identity.parse::<i64>().ok().map(UserId))
        .collect::<Vec<_>>();
    let names = ctx
        .storage
        .display_names(&user_ids)
        .await
        .map_err(internal)?;

    let participants = infos
        .into_iter()
        .map(|info| {
            let stored = info
                .identity
                .parse::<i64>()
                .ok()
                .and_then(|id| names.get(&UserId(id)).cloned());
            let display_name = match stored {
                Some(name) => name,
                None if !info.name.is_empty() => info.name.clone(),
                None => info.identity.clone(),
            };
            VoiceParticipant {
                audio_enabled: info.audio_enabled(),
                identity: info.identity,
                display_name,
                is_speaking: false,
                is_local: false,
            }
        })
        .collect();
    Ok(VoiceParticipantsResponse { participants })
}

async fn ensure_member(
    ctx: &ApiContext,
    server_id: ServerId,
    user_id: UserId,
) -> Result<Role, ApiError> {
    ctx.storage
        .membership_role(server_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Forbidden, "user is not a member"))
}

async fn ensure_scope_access(
    ctx: &ApiContext,
    scope: MessageScope,
    user_id: UserId,
) -> Result<(), ApiError> {
    match scope {
        MessageScope::Channel(channel_id) => {
            let channel = load_channel(ctx, channel_id).await?;
            ensure_member(ctx, channel.server_id, user_id).await?;
        }
        MessageScope::Thread(thread_id) => {
            let participant = ctx
                .storage
                .is_thread_participant(thread_id, user_id)
                .await
                .map_err(internal)?;
            if !participant {
                return Err(ApiError::new(
                    ErrorCode::Forbidden,
                    "user is not part of this thread",
                ));
            }
        }
    }
    Ok(())
}

async fn load_channel(ctx: &ApiContext, channel_id: ChannelId) -> Result<Channel, ApiError> {
    ctx.storage
        .get_channel(channel_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "channel not found"))
}

async fn load_message(ctx: &ApiContext, message_id: MessageId) -> Result<Message, ApiError> {
    ctx.storage
        .get_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| message_not_found(message_id))
}

async fn load_own_message(
    ctx: &ApiContext,
    message_id: MessageId,
    user_id: UserId,
) -> Result<Message, ApiError> {
    let message = load_message(ctx, message_id).await?;
    if message.sender_id != user_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender can change a message",
        ));
    }
    Ok(message)
}

fn message_not_found(message_id: MessageId) -> ApiError {
    ApiError::new(ErrorCode::NotFound, format!("message {message_id} not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    match err.downcast::<ApiException>() {
        Ok(api) => api.into(),
        Err(err) => ApiError::new(ErrorCode::Internal, err.to_string()),
    }
}

fn sync_error(err: SyncError) -> ApiError {
    let code = match &err {
        SyncError::Validation(_) => ErrorCode::Validation,
        SyncError::Authorization(_) => ErrorCode::Forbidden,
        SyncError::NotFound(_) => ErrorCode::NotFound,
        SyncError::Conflict(_) => ErrorCode::Conflict,
        SyncError::Transient(_) => ErrorCode::Internal,
        SyncError::Provider(_) => ErrorCode::Provider,
    };
    ApiError::new(code, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
