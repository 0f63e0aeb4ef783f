use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use client_core::LocalHub;
use livekit_integration::HttpRoomService;
use server_api::{
    delete_message, edit_message, ensure_direct_thread, insert_direct_thread, insert_participants,
    join_voice, list_messages, list_threads, participant_threads, send_message, shared_threads,
    toggle_reaction, voice_participants, ApiContext,
};
use shared::{
    domain::{Message, MessageId, ThreadId, ThreadInsert, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        DataChange, EditMessageRequest, EnsureDirectThreadRequest, EnsureDirectThreadResponse,
        InsertParticipantsRequest, InsertThreadRequest, ListMessagesQuery, SendMessageRequest,
        SharedThreadsRequest, ThreadSummary, ToggleReactionRequest, Topic, UserQuery,
        VoiceJoinRequest, VoiceParticipantsRequest, VoiceParticipantsResponse, VoiceTokenResponse,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod realtime;

use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    hub: Arc<LocalHub>,
}

impl AppState {
    /// Fans a stored change out on the message's topic.
    fn publish(&self, change: DataChange, message: &Message) {
        self.hub
            .publish_data(Topic::messages(message.scope), change);
    }
}

type Rejection = (StatusCode, Json<ApiError>);
type HttpResult<T> = Result<Json<T>, Rejection>;

fn reject(err: ApiError) -> Rejection {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = ?err.code, "request failed: {}", err.message);
    }
    (status, Json(err))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let livekit = settings.livekit();
    let api = ApiContext {
        storage,
        room_service: Arc::new(HttpRoomService::new(livekit.clone())),
        livekit,
    };

    let state = AppState {
        api,
        hub: LocalHub::new(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, livekit_url = %settings.livekit_url, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/messages", post(http_send_message).get(http_list_messages))
        .route(
            "/messages/:message_id",
            patch(http_edit_message).delete(http_delete_message),
        )
        .route("/messages/:message_id/reactions", post(http_toggle_reaction))
        .route("/dms/ensure", post(http_ensure_direct_thread))
        .route("/dms/threads", get(http_list_threads).post(http_insert_thread))
        .route("/dms/threads/shared", post(http_shared_threads))
        .route(
            "/dms/threads/:thread_id/participants",
            post(http_insert_participants),
        )
        .route(
            "/dms/participants/:user_id/threads",
            get(http_participant_threads),
        )
        .route("/voice/join", post(http_join_voice))
        .route("/voice/participants", post(http_voice_participants))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, Rejection> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Unavailable, e.to_string())))?;
    Ok("ok")
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<Message> {
    let message = send_message(&state.api, req).await.map_err(reject)?;
    state.publish(DataChange::Insert(message.clone()), &message);
    Ok(Json(message))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Vec<Message>> {
    let messages = list_messages(&state.api, q).await.map_err(reject)?;
    Ok(Json(messages))
}

async fn http_edit_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<EditMessageRequest>,
) -> HttpResult<Message> {
    let message = edit_message(&state.api, MessageId(message_id), req)
        .await
        .map_err(reject)?;
    state.publish(DataChange::Update(message.clone()), &message);
    Ok(Json(message))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Message> {
    let message = delete_message(&state.api, MessageId(message_id), q.user_id)
        .await
        .map_err(reject)?;
    state.publish(DataChange::Update(message.clone()), &message);
    Ok(Json(message))
}

async fn http_toggle_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ToggleReactionRequest>,
) -> HttpResult<Message> {
    let message = toggle_reaction(&state.api, MessageId(message_id), req)
        .await
        .map_err(reject)?;
    state.publish(DataChange::Update(message.clone()), &message);
    Ok(Json(message))
}

async fn http_ensure_direct_thread(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnsureDirectThreadRequest>,
) -> HttpResult<EnsureDirectThreadResponse> {
    let response = ensure_direct_thread(&state.api, req)
        .await
        .map_err(reject)?;
    Ok(Json(response))
}

async fn http_list_threads(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<ThreadSummary>> {
    let threads = list_threads(&state.api, q.user_id).await.map_err(reject)?;
    Ok(Json(threads))
}

async fn http_insert_thread(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InsertThreadRequest>,
) -> HttpResult<ThreadInsert> {
    let outcome = insert_direct_thread(&state.api, req)
        .await
        .map_err(reject)?;
    Ok(Json(outcome))
}

async fn http_shared_threads(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SharedThreadsRequest>,
) -> HttpResult<Vec<ThreadId>> {
    let threads = shared_threads(&state.api, req).await.map_err(reject)?;
    Ok(Json(threads))
}

async fn http_insert_participants(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<i64>,
    Json(req): Json<InsertParticipantsRequest>,
) -> HttpResult<serde_json::Value> {
    insert_participants(&state.api, ThreadId(thread_id), req)
        .await
        .map_err(reject)?;
    Ok(Json(serde_json::json!({})))
}

async fn http_participant_threads(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> HttpResult<Vec<ThreadId>> {
    let threads = participant_threads(&state.api, UserId(user_id))
        .await
        .map_err(reject)?;
    Ok(Json(threads))
}

async fn http_join_voice(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VoiceJoinRequest>,
) -> HttpResult<VoiceTokenResponse> {
    let issued = join_voice(&state.api, req).await.map_err(reject)?;
    Ok(Json(issued))
}

async fn http_voice_participants(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VoiceParticipantsRequest>,
) -> HttpResult<VoiceParticipantsResponse> {
    let participants = voice_participants(&state.api, req)
        .await
        .map_err(reject)?;
    Ok(Json(participants))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| realtime::ws_connection(hub, socket, q.user_id))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
