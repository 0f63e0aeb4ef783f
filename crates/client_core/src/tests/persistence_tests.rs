use super::*;
use axum::{
    extract::Query,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use shared::domain::{ChannelId, ChannelKind, Reactions};
use std::time::Duration;
use tokio::net::TcpListener;

use crate::{bus::RealtimeBus, error::SyncError};

fn sample_message(id: i64, scope: MessageScope) -> Message {
    let now = Utc::now();
    Message {
        id: MessageId(id),
        scope,
        sender_id: UserId(1),
        content: "hello".into(),
        created_at: now,
        updated_at: now,
        is_deleted: false,
        is_edited: false,
        edited_at: None,
        parent_message_id: None,
        reactions: Reactions::new(),
    }
}

async fn spawn_fake_server() -> String {
    async fn send(Json(req): Json<SendMessageRequest>) -> (StatusCode, Json<serde_json::Value>) {
        if req.user_id == UserId(99) {
            return (
                StatusCode::FORBIDDEN,
                Json(serde_json::json!({ "code": "forbidden", "message": "not a member" })),
            );
        }
        let message = sample_message(41, req.scope);
        (
            StatusCode::OK,
            Json(serde_json::to_value(message).expect("json")),
        )
    }

    async fn page(Query(query): Query<ListMessagesQuery>) -> Json<Vec<Message>> {
        assert_eq!(query.limit, Some(2));
        assert_eq!(query.offset, Some(4));
        Json(vec![sample_message(7, query.scope)])
    }

    async fn insert_thread(Json(req): Json<InsertThreadRequest>) -> Json<ThreadInsert> {
        assert!(req.user_ids[0] <= req.user_ids[1]);
        Json(ThreadInsert::Existing(ThreadId(12)))
    }

    async fn unavailable() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/messages", post(send).get(page))
        .route("/dms/threads", post(insert_thread))
        .route("/dms/participants/:user_id/threads", get(unavailable));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_persistence_decodes_success_bodies() {
    let base = spawn_fake_server().await;
    let persistence = HttpPersistence::new(base);
    let scope = MessageScope::Channel(ChannelId(3));

    let message = persistence
        .insert_message(UserId(1), scope, "hello", None)
        .await
        .expect("insert");
    assert_eq!(message.id, MessageId(41));
    assert_eq!(message.scope, scope);

    let page = persistence
        .query_messages(UserId(1), scope, 2, 4)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);

    let outcome = persistence
        .insert_direct_thread(DirectPairKey::new(UserId(9), UserId(2)))
        .await
        .expect("thread");
    assert_eq!(outcome, ThreadInsert::Existing(ThreadId(12)));
}

#[tokio::test]
async fn http_errors_are_classified_by_code_or_status() {
    let base = spawn_fake_server().await;
    let persistence = HttpPersistence::new(base);

    let err = persistence
        .insert_message(UserId(99), MessageScope::Channel(ChannelId(3)), "hi", None)
        .await
        .expect_err("forbidden");
    assert!(matches!(
        SyncError::from_collaborator(err),
        SyncError::Authorization(message) if message == "not a member"
    ));

    let err = persistence
        .query_participant_threads(UserId(1))
        .await
        .expect_err("unavailable");
    assert!(matches!(
        SyncError::from_collaborator(err),
        SyncError::Transient(_)
    ));
}

#[tokio::test]
async fn embedded_backend_echoes_writes_on_the_scope_topic() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let user = storage.create_user("alice").await.expect("user");
    let server = storage.create_server("home", user).await.expect("server");
    let channel = storage
        .create_channel(server, "general", ChannelKind::Text)
        .await
        .expect("channel");
    let scope = MessageScope::Channel(channel);

    let hub = LocalHub::new();
    let backend = EmbeddedBackend::new(storage, Arc::clone(&hub));
    let bus = hub.connect();
    let mut changes = bus
        .subscribe_data(Topic::messages(scope))
        .await
        .expect("subscribe");

    let message = backend
        .insert_message(user, scope, "hello", None)
        .await
        .expect("insert");
    let echoed = tokio::time::timeout(Duration::from_secs(1), changes.next())
        .await
        .expect("echo in time")
        .expect("stream open");
    assert_eq!(echoed, DataChange::Insert(message.clone()));

    let err = backend
        .update_message(
            user,
            MessageId(404),
            MessageUpdate::SoftDelete {
                deleted_at: Utc::now(),
            },
        )
        .await
        .expect_err("missing");
    assert!(matches!(
        SyncError::from_collaborator(err),
        SyncError::NotFound(_)
    ));
}
