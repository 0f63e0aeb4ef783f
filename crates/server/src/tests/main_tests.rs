use super::*;
use async_trait::async_trait;
use axum::{body, body::Body, http::Request};
use client_core::{HttpPersistence, MessagePersistence, RealtimeBus, WsBus};
use futures::StreamExt;
use livekit_integration::{LiveKitConfig, ParticipantInfo, RoomService, RoomServiceError};
use shared::{
    domain::{ChannelId, ChannelKind, MessageScope, ServerId, TypingPresenceEntry},
    protocol::PresenceEvent,
};
use std::time::Duration;
use tower::ServiceExt;

struct EmptyRooms;

#[async_trait]
impl RoomService for EmptyRooms {
    async fn list_participants(
        &self,
        room: &str,
    ) -> Result<Vec<ParticipantInfo>, RoomServiceError> {
        Err(RoomServiceError::RoomNotFound(room.to_string()))
    }
}

struct TestApp {
    state: Arc<AppState>,
    router: Router,
    user: UserId,
    server: ServerId,
    text: ChannelId,
    voice: ChannelId,
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let user = storage.create_user("alice").await.expect("user");
    let server = storage.create_server("home", user).await.expect("server");
    let text = storage
        .create_channel(server, "general", ChannelKind::Text)
        .await
        .expect("text");
    let voice = storage
        .create_channel(server, "lounge", ChannelKind::Voice)
        .await
        .expect("voice");

    let api = ApiContext {
        storage,
        livekit: LiveKitConfig {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            ttl_seconds: 600,
            url: "ws://voice.test".to_string(),
        },
        room_service: Arc::new(EmptyRooms),
    };
    let state = Arc::new(AppState {
        api,
        hub: LocalHub::new(),
    });
    TestApp {
        router: build_router(Arc::clone(&state)),
        state,
        user,
        server,
        text,
        voice,
    }
}

fn post_json(uri: &str, value: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .expect("request")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

async fn serve(app: &TestApp) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn sending_a_message_publishes_the_insert() {
    let app = test_app().await;
    let scope = MessageScope::Channel(app.text);
    let subscriber = app.state.hub.connect();
    let mut changes = subscriber
        .subscribe_data(Topic::messages(scope))
        .await
        .expect("subscribe");

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/messages",
            serde_json::json!({ "scope": scope, "user_id": app.user, "content": "hello" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let message: Message = read_json(response).await;
    assert_eq!(message.content, "hello");

    let change = tokio::time::timeout(Duration::from_secs(1), changes.next())
        .await
        .expect("published")
        .expect("change");
    assert_eq!(change, DataChange::Insert(message));

    let list = Request::get(format!(
        "/messages?scope=channel:{}&user_id={}",
        app.text.0, app.user.0
    ))
    .body(Body::empty())
    .expect("request");
    let response = app.router.oneshot(list).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let page: Vec<Message> = read_json(response).await;
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn errors_carry_their_status_and_code() {
    let app = test_app().await;
    let outsider = app
        .state
        .api
        .storage
        .create_user("outsider")
        .await
        .expect("user");

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/messages",
            serde_json::json!({
                "scope": MessageScope::Channel(app.text),
                "user_id": outsider,
                "content": "hi",
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let err: ApiError = read_json(response).await;
    assert_eq!(err.code, ErrorCode::Forbidden);

    let response = app
        .router
        .oneshot(post_json(
            "/voice/join",
            serde_json::json!({
                "server_id": app.server,
                "channel_id": app.text,
                "user_id": app.user,
            }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_publishes_an_update_with_the_placeholder() {
    let app = test_app().await;
    let scope = MessageScope::Channel(app.text);
    let sent: Message = read_json(
        app.router
            .clone()
            .oneshot(post_json(
                "/messages",
                serde_json::json!({ "scope": scope, "user_id": app.user, "content": "bye" }),
            ))
            .await
            .expect("response"),
    )
    .await;

    let subscriber = app.state.hub.connect();
    let mut changes = subscriber
        .subscribe_data(Topic::messages(scope))
        .await
        .expect("subscribe");
    let delete = Request::delete(format!("/messages/{}?user_id={}", sent.id.0, app.user.0))
        .body(Body::empty())
        .expect("request");
    let response = app.router.oneshot(delete).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let change = tokio::time::timeout(Duration::from_secs(1), changes.next())
        .await
        .expect("published")
        .expect("change");
    match change {
        DataChange::Update(message) => {
            assert_eq!(message.id, sent.id);
            assert!(message.is_deleted);
        }
        other => panic!("expected an update, got {other:?}"),
    }
}

#[tokio::test]
async fn ensure_route_returns_one_thread_per_pair() {
    let app = test_app().await;
    let bob = app
        .state
        .api
        .storage
        .create_user("bob")
        .await
        .expect("bob");

    let mut ids = Vec::new();
    for (me, target) in [(app.user, bob), (bob, app.user)] {
        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/dms/ensure",
                serde_json::json!({ "user_id": me, "target_user_id": target }),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body: EnsureDirectThreadResponse = read_json(response).await;
        ids.push(body.thread_id);
    }
    assert_eq!(ids[0], ids[1]);

    let list = Request::get(format!("/dms/threads?user_id={}", bob.0))
        .body(Body::empty())
        .expect("request");
    let threads: Vec<ThreadSummary> =
        read_json(app.router.oneshot(list).await.expect("response")).await;
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].other_user_id, Some(app.user));
}

#[tokio::test]
async fn voice_participants_for_an_empty_room_is_an_empty_list() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(post_json(
            "/voice/participants",
            serde_json::json!({ "server_id": app.server, "channel_id": app.voice }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body: VoiceParticipantsResponse = read_json(response).await;
    assert!(body.participants.is_empty());
}

#[tokio::test]
async fn websocket_clients_share_presence_and_lose_it_on_disconnect() {
    let app = test_app().await;
    let base_url = serve(&app).await;
    let topic = Topic::typing(app.text);

    let watcher = WsBus::connect(&base_url, UserId(99)).await.expect("watcher");
    let mut events = watcher.subscribe_presence(topic).await.expect("presence");
    let first = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("sync")
        .expect("event");
    assert_eq!(first, PresenceEvent::Sync(Vec::new()));

    let typist = WsBus::connect(&base_url, app.user).await.expect("typist");
    let entry = TypingPresenceEntry {
        user_id: app.user,
        channel_id: app.text,
        started_at: chrono::Utc::now(),
    };
    typist
        .publish_presence(topic, entry.clone())
        .await
        .expect("track");
    let joined = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("join")
        .expect("event");
    assert_eq!(joined, PresenceEvent::Join(vec![entry.clone()]));

    drop(typist);
    let left = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .expect("leave")
        .expect("event");
    assert_eq!(left, PresenceEvent::Leave(vec![entry]));
}

#[tokio::test]
async fn http_writes_reach_websocket_subscribers() {
    let app = test_app().await;
    let base_url = serve(&app).await;
    let scope = MessageScope::Channel(app.text);

    let bus = WsBus::connect(&base_url, app.user).await.expect("bus");
    let mut changes = bus
        .subscribe_data(Topic::messages(scope))
        .await
        .expect("subscribe");
    // The subscribe frame travels ahead of the HTTP write but is handled
    // on another task.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let persistence = HttpPersistence::new(base_url);
    let sent = persistence
        .insert_message(app.user, scope, "over the wire", None)
        .await
        .expect("insert");

    let change = tokio::time::timeout(Duration::from_secs(2), changes.next())
        .await
        .expect("published")
        .expect("change");
    assert_eq!(change, DataChange::Insert(sent));
}
