use std::sync::Arc;

use anyhow::Result;
use livekit_integration::LiveKitRoomConnector;
use shared::domain::{MessageScope, UserId};
use tracing::info;

pub mod bus;
pub mod config;
pub mod error;
pub mod messages;
pub mod persistence;
pub mod threads;
pub mod typing;
pub mod view;
pub mod voice;
pub mod voice_store;
pub mod ws_bus;

pub use bus::{LocalBus, LocalHub, RealtimeBus};
pub use self::config::{load_client_settings, ClientSettings};
pub use error::{SyncError, SyncResult};
pub use messages::{LocalId, MessageStore, Timeline, TimelineEntry};
pub use persistence::{EmbeddedBackend, HttpPersistence, MessagePersistence, ThreadPersistence};
pub use threads::DirectThreadResolver;
pub use typing::TypingTracker;
pub use view::{ConversationView, ViewOptions};
pub use voice::{
    HttpVoiceTokenIssuer, LiveKitRoster, LocalTokenIssuer, MissingLiveKitConnector,
    VoiceCollaborators, VoiceEvent, VoiceSessionCoordinator, VoiceSessionError, VoiceTokenIssuer,
};
pub use voice_store::{FileVoiceSessionStore, MemoryVoiceSessionStore, VoiceSessionStore};
pub use ws_bus::WsBus;

pub struct ClientCollaborators {
    pub bus: Arc<dyn RealtimeBus>,
    pub messages: Arc<dyn MessagePersistence>,
    pub threads: Arc<dyn ThreadPersistence>,
    pub voice: VoiceCollaborators,
}

/// One signed-in user's view of the product: conversations open and close,
/// the voice session stays.
pub struct RealtimeClient {
    me: UserId,
    bus: Arc<dyn RealtimeBus>,
    messages: Arc<dyn MessagePersistence>,
    threads: DirectThreadResolver,
    voice: Arc<VoiceSessionCoordinator>,
    view_options: ViewOptions,
}

impl RealtimeClient {
    pub async fn new(
        me: UserId,
        display_name: impl Into<String>,
        collaborators: ClientCollaborators,
        view_options: ViewOptions,
    ) -> Arc<Self> {
        let voice = VoiceSessionCoordinator::start(me, display_name, collaborators.voice).await;
        Arc::new(Self {
            me,
            bus: collaborators.bus,
            messages: collaborators.messages,
            threads: DirectThreadResolver::new(collaborators.threads),
            voice,
            view_options,
        })
    }

    /// Wires the HTTP persistence, the websocket bus and the server-issued
    /// voice tokens described by `settings`.
    pub async fn connect(
        settings: &ClientSettings,
        me: UserId,
        display_name: impl Into<String>,
        connector: Arc<dyn LiveKitRoomConnector>,
    ) -> Result<Arc<Self>> {
        let bus = WsBus::connect(&settings.server_url, me).await?;
        let persistence = Arc::new(HttpPersistence::new(settings.server_url.clone()));
        let voice_api = Arc::new(HttpVoiceTokenIssuer::new(settings.server_url.clone()));
        let collaborators = ClientCollaborators {
            bus: Arc::new(bus),
            messages: persistence.clone(),
            threads: persistence,
            voice: VoiceCollaborators {
                issuer: voice_api.clone(),
                connector,
                roster: voice_api,
                store: Arc::new(FileVoiceSessionStore::new(
                    settings.voice_session_path.clone(),
                )),
                token_ttl_seconds: settings.voice_token_ttl_seconds,
            },
        };
        info!(server_url = %settings.server_url, user_id = me.0, "client: connected");
        Ok(Self::new(me, display_name, collaborators, settings.view_options()).await)
    }

    pub fn user_id(&self) -> UserId {
        self.me
    }

    pub fn bus(&self) -> &Arc<dyn RealtimeBus> {
        &self.bus
    }

    pub fn threads(&self) -> &DirectThreadResolver {
        &self.threads
    }

    pub fn voice(&self) -> &Arc<VoiceSessionCoordinator> {
        &self.voice
    }

    pub async fn open_conversation(&self, scope: MessageScope) -> SyncResult<ConversationView> {
        ConversationView::open(
            self.me,
            scope,
            Arc::clone(&self.bus),
            Arc::clone(&self.messages),
            self.view_options,
        )
        .await
    }

    pub async fn open_direct_thread(&self, target: UserId) -> SyncResult<ConversationView> {
        let thread_id = self.threads.ensure_direct_thread(self.me, target).await?;
        self.open_conversation(MessageScope::Thread(thread_id)).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
