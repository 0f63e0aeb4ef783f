use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

mod room_service;
mod token;

pub use room_service::{
    to_http_url, HttpRoomService, ParticipantInfo, RoomService, RoomServiceError, TrackInfo,
    TrackKind,
};
pub use token::{
    mint_token, room_name_for_voice_channel, LiveKitConfig, TokenGrant,
    DEFAULT_TOKEN_TTL_SECONDS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveKitRoomOptions {
    pub url: String,
    pub room_name: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomParticipant {
    pub identity: String,
    pub name: String,
    pub audio_enabled: bool,
    pub is_speaking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveKitRoomEvent {
    Connected,
    ParticipantJoined(RoomParticipant),
    ParticipantLeft { identity: String },
    ActiveSpeakersChanged { identities: Vec<String> },
    TrackMuted { identity: String, muted: bool },
    Disconnected { reason: Option<String> },
}

/// A connected room. Implementations own the media transport.
#[async_trait]
pub trait LiveKitRoomSession: Send + Sync {
    /// Toggles local microphone publishing without renegotiating the room.
    async fn set_microphone_enabled(&self, enabled: bool) -> anyhow::Result<()>;
    async fn leave(&self) -> anyhow::Result<()>;
    fn local_participant(&self) -> RoomParticipant;
    fn remote_participants(&self) -> Vec<RoomParticipant>;
    fn subscribe_events(&self) -> broadcast::Receiver<LiveKitRoomEvent>;
}

#[async_trait]
pub trait LiveKitRoomConnector: Send + Sync {
    async fn connect(&self, options: LiveKitRoomOptions)
        -> anyhow::Result<Arc<dyn LiveKitRoomSession>>;
}
