use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::token::{mint_token, LiveKitConfig, TokenGrant};

const LIST_PARTICIPANTS_PATH: &str = "/twirp/livekit.RoomService/ListParticipants";
const ROOM_SERVICE_IDENTITY: &str = "room-service";

#[derive(Debug, Error)]
pub enum RoomServiceError {
    #[error("room '{0}' does not exist")]
    RoomNotFound(String),
    #[error("failed to sign room service token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("room service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("room service returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
    Data,
}

impl<'de> Deserialize<'de> for TrackKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Enum values arrive either by name or by number depending on the
        // server's JSON marshalling options.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Number(i64),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Name(name) if name.eq_ignore_ascii_case("AUDIO") => TrackKind::Audio,
            Repr::Name(name) if name.eq_ignore_ascii_case("VIDEO") => TrackKind::Video,
            Repr::Number(0) => TrackKind::Audio,
            Repr::Number(1) => TrackKind::Video,
            _ => TrackKind::Data,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackInfo {
    #[serde(default)]
    pub sid: String,
    #[serde(rename = "type", default = "default_track_kind")]
    pub kind: TrackKind,
    #[serde(default)]
    pub muted: bool,
}

fn default_track_kind() -> TrackKind {
    TrackKind::Audio
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantInfo {
    #[serde(default)]
    pub sid: String,
    pub identity: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tracks: Vec<TrackInfo>,
}

impl ParticipantInfo {
    /// True when at least one published audio track is unmuted.
    pub fn audio_enabled(&self) -> bool {
        self.tracks
            .iter()
            .any(|track| track.kind == TrackKind::Audio && !track.muted)
    }
}

#[derive(Debug, Deserialize)]
struct ListParticipantsResponse {
    #[serde(default)]
    participants: Vec<ParticipantInfo>,
}

#[derive(Debug, Serialize)]
struct ListParticipantsRequest<'a> {
    room: &'a str,
}

#[derive(Debug, Deserialize)]
struct TwirpError {
    #[serde(default)]
    code: String,
}

#[async_trait]
pub trait RoomService: Send + Sync {
    async fn list_participants(&self, room: &str)
        -> Result<Vec<ParticipantInfo>, RoomServiceError>;
}

/// Room service client speaking the Twirp JSON API.
pub struct HttpRoomService {
    http: Client,
    config: LiveKitConfig,
    base_url: String,
}

impl HttpRoomService {
    pub fn new(config: LiveKitConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(http: Client, config: LiveKitConfig) -> Self {
        let base_url = to_http_url(&config.url).trim_end_matches('/').to_string();
        Self {
            http,
            config,
            base_url,
        }
    }
}

#[async_trait]
impl RoomService for HttpRoomService {
    async fn list_participants(
        &self,
        room: &str,
    ) -> Result<Vec<ParticipantInfo>, RoomServiceError> {
        let token = mint_token(
            &self.config,
            ROOM_SERVICE_IDENTITY,
            None,
            &TokenGrant::room_admin(room),
        )?;
        let response = self
            .http
            .post(format!("{}{LIST_PARTICIPANTS_PATH}", self.base_url))
            .bearer_auth(token)
            .json(&ListParticipantsRequest { room })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: ListParticipantsResponse = response.json().await?;
            debug!(room, count = body.participants.len(), "room service: listed participants");
            return Ok(body.participants);
        }

        let body = response.text().await.unwrap_or_default();
        let twirp_code = serde_json::from_str::<TwirpError>(&body)
            .map(|err| err.code)
            .unwrap_or_default();
        if status == StatusCode::NOT_FOUND || twirp_code == "not_found" {
            return Err(RoomServiceError::RoomNotFound(room.to_string()));
        }
        Err(RoomServiceError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Maps a `ws://`/`wss://` signalling URL to its `http://`/`https://`
/// counterpart. Anything unparseable is returned unchanged.
pub fn to_http_url(ws_url: &str) -> String {
    let Ok(mut url) = Url::parse(ws_url) else {
        return ws_url.to_string();
    };
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return url.to_string(),
    };
    if url.set_scheme(scheme).is_err() {
        return ws_url.to_string();
    }
    url.to_string()
}

#[cfg(test)]
#[path = "tests/room_service_tests.rs"]
mod tests;
