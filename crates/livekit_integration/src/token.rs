use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use shared::domain::{ChannelId, ServerId};

pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 3600;

#[derive(Debug, Clone)]
pub struct LiveKitConfig {
    pub api_key: String,
    pub api_secret: String,
    pub ttl_seconds: i64,
    /// Signalling URL handed to clients, usually `ws://` or `wss://`.
    pub url: String,
}

/// Permissions embedded in an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub room_admin: bool,
}

impl TokenGrant {
    pub fn participant(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
            room_admin: false,
        }
    }

    pub fn room_admin(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            room_join: false,
            can_publish: false,
            can_subscribe: false,
            room_admin: true,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    room_join: bool,
    room: String,
    can_publish: bool,
    can_subscribe: bool,
    room_admin: bool,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    sub: String,
    nbf: i64,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    video: VideoGrant,
}

pub fn room_name_for_voice_channel(server_id: ServerId, channel_id: ChannelId) -> String {
    format!("{}:{}", server_id.0, channel_id.0)
}

pub fn mint_token(
    cfg: &LiveKitConfig,
    identity: &str,
    display_name: Option<&str>,
    grant: &TokenGrant,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        iss: cfg.api_key.clone(),
        sub: identity.to_string(),
        nbf: now.timestamp(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
        name: display_name.map(str::to_string),
        video: VideoGrant {
            room_join: grant.room_join,
            room: grant.room.clone(),
            can_publish: grant.can_publish,
            can_subscribe: grant.can_subscribe,
            room_admin: grant.room_admin,
        },
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.api_secret.as_bytes()),
    )
}

#[cfg(test)]
#[path = "tests/token_tests.rs"]
mod tests;
