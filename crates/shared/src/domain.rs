use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ServerId);
id_newtype!(ChannelId);
id_newtype!(MessageId);
id_newtype!(ThreadId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Text => "text",
            ChannelKind::Voice => "voice",
        }
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "text" => Ok(ChannelKind::Text),
            "voice" => Ok(ChannelKind::Voice),
            other => Err(format!("unknown channel kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse_lossy(raw: &str) -> Self {
        match raw {
            "owner" => Role::Owner,
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    pub kind: ChannelKind,
}

/// The conversation a message belongs to: a server channel or a direct thread.
///
/// Serialized as `channel:<id>` / `thread:<id>` so it can travel in query
/// strings as well as JSON bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MessageScope {
    Channel(ChannelId),
    Thread(ThreadId),
}

impl MessageScope {
    pub fn channel_id(self) -> Option<ChannelId> {
        match self {
            MessageScope::Channel(id) => Some(id),
            MessageScope::Thread(_) => None,
        }
    }

    pub fn thread_id(self) -> Option<ThreadId> {
        match self {
            MessageScope::Thread(id) => Some(id),
            MessageScope::Channel(_) => None,
        }
    }
}

impl fmt::Display for MessageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageScope::Channel(id) => write!(f, "channel:{id}"),
            MessageScope::Thread(id) => write!(f, "thread:{id}"),
        }
    }
}

impl FromStr for MessageScope {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| format!("invalid message scope '{raw}'"))?;
        let id = id
            .parse::<i64>()
            .map_err(|_| format!("invalid message scope id in '{raw}'"))?;
        match kind {
            "channel" => Ok(MessageScope::Channel(ChannelId(id))),
            "thread" => Ok(MessageScope::Thread(ThreadId(id))),
            _ => Err(format!("invalid message scope kind in '{raw}'")),
        }
    }
}

impl TryFrom<String> for MessageScope {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MessageScope> for String {
    fn from(value: MessageScope) -> Self {
        value.to_string()
    }
}

pub type Reactions = BTreeMap<String, BTreeSet<UserId>>;

/// A channel message or direct message as held by persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub scope: MessageScope,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    #[serde(default)]
    pub reactions: Reactions,
}

/// Field changes accepted by `update_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageUpdate {
    Edit {
        content: String,
        edited_at: DateTime<Utc>,
    },
    SoftDelete {
        deleted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPresenceEntry {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub started_at: DateTime<Utc>,
}

/// Order-independent key of a one-to-one pair: `"{low}:{high}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectPairKey {
    low: UserId,
    high: UserId,
}

impl DirectPairKey {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn members(&self) -> [UserId; 2] {
        [self.low, self.high]
    }
}

impl fmt::Display for DirectPairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// Outcome of inserting a one-to-one thread under the pair-key constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "thread_id", rename_all = "snake_case")]
pub enum ThreadInsert {
    Created(ThreadId),
    Existing(ThreadId),
}

impl ThreadInsert {
    pub fn thread_id(self) -> ThreadId {
        match self {
            ThreadInsert::Created(id) | ThreadInsert::Existing(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectThread {
    pub id: ThreadId,
    pub is_group: bool,
    pub participants: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DirectThread {
    pub fn other_participant(&self, me: UserId) -> Option<UserId> {
        if self.is_group {
            return None;
        }
        self.participants.iter().copied().find(|id| *id != me)
    }
}

/// Client-local record of the one active voice session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSessionDescriptor {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub room_name: String,
    pub access_token: String,
    pub transport_url: String,
    pub display_name: String,
    pub mic_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParticipant {
    pub identity: String,
    pub display_name: String,
    pub audio_enabled: bool,
    pub is_speaking: bool,
    pub is_local: bool,
}
