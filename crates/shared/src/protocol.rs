use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ChannelId, DirectThread, Message, MessageId, MessageScope, ServerId, ThreadId,
        TypingPresenceEntry, UserId, VoiceParticipant,
    },
    error::ApiError,
};

/// A realtime topic. String forms follow the `messages:<id>`,
/// `dm_messages:<id>` and `typing:<id>` naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    Messages(MessageScope),
    Typing(ChannelId),
}

impl Topic {
    pub fn messages(scope: MessageScope) -> Self {
        Topic::Messages(scope)
    }

    pub fn typing(channel_id: ChannelId) -> Self {
        Topic::Typing(channel_id)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Messages(MessageScope::Channel(id)) => write!(f, "messages:{id}"),
            Topic::Messages(MessageScope::Thread(id)) => write!(f, "dm_messages:{id}"),
            Topic::Typing(id) => write!(f, "typing:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (family, id) = raw
            .split_once(':')
            .ok_or_else(|| format!("invalid topic '{raw}'"))?;
        let id = id
            .parse::<i64>()
            .map_err(|_| format!("invalid topic id in '{raw}'"))?;
        match family {
            "messages" => Ok(Topic::Messages(MessageScope::Channel(ChannelId(id)))),
            "dm_messages" => Ok(Topic::Messages(MessageScope::Thread(ThreadId(id)))),
            "typing" => Ok(Topic::Typing(ChannelId(id))),
            _ => Err(format!("unknown topic family in '{raw}'")),
        }
    }
}

impl TryFrom<String> for Topic {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.to_string()
    }
}

/// Data-change event family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum DataChange {
    Insert(Message),
    Update(Message),
    Delete { id: MessageId },
}

impl DataChange {
    pub fn message_id(&self) -> MessageId {
        match self {
            DataChange::Insert(message) | DataChange::Update(message) => message.id,
            DataChange::Delete { id } => *id,
        }
    }
}

/// Presence event family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "entries", rename_all = "snake_case")]
pub enum PresenceEvent {
    Sync(Vec<TypingPresenceEntry>),
    Join(Vec<TypingPresenceEntry>),
    Leave(Vec<TypingPresenceEntry>),
}

/// Frames a client sends to the realtime hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BusClientFrame {
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    Track { topic: Topic, entry: TypingPresenceEntry },
    Untrack { topic: Topic },
}

/// Frames the realtime hub pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BusServerFrame {
    Data { topic: Topic, change: DataChange },
    Presence { topic: Topic, event: PresenceEvent },
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub scope: MessageScope,
    pub user_id: UserId,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    pub scope: MessageScope,
    pub user_id: UserId,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub user_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuery {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleReactionRequest {
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureDirectThreadRequest {
    pub user_id: UserId,
    pub target_user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureDirectThreadResponse {
    pub thread_id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread: DirectThread,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedThreadsRequest {
    pub thread_ids: Vec<ThreadId>,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertThreadRequest {
    pub user_ids: [UserId; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertParticipantsRequest {
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceJoinRequest {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceTokenResponse {
    pub token: String,
    pub url: String,
    pub room_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceParticipantsRequest {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceParticipantsResponse {
    pub participants: Vec<VoiceParticipant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_stable() {
        assert_eq!(
            Topic::messages(MessageScope::Channel(ChannelId(3))).to_string(),
            "messages:3"
        );
        assert_eq!(
            Topic::messages(MessageScope::Thread(ThreadId(8))).to_string(),
            "dm_messages:8"
        );
        assert_eq!(Topic::typing(ChannelId(3)).to_string(), "typing:3");
        assert_eq!(
            "dm_messages:8".parse::<Topic>(),
            Ok(Topic::Messages(MessageScope::Thread(ThreadId(8))))
        );
    }

    #[test]
    fn delete_frame_carries_only_the_id() {
        let frame = BusServerFrame::Data {
            topic: Topic::typing(ChannelId(1)),
            change: DataChange::Delete { id: MessageId(77) },
        };
        let json = serde_json::to_value(&frame).expect("json");
        assert_eq!(json["type"], "data");
        assert_eq!(json["payload"]["topic"], "typing:1");
        assert_eq!(json["payload"]["change"]["type"], "delete");
        assert_eq!(json["payload"]["change"]["record"]["id"], 77);
    }
}
