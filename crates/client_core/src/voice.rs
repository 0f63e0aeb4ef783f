use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Weak},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use livekit_integration::{
    mint_token, room_name_for_voice_channel, LiveKitConfig, LiveKitRoomConnector,
    LiveKitRoomEvent, LiveKitRoomOptions, LiveKitRoomSession, RoomParticipant, RoomService,
    RoomServiceError, TokenGrant,
};
use reqwest::Client;
use shared::{
    domain::{
        Channel, ChannelId, ChannelKind, ServerId, UserId, VoiceParticipant,
        VoiceSessionDescriptor,
    },
    error::ApiException,
    protocol::{
        VoiceJoinRequest, VoiceParticipantsRequest, VoiceParticipantsResponse, VoiceTokenResponse,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{SyncError, SyncResult},
    persistence::decode_response,
    voice_store::VoiceSessionStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceTokenRequest {
    pub identity: UserId,
    pub display_name: String,
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub room_name: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub ttl_seconds: i64,
}

#[async_trait]
pub trait VoiceTokenIssuer: Send + Sync {
    async fn issue_token(&self, request: VoiceTokenRequest) -> Result<VoiceTokenResponse>;
}

/// Lists who is in a voice room without joining it.
#[async_trait]
pub trait VoiceRoster: Send + Sync {
    /// Empty when the room does not exist yet.
    async fn list_participants(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> Result<Vec<VoiceParticipant>>;
}

/// Mints tokens in process with the LiveKit API secret.
pub struct LocalTokenIssuer {
    config: LiveKitConfig,
}

impl LocalTokenIssuer {
    pub fn new(config: LiveKitConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VoiceTokenIssuer for LocalTokenIssuer {
    async fn issue_token(&self, request: VoiceTokenRequest) -> Result<VoiceTokenResponse> {
        let config = LiveKitConfig {
            ttl_seconds: request.ttl_seconds,
            ..self.config.clone()
        };
        let grant = TokenGrant {
            can_publish: request.can_publish,
            can_subscribe: request.can_subscribe,
            ..TokenGrant::participant(request.room_name.clone())
        };
        let token = mint_token(
            &config,
            &request.identity.to_string(),
            Some(&request.display_name),
            &grant,
        )
        .context("failed to mint voice token")?;
        Ok(VoiceTokenResponse {
            token,
            url: config.url,
            room_name: request.room_name,
        })
    }
}

/// Room roster straight from the LiveKit room service.
pub struct LiveKitRoster {
    service: Arc<dyn RoomService>,
}

impl LiveKitRoster {
    pub fn new(service: Arc<dyn RoomService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl VoiceRoster for LiveKitRoster {
    async fn list_participants(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> Result<Vec<VoiceParticipant>> {
        let room = room_name_for_voice_channel(server_id, channel_id);
        match self.service.list_participants(&room).await {
            Ok(participants) => Ok(participants
                .into_iter()
                .map(|info| VoiceParticipant {
                    audio_enabled: info.audio_enabled(),
                    display_name: if info.name.is_empty() {
                        info.identity.clone()
                    } else {
                        info.name
                    },
                    identity: info.identity,
                    is_speaking: false,
                    is_local: false,
                })
                .collect()),
            Err(RoomServiceError::RoomNotFound(room)) => {
                debug!(room = %room, "voice: room not started yet");
                Ok(Vec::new())
            }
            Err(err) => Err(anyhow!(err)),
        }
    }
}

/// Token issuance and room rosters through the server's `/voice` routes.
#[derive(Clone)]
pub struct HttpVoiceTokenIssuer {
    http: Client,
    base_url: String,
}

impl HttpVoiceTokenIssuer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }
}

#[async_trait]
impl VoiceTokenIssuer for HttpVoiceTokenIssuer {
    async fn issue_token(&self, request: VoiceTokenRequest) -> Result<VoiceTokenResponse> {
        let response = self
            .http
            .post(format!("{}/voice/join", self.base_url))
            .json(&VoiceJoinRequest {
                server_id: request.server_id,
                channel_id: request.channel_id,
                user_id: request.identity,
                ttl_seconds: Some(request.ttl_seconds),
            })
            .send()
            .await
            .context("failed to request voice token")?;
        decode_response(response).await
    }
}

#[async_trait]
impl VoiceRoster for HttpVoiceTokenIssuer {
    async fn list_participants(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> Result<Vec<VoiceParticipant>> {
        let response = self
            .http
            .post(format!("{}/voice/participants", self.base_url))
            .json(&VoiceParticipantsRequest {
                server_id,
                channel_id,
            })
            .send()
            .await
            .context("failed to list voice participants")?;
        let body: VoiceParticipantsResponse = decode_response(response).await?;
        Ok(body.participants)
    }
}

pub struct MissingLiveKitConnector;

#[async_trait]
impl LiveKitRoomConnector for MissingLiveKitConnector {
    async fn connect(
        &self,
        _options: LiveKitRoomOptions,
    ) -> Result<Arc<dyn LiveKitRoomSession>> {
        Err(anyhow!("voice transport is unavailable"))
    }
}

#[derive(Debug, Error)]
pub enum VoiceSessionError {
    #[error("failed to request voice token: {0}")]
    TokenRequest(String),
    #[error("voice token was issued for room {actual}, expected {expected}")]
    RoomMismatch { expected: String, actual: String },
    #[error("failed to connect voice room: {0}")]
    Connect(String),
    #[error("failed to toggle microphone: {0}")]
    Microphone(String),
    #[error("channel {0} is not a voice channel")]
    NotVoiceChannel(ChannelId),
    #[error("failed to persist voice session: {0}")]
    Store(String),
}

impl From<VoiceSessionError> for SyncError {
    fn from(value: VoiceSessionError) -> Self {
        match value {
            VoiceSessionError::NotVoiceChannel(_) => SyncError::Validation(value.to_string()),
            VoiceSessionError::Store(_) => SyncError::Transient(value.to_string()),
            VoiceSessionError::TokenRequest(_)
            | VoiceSessionError::RoomMismatch { .. }
            | VoiceSessionError::Connect(_)
            | VoiceSessionError::Microphone(_) => SyncError::Provider(value.to_string()),
        }
    }
}

fn token_error(err: anyhow::Error) -> SyncError {
    if err.downcast_ref::<ApiException>().is_some() {
        return SyncError::from_provider(err);
    }
    VoiceSessionError::TokenRequest(format!("{err:#}")).into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    SessionUpdated(Option<VoiceSessionDescriptor>),
    ParticipantsUpdated {
        room_name: String,
        participants: Vec<VoiceParticipant>,
    },
}

pub struct VoiceCollaborators {
    pub issuer: Arc<dyn VoiceTokenIssuer>,
    pub connector: Arc<dyn LiveKitRoomConnector>,
    pub roster: Arc<dyn VoiceRoster>,
    pub store: Arc<dyn VoiceSessionStore>,
    pub token_ttl_seconds: i64,
}

struct ActiveVoiceSession {
    descriptor: VoiceSessionDescriptor,
    room: Option<Arc<dyn LiveKitRoomSession>>,
    event_task: Option<JoinHandle<()>>,
    /// Mute state the transport last accepted; `None` until one sticks.
    mic_applied: Option<bool>,
}

#[derive(Default)]
struct VoiceState {
    active: Option<ActiveVoiceSession>,
    mic_muted: bool,
    speakers: HashSet<String>,
    participants: BTreeMap<String, VoiceParticipant>,
}

/// Owns the one voice session of this process. Views come and go; only
/// [`VoiceSessionCoordinator::leave`] ends the session.
pub struct VoiceSessionCoordinator {
    me: UserId,
    display_name: String,
    issuer: Arc<dyn VoiceTokenIssuer>,
    connector: Arc<dyn LiveKitRoomConnector>,
    roster: Arc<dyn VoiceRoster>,
    store: Arc<dyn VoiceSessionStore>,
    token_ttl_seconds: i64,
    // Serializes join/leave. Mic toggles only take `state`.
    ops: Mutex<()>,
    state: Mutex<VoiceState>,
    events: broadcast::Sender<VoiceEvent>,
}

impl VoiceSessionCoordinator {
    /// Builds the coordinator and drops any descriptor a previous process
    /// left behind; its token and transport are gone.
    pub async fn start(
        me: UserId,
        display_name: impl Into<String>,
        collaborators: VoiceCollaborators,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let coordinator = Arc::new(Self {
            me,
            display_name: display_name.into(),
            issuer: collaborators.issuer,
            connector: collaborators.connector,
            roster: collaborators.roster,
            store: collaborators.store,
            token_ttl_seconds: collaborators.token_ttl_seconds,
            ops: Mutex::new(()),
            state: Mutex::new(VoiceState::default()),
            events,
        });

        match coordinator.store.load().await {
            Ok(None) => {}
            Ok(Some(stale)) => {
                info!(room = %stale.room_name, "voice: discarding session from previous run");
                coordinator.clear_store().await;
            }
            Err(err) => {
                warn!("voice: unreadable stored session, discarding: {err:#}");
                coordinator.clear_store().await;
            }
        }
        coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub async fn descriptor(&self) -> Option<VoiceSessionDescriptor> {
        let state = self.state.lock().await;
        state.active.as_ref().map(|active| active.descriptor.clone())
    }

    pub async fn participants(&self) -> Vec<VoiceParticipant> {
        self.state.lock().await.participants.values().cloned().collect()
    }

    pub async fn join_channel(
        self: &Arc<Self>,
        channel: &Channel,
    ) -> SyncResult<VoiceSessionDescriptor> {
        if channel.kind != ChannelKind::Voice {
            return Err(VoiceSessionError::NotVoiceChannel(channel.id).into());
        }
        self.join(channel.server_id, channel.id).await
    }

    pub async fn join(
        self: &Arc<Self>,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> SyncResult<VoiceSessionDescriptor> {
        let _ops = self.ops.lock().await;
        let room_name = room_name_for_voice_channel(server_id, channel_id);

        {
            let state = self.state.lock().await;
            if let Some(active) = &state.active {
                if active.descriptor.room_name == room_name {
                    debug!(room = %room_name, "voice: already in room");
                    return Ok(active.descriptor.clone());
                }
            }
        }
        self.teardown().await;

        let token = self
            .issuer
            .issue_token(VoiceTokenRequest {
                identity: self.me,
                display_name: self.display_name.clone(),
                server_id,
                channel_id,
                room_name: room_name.clone(),
                can_publish: true,
                can_subscribe: true,
                ttl_seconds: self.token_ttl_seconds,
            })
            .await
            .map_err(token_error)?;
        if token.room_name != room_name {
            return Err(VoiceSessionError::RoomMismatch {
                expected: room_name,
                actual: token.room_name,
            }
            .into());
        }

        let descriptor = {
            let mut state = self.state.lock().await;
            let descriptor = VoiceSessionDescriptor {
                server_id,
                channel_id,
                room_name: room_name.clone(),
                access_token: token.token.clone(),
                transport_url: token.url.clone(),
                display_name: self.display_name.clone(),
                mic_muted: state.mic_muted,
            };
            self.store
                .save(&descriptor)
                .await
                .map_err(|err| VoiceSessionError::Store(format!("{err:#}")))?;
            state.active = Some(ActiveVoiceSession {
                descriptor: descriptor.clone(),
                room: None,
                event_task: None,
                mic_applied: None,
            });
            descriptor
        };

        let room = match self
            .connector
            .connect(LiveKitRoomOptions {
                url: descriptor.transport_url.clone(),
                room_name: room_name.clone(),
                token: descriptor.access_token.clone(),
            })
            .await
        {
            Ok(room) => room,
            Err(err) => {
                warn!(room = %room_name, "voice: connect failed: {err:#}");
                self.state.lock().await.active = None;
                self.clear_store().await;
                return Err(VoiceSessionError::Connect(format!("{err:#}")).into());
            }
        };

        let (descriptor, participants) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(active) = state.active.as_mut() else {
                if let Err(err) = room.leave().await {
                    warn!(room = %room_name, "voice: leave failed: {err:#}");
                }
                let err = VoiceSessionError::Connect("session ended while connecting".into());
                return Err(err.into());
            };

            // Apply whatever mute state was requested while connecting.
            let muted = state.mic_muted;
            let applied = match room.set_microphone_enabled(!muted).await {
                Ok(()) => Some(muted),
                Err(err) => {
                    warn!(room = %room_name, muted, "voice: failed to apply mic state: {err:#}");
                    None
                }
            };
            active.descriptor.mic_muted =
                applied.unwrap_or(!room.local_participant().audio_enabled);
            active.mic_applied = applied;
            active.event_task =
                Some(self.spawn_room_event_task(room_name.clone(), Arc::clone(&room)));
            active.room = Some(Arc::clone(&room));
            let descriptor = active.descriptor.clone();

            state.speakers.clear();
            state.participants = snapshot_participants(room.as_ref(), &state.speakers);
            (
                descriptor,
                state.participants.values().cloned().collect::<Vec<_>>(),
            )
        };
        if let Err(err) = self.store.save(&descriptor).await {
            warn!(room = %room_name, "voice: failed to persist mic state: {err:#}");
        }

        info!(
            room = %room_name,
            server_id = server_id.0,
            channel_id = channel_id.0,
            "voice: joined"
        );
        let _ = self
            .events
            .send(VoiceEvent::SessionUpdated(Some(descriptor.clone())));
        let _ = self.events.send(VoiceEvent::ParticipantsUpdated {
            room_name,
            participants,
        });
        Ok(descriptor)
    }

    pub async fn leave(&self) -> SyncResult<()> {
        let _ops = self.ops.lock().await;
        if !self.teardown().await {
            self.clear_store().await;
        }
        Ok(())
    }

    /// Records the intended mic state and, once connected, flips local
    /// publishing on the live room. The session descriptor only reports a
    /// state after the transport accepted it, so a failed toggle can be
    /// retried.
    pub async fn set_mic_muted(&self, muted: bool) -> SyncResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.mic_muted = muted;

        let Some(active) = state.active.as_mut() else {
            debug!(muted, "voice: mic state recorded without a session");
            return Ok(());
        };
        let Some(room) = active.room.clone() else {
            // Still connecting; join applies the recorded state.
            return Ok(());
        };
        if active.mic_applied == Some(muted) {
            return Ok(());
        }

        room.set_microphone_enabled(!muted)
            .await
            .map_err(|err| VoiceSessionError::Microphone(format!("{err:#}")))?;
        active.mic_applied = Some(muted);
        active.descriptor.mic_muted = muted;
        let descriptor = active.descriptor.clone();
        state.participants = snapshot_participants(room.as_ref(), &state.speakers);
        let participants = state.participants.values().cloned().collect::<Vec<_>>();
        drop(guard);

        if let Err(err) = self.store.save(&descriptor).await {
            warn!(room = %descriptor.room_name, "voice: failed to persist mic state: {err:#}");
        }
        debug!(room = %descriptor.room_name, muted, "voice: mic toggled");
        let room_name = descriptor.room_name.clone();
        let _ = self.events.send(VoiceEvent::SessionUpdated(Some(descriptor)));
        let _ = self.events.send(VoiceEvent::ParticipantsUpdated {
            room_name,
            participants,
        });
        Ok(())
    }

    /// Who is in a room, joined or not.
    pub async fn poll_room_participants(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
    ) -> SyncResult<Vec<VoiceParticipant>> {
        let me = self.me.to_string();
        let participants = self
            .roster
            .list_participants(server_id, channel_id)
            .await
            .map_err(SyncError::from_provider)?;
        Ok(participants
            .into_iter()
            .map(|participant| VoiceParticipant {
                is_local: participant.identity == me,
                ..participant
            })
            .collect())
    }

    /// Ends the active session, if any. Caller holds `ops`.
    async fn teardown(&self) -> bool {
        let active = {
            let mut state = self.state.lock().await;
            state.speakers.clear();
            state.participants.clear();
            state.active.take()
        };
        let Some(active) = active else {
            return false;
        };

        self.clear_store().await;
        let _ = self.events.send(VoiceEvent::SessionUpdated(None));
        if let Some(task) = active.event_task {
            task.abort();
        }
        if let Some(room) = active.room {
            if let Err(err) = room.leave().await {
                warn!(room = %active.descriptor.room_name, "voice: leave failed: {err:#}");
            }
        }
        info!(room = %active.descriptor.room_name, "voice: left");
        true
    }

    async fn clear_store(&self) {
        if let Err(err) = self.store.clear().await {
            warn!("voice: failed to clear stored session: {err:#}");
        }
    }

    fn spawn_room_event_task(
        self: &Arc<Self>,
        room_name: String,
        room: Arc<dyn LiveKitRoomSession>,
    ) -> JoinHandle<()> {
        let mut events = room.subscribe_events();
        let coordinator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(room = %room_name, skipped, "voice: room events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.apply_room_event(&room_name, room.as_ref(), event).await;
            }
        })
    }

    async fn apply_room_event(
        &self,
        room_name: &str,
        room: &dyn LiveKitRoomSession,
        event: LiveKitRoomEvent,
    ) {
        let mut state = self.state.lock().await;
        let current = state
            .active
            .as_ref()
            .is_some_and(|active| active.descriptor.room_name == room_name);
        if !current {
            return;
        }

        match event {
            LiveKitRoomEvent::ActiveSpeakersChanged { identities } => {
                state.speakers = identities.into_iter().collect();
            }
            LiveKitRoomEvent::ParticipantLeft { identity } => {
                state.speakers.remove(&identity);
            }
            LiveKitRoomEvent::Disconnected { reason } => {
                warn!(room = %room_name, ?reason, "voice: transport disconnected");
            }
            LiveKitRoomEvent::Connected
            | LiveKitRoomEvent::ParticipantJoined(_)
            | LiveKitRoomEvent::TrackMuted { .. } => {}
        }

        let snapshot = snapshot_participants(room, &state.speakers);
        if snapshot == state.participants {
            return;
        }
        state.participants = snapshot;
        let participants = state.participants.values().cloned().collect();
        drop(state);
        let _ = self.events.send(VoiceEvent::ParticipantsUpdated {
            room_name: room_name.to_string(),
            participants,
        });
    }
}

impl Drop for VoiceSessionCoordinator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(task) = state
            .active
            .as_mut()
            .and_then(|active| active.event_task.take())
        {
            task.abort();
        }
    }
}

fn to_voice_participant(
    participant: RoomParticipant,
    speakers: &HashSet<String>,
    is_local: bool,
) -> VoiceParticipant {
    let is_speaking = participant.is_speaking || speakers.contains(&participant.identity);
    VoiceParticipant {
        display_name: if participant.name.is_empty() {
            participant.identity.clone()
        } else {
            participant.name
        },
        identity: participant.identity,
        audio_enabled: participant.audio_enabled,
        is_speaking,
        is_local,
    }
}

fn snapshot_participants(
    room: &dyn LiveKitRoomSession,
    speakers: &HashSet<String>,
) -> BTreeMap<String, VoiceParticipant> {
    let local = to_voice_participant(room.local_participant(), speakers, true);
    let mut participants = BTreeMap::new();
    for remote in room.remote_participants() {
        let remote = to_voice_participant(remote, speakers, false);
        participants.insert(remote.identity.clone(), remote);
    }
    participants.insert(local.identity.clone(), local);
    participants
}

#[cfg(test)]
#[path = "tests/voice_tests.rs"]
mod tests;
