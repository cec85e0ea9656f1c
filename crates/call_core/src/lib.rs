use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use shared::{
    domain::{CallId, CallReference, Peer, PeerId},
    participant::{CallState, MuteState},
    protocol::{
        BlockchainParticipant, CallSettingsRequest, EditParticipantRequest,
        FetchParticipantsRequest, MemberEvent, ParticipantsSnapshot, PushUpdate,
        RecordingRequest, SpeakingActivity, Update, UpdatesEnvelope,
    },
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::debug;

pub mod activity;
pub mod blockchain;
pub mod config;
mod engine;
mod mutations;
pub mod overlay;
pub mod processor;
pub mod projection;

pub use activity::ServiceState;
pub use config::{load_settings, load_settings_from, EngineSettings, SettingsError};

use engine::Command;
use mutations::VideoFlags;

/// Server side of a call's participant list.
#[async_trait]
pub trait ParticipantsBackend: Send + Sync {
    async fn fetch_participants(
        &self,
        request: FetchParticipantsRequest,
    ) -> Result<ParticipantsSnapshot>;
    async fn edit_participant(
        &self,
        request: EditParticipantRequest,
    ) -> Result<Option<UpdatesEnvelope>>;
    async fn toggle_call_settings(
        &self,
        request: CallSettingsRequest,
    ) -> Result<Option<UpdatesEnvelope>>;
    async fn toggle_recording(&self, request: RecordingRequest)
        -> Result<Option<UpdatesEnvelope>>;
    async fn toggle_schedule_subscription(
        &self,
        parent_peer_id: PeerId,
        call: CallReference,
        subscribe: bool,
    ) -> Result<()>;
}

pub struct MissingParticipantsBackend;

#[async_trait]
impl ParticipantsBackend for MissingParticipantsBackend {
    async fn fetch_participants(
        &self,
        request: FetchParticipantsRequest,
    ) -> Result<ParticipantsSnapshot> {
        Err(anyhow!(
            "participants backend unavailable for call {}",
            request.call.call_id
        ))
    }

    async fn edit_participant(
        &self,
        request: EditParticipantRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        Err(anyhow!(
            "participants backend unavailable for call {} peer {}",
            request.call.call_id,
            request.peer_id
        ))
    }

    async fn toggle_call_settings(
        &self,
        request: CallSettingsRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        Err(anyhow!(
            "participants backend unavailable for call {}",
            request.call.call_id
        ))
    }

    async fn toggle_recording(
        &self,
        request: RecordingRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        Err(anyhow!(
            "participants backend unavailable for call {}",
            request.call.call_id
        ))
    }

    async fn toggle_schedule_subscription(
        &self,
        parent_peer_id: PeerId,
        call: CallReference,
        _subscribe: bool,
    ) -> Result<()> {
        Err(anyhow!(
            "participants backend unavailable for call {} parent {}",
            call.call_id,
            parent_peer_id
        ))
    }
}

/// Local identity store. Unknown ids are left out of the result.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn resolve(&self, ids: &[PeerId]) -> HashMap<PeerId, Peer>;
}

pub struct MissingPeerDirectory;

#[async_trait]
impl PeerDirectory for MissingPeerDirectory {
    async fn resolve(&self, _ids: &[PeerId]) -> HashMap<PeerId, Peer> {
        HashMap::new()
    }
}

/// Receives encrypted-chain blocks; the engine only routes them.
pub trait ChainBlockSink: Send + Sync {
    fn submit(&self, call_id: CallId, sub_chain_id: i32, blocks: Vec<Vec<u8>>, next_offset: i32);
}

pub struct MissingChainBlockSink;

impl ChainBlockSink for MissingChainBlockSink {
    fn submit(&self, call_id: CallId, sub_chain_id: i32, blocks: Vec<Vec<u8>>, _next_offset: i32) {
        debug!(
            call_id = %call_id,
            sub_chain_id,
            blocks = blocks.len(),
            "participants: no chain sink, dropping blocks"
        );
    }
}

/// Wall clock in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct CallContext {
    pub reference: CallReference,
    /// The signed-in account; admin checks use this id.
    pub account_peer_id: PeerId,
    /// The identity the account joined the call as.
    pub my_peer_id: PeerId,
    /// Chat that owns the call, required for schedule subscriptions.
    pub parent_peer_id: Option<PeerId>,
    pub previous_service_state: Option<ServiceState>,
}

#[derive(Clone)]
pub struct Dependencies {
    pub backend: Arc<dyn ParticipantsBackend>,
    pub directory: Arc<dyn PeerDirectory>,
    pub chain_blocks: Arc<dyn ChainBlockSink>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Dependencies {
    fn default() -> Self {
        Self {
            backend: Arc::new(MissingParticipantsBackend),
            directory: Arc::new(MissingPeerDirectory),
            chain_blocks: Arc::new(MissingChainBlockSink),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Input streams the engine subscribes to for its whole lifetime.
#[derive(Default)]
pub struct Feeds {
    pub updates: Option<BoxStream<'static, PushUpdate>>,
    pub presence: Option<BoxStream<'static, Vec<SpeakingActivity>>>,
    pub blockchain: Option<BoxStream<'static, Vec<BlockchainParticipant>>>,
}

/// Cloneable handle to a running participants engine. The engine stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct GroupCallParticipants {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
    active_speakers: watch::Receiver<HashSet<PeerId>>,
    member_events: broadcast::Sender<MemberEvent>,
}

impl GroupCallParticipants {
    /// Starts the engine on the current tokio runtime.
    pub fn spawn(
        context: CallContext,
        initial_state: CallState,
        dependencies: Dependencies,
        feeds: Feeds,
        settings: EngineSettings,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (member_events, _) = broadcast::channel(settings.member_event_buffer.max(1));
        let (state, active_speakers) = engine::start(
            context,
            initial_state,
            dependencies,
            feeds,
            settings,
            member_events.clone(),
            command_rx,
        );
        Self {
            commands,
            state,
            active_speakers,
            member_events,
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("participants: engine stopped, dropping command");
        }
    }

    pub fn add_updates(&self, updates: Vec<Update>) {
        self.send(Command::AddUpdates(updates));
    }

    pub fn load_more(&self, token: impl Into<String>) {
        self.send(Command::LoadMore(token.into()));
    }

    pub fn ensure_have_participants(&self, sources: HashSet<u32>) {
        self.send(Command::EnsureHave(sources));
    }

    /// Peers the media layer reports as speaking, with their audio sources.
    pub fn report_speaking_participants(&self, speaking: HashMap<PeerId, u32>) {
        self.send(Command::ReportSpeaking(speaking));
    }

    pub fn update_mute_state(
        &self,
        peer_id: PeerId,
        mute_state: Option<MuteState>,
        volume: Option<i32>,
        raise_hand: Option<bool>,
    ) {
        self.send(Command::UpdateMute {
            peer_id,
            mute_state,
            volume,
            raise_hand,
        });
    }

    pub fn raise_hand(&self) {
        self.send(Command::SetHandRaised(true));
    }

    pub fn lower_hand(&self) {
        self.send(Command::SetHandRaised(false));
    }

    pub fn update_video_state(
        &self,
        peer_id: PeerId,
        video_stopped: Option<bool>,
        video_paused: Option<bool>,
        presentation_paused: Option<bool>,
    ) {
        self.send(Command::UpdateVideo {
            peer_id,
            flags: VideoFlags {
                video_stopped,
                video_paused,
                presentation_paused,
            },
        });
    }

    pub fn update_default_participants_muted(&self, is_muted: bool) {
        self.send(Command::SetDefaultMuted(is_muted));
    }

    pub fn update_messages_enabled(&self, is_enabled: bool, paid_message_stars: Option<i64>) {
        self.send(Command::SetMessagesEnabled {
            is_enabled,
            paid_message_stars,
        });
    }

    pub fn reset_invite_links(&self) {
        self.send(Command::ResetInviteLinks);
    }

    pub fn update_should_be_recording(
        &self,
        should_record: bool,
        title: Option<String>,
        video_portrait: Option<bool>,
    ) {
        self.send(Command::SetRecording {
            should_record,
            title,
            video_portrait,
        });
    }

    pub fn toggle_scheduled_subscription(&self, subscribe: bool) {
        self.send(Command::SetScheduleSubscription(subscribe));
    }

    pub fn update_admin_ids(&self, admin_ids: HashSet<PeerId>) {
        self.send(Command::SetAdminIds(admin_ids));
    }

    pub fn remove_local_peer(&self) {
        self.send(Command::RemoveLocalPeer);
    }

    /// Switches the join-as identity; the old one keeps its join time on
    /// the next resync.
    pub fn update_local_peer(&self, peer_id: PeerId) {
        self.send(Command::SetLocalPeer(peer_id));
    }

    pub fn state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn state_stream(&self) -> WatchStream<CallState> {
        WatchStream::new(self.state.clone())
    }

    /// Last published state without waiting for the engine.
    pub fn immediate_state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn member_events(&self) -> broadcast::Receiver<MemberEvent> {
        self.member_events.subscribe()
    }

    pub fn member_event_stream(&self) -> BroadcastStream<MemberEvent> {
        BroadcastStream::new(self.member_events.subscribe())
    }

    pub fn active_speakers(&self) -> watch::Receiver<HashSet<PeerId>> {
        self.active_speakers.clone()
    }

    /// Peers with an unacknowledged local mute/volume change.
    pub async fn pending_overlay_peers(&self) -> Option<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PendingOverlayPeers(reply));
        rx.await.ok()
    }

    pub async fn service_state(&self) -> Option<ServiceState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ServiceState(reply));
        rx.await.ok()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
