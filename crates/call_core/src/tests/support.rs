use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::{CallId, CallReference, ParticipantId, Peer, PeerId},
    error::{ApiException, ErrorCode},
    participant::{CallState, Participant},
    protocol::{
        BlockchainParticipant, CallPolicyFields, CallSettingsRequest, EditParticipantRequest,
        FetchParticipantsRequest, ParticipantsSnapshot, PushUpdate, RecordingRequest,
        SpeakingActivity, StateUpdate, Update, UpdatesEnvelope,
    },
};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    CallContext, ChainBlockSink, Clock, Dependencies, EngineSettings, Feeds,
    GroupCallParticipants, ParticipantsBackend, PeerDirectory,
};

pub(crate) const CALL: CallReference = CallReference {
    call_id: CallId(42),
    access_hash: 9001,
};
pub(crate) const ME: PeerId = PeerId(1);

pub(crate) fn peer(id: i64) -> Peer {
    Peer::new(PeerId(id), format!("user-{id}"))
}

pub(crate) fn participant(id: i64, join_timestamp: i32) -> Participant {
    Participant::new(ParticipantId::Peer(PeerId(id)), Some(peer(id)), join_timestamp)
}

pub(crate) fn call_state(version: i32, participants: Vec<Participant>) -> CallState {
    let mut state = CallState::empty(version);
    state.total_count = participants.len();
    state.participants = participants;
    state.sort();
    state
}

pub(crate) fn snapshot(version: i32, participants: Vec<Participant>) -> ParticipantsSnapshot {
    ParticipantsSnapshot {
        total_count: participants.len(),
        participants,
        next_page_token: None,
        version,
        policy: CallPolicyFields::default(),
    }
}

pub(crate) fn state_update(version: i32, changes: Vec<shared::protocol::ParticipantUpdate>) -> Update {
    Update::State(StateUpdate {
        participant_updates: changes,
        version,
        invalidate_overlay_for: Vec::new(),
    })
}

pub(crate) fn envelope(updates: Vec<Update>) -> UpdatesEnvelope {
    UpdatesEnvelope {
        updates: updates
            .into_iter()
            .map(|update| PushUpdate {
                call_id: CALL.call_id,
                update,
            })
            .collect(),
    }
}

pub(crate) fn ids(state: &CallState) -> Vec<ParticipantId> {
    state.participants.iter().map(|p| p.id.clone()).collect()
}

pub(crate) fn context() -> CallContext {
    CallContext {
        reference: CALL,
        account_peer_id: ME,
        my_peer_id: ME,
        parent_peer_id: Some(PeerId(500)),
        previous_service_state: None,
    }
}

/// Lets spawned collaborator calls and the engine loop run to idle.
pub(crate) async fn settle() {
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub(crate) enum Scripted<T> {
    Reply(T),
    Fail(ErrorCode),
}

fn scripted_error(code: ErrorCode) -> anyhow::Error {
    ApiException::new(code, "scripted failure").into()
}

pub(crate) struct FakeBackend {
    held: AtomicBool,
    fetches_held: AtomicBool,
    permits: Semaphore,
    snapshots: Mutex<VecDeque<Scripted<ParticipantsSnapshot>>>,
    edits: Mutex<VecDeque<Scripted<Option<UpdatesEnvelope>>>>,
    pub fetch_requests: Mutex<Vec<FetchParticipantsRequest>>,
    pub edit_requests: Mutex<Vec<EditParticipantRequest>>,
    pub settings_requests: Mutex<Vec<CallSettingsRequest>>,
    pub recording_requests: Mutex<Vec<RecordingRequest>>,
    pub schedule_requests: Mutex<Vec<(PeerId, bool)>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            fetches_held: AtomicBool::new(false),
            permits: Semaphore::new(0),
            snapshots: Mutex::new(VecDeque::new()),
            edits: Mutex::new(VecDeque::new()),
            fetch_requests: Mutex::new(Vec::new()),
            edit_requests: Mutex::new(Vec::new()),
            settings_requests: Mutex::new(Vec::new()),
            recording_requests: Mutex::new(Vec::new()),
            schedule_requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn script_snapshot(&self, snapshot: ParticipantsSnapshot) {
        self.snapshots
            .lock()
            .expect("snapshots")
            .push_back(Scripted::Reply(snapshot));
    }

    pub(crate) fn script_fetch_failure(&self, code: ErrorCode) {
        self.snapshots
            .lock()
            .expect("snapshots")
            .push_back(Scripted::Fail(code));
    }

    pub(crate) fn script_edit(&self, reply: Option<UpdatesEnvelope>) {
        self.edits
            .lock()
            .expect("edits")
            .push_back(Scripted::Reply(reply));
    }

    pub(crate) fn script_edit_failure(&self, code: ErrorCode) {
        self.edits
            .lock()
            .expect("edits")
            .push_back(Scripted::Fail(code));
    }

    /// Parks every request until `release` is called.
    pub(crate) fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Parks fetches only; edits keep answering.
    pub(crate) fn hold_fetches(&self) {
        self.fetches_held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.fetches_held.store(false, Ordering::SeqCst);
        self.permits.add_permits(1024);
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetch_requests.lock().expect("fetch requests").len()
    }

    pub(crate) fn edit_count(&self) -> usize {
        self.edit_requests.lock().expect("edit requests").len()
    }

    async fn gate(&self, fetch: bool) {
        let fetch_held = fetch && self.fetches_held.load(Ordering::SeqCst);
        if fetch_held || self.held.load(Ordering::SeqCst) {
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl ParticipantsBackend for FakeBackend {
    async fn fetch_participants(
        &self,
        request: FetchParticipantsRequest,
    ) -> Result<ParticipantsSnapshot> {
        self.fetch_requests
            .lock()
            .expect("fetch requests")
            .push(request);
        self.gate(true).await;
        let scripted = self.snapshots.lock().expect("snapshots").pop_front();
        match scripted {
            Some(Scripted::Reply(snapshot)) => Ok(snapshot),
            Some(Scripted::Fail(code)) => Err(scripted_error(code)),
            None => Err(scripted_error(ErrorCode::Internal)),
        }
    }

    async fn edit_participant(
        &self,
        request: EditParticipantRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        self.edit_requests
            .lock()
            .expect("edit requests")
            .push(request);
        self.gate(false).await;
        let scripted = self.edits.lock().expect("edits").pop_front();
        match scripted {
            Some(Scripted::Reply(reply)) => Ok(reply),
            Some(Scripted::Fail(code)) => Err(scripted_error(code)),
            None => Ok(None),
        }
    }

    async fn toggle_call_settings(
        &self,
        request: CallSettingsRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        self.settings_requests
            .lock()
            .expect("settings requests")
            .push(request);
        Ok(None)
    }

    async fn toggle_recording(
        &self,
        request: RecordingRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        self.recording_requests
            .lock()
            .expect("recording requests")
            .push(request);
        Ok(None)
    }

    async fn toggle_schedule_subscription(
        &self,
        parent_peer_id: PeerId,
        _call: CallReference,
        subscribe: bool,
    ) -> Result<()> {
        self.schedule_requests
            .lock()
            .expect("schedule requests")
            .push((parent_peer_id, subscribe));
        Ok(())
    }
}

/// Resolves every id except the ones marked unknown.
#[derive(Default)]
pub(crate) struct FakeDirectory {
    pub unknown: Mutex<HashSet<PeerId>>,
}

#[async_trait]
impl PeerDirectory for FakeDirectory {
    async fn resolve(&self, ids: &[PeerId]) -> HashMap<PeerId, Peer> {
        let unknown = self.unknown.lock().expect("unknown ids");
        ids.iter()
            .filter(|id| !unknown.contains(id))
            .map(|id| (*id, peer(id.0)))
            .collect()
    }
}

pub(crate) struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub(crate) fn new(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn set(&self, now: f64) {
        *self.now.lock().expect("clock") = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().expect("clock")
    }
}

#[derive(Default)]
pub(crate) struct RecordingChainSink {
    pub submitted: Mutex<Vec<(CallId, i32, usize)>>,
}

impl ChainBlockSink for RecordingChainSink {
    fn submit(&self, call_id: CallId, sub_chain_id: i32, blocks: Vec<Vec<u8>>, _next_offset: i32) {
        self.submitted
            .lock()
            .expect("submitted blocks")
            .push((call_id, sub_chain_id, blocks.len()));
    }
}

pub(crate) struct Harness {
    pub handle: GroupCallParticipants,
    pub backend: Arc<FakeBackend>,
    pub directory: Arc<FakeDirectory>,
    pub clock: Arc<ManualClock>,
    pub chain_sink: Arc<RecordingChainSink>,
    pub push: mpsc::UnboundedSender<PushUpdate>,
    pub presence: mpsc::UnboundedSender<Vec<SpeakingActivity>>,
    pub chain: mpsc::UnboundedSender<Vec<BlockchainParticipant>>,
}

impl Harness {
    pub(crate) fn start(initial_state: CallState) -> Self {
        Self::start_with(initial_state, context(), EngineSettings::default())
    }

    pub(crate) fn start_with(
        initial_state: CallState,
        context: CallContext,
        settings: EngineSettings,
    ) -> Self {
        let backend = Arc::new(FakeBackend::new());
        let directory = Arc::new(FakeDirectory::default());
        let clock = Arc::new(ManualClock::new(1_000.0));
        let chain_sink = Arc::new(RecordingChainSink::default());
        let (push, push_rx) = mpsc::unbounded_channel();
        let (presence, presence_rx) = mpsc::unbounded_channel();
        let (chain, chain_rx) = mpsc::unbounded_channel();

        let handle = GroupCallParticipants::spawn(
            context,
            initial_state,
            Dependencies {
                backend: backend.clone(),
                directory: directory.clone(),
                chain_blocks: chain_sink.clone(),
                clock: clock.clone(),
            },
            Feeds {
                updates: Some(UnboundedReceiverStream::new(push_rx).boxed()),
                presence: Some(UnboundedReceiverStream::new(presence_rx).boxed()),
                blockchain: Some(UnboundedReceiverStream::new(chain_rx).boxed()),
            },
            settings,
        );

        Self {
            handle,
            backend,
            directory,
            clock,
            chain_sink,
            push,
            presence,
            chain,
        }
    }

    pub(crate) fn state(&self) -> CallState {
        self.handle.immediate_state()
    }

    pub(crate) fn push_update(&self, update: Update) {
        self.push
            .send(PushUpdate {
                call_id: CALL.call_id,
                update,
            })
            .expect("engine is running");
    }
}
