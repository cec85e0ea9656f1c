use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use call_core::{
    CallContext, ChainBlockSink, Clock, Dependencies, EngineSettings, Feeds,
    GroupCallParticipants, ParticipantsBackend, PeerDirectory, ServiceState,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{CallId, CallReference, Peer, PeerId},
    participant::{CallState, MuteState},
    protocol::{
        BlockchainParticipant, CallSettingsRequest, EditParticipantRequest,
        FetchParticipantsRequest, MemberEvent, ParticipantsSnapshot, PushUpdate,
        RecordingRequest, SpeakingActivity, Update, UpdatesEnvelope,
    },
};
use tokio::sync::{broadcast::error::TryRecvError, mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;

/// A recorded session: the starting roster, what the server will answer,
/// and the inputs to feed the engine in order.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub call: CallReference,
    pub account_peer_id: PeerId,
    #[serde(default)]
    pub my_peer_id: Option<PeerId>,
    #[serde(default)]
    pub parent_peer_id: Option<PeerId>,
    #[serde(default)]
    pub service_state: Option<ServiceState>,
    /// Unix seconds reported by the replay clock.
    #[serde(default)]
    pub now: f64,
    pub initial: ParticipantsSnapshot,
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Answers to participant fetches, consumed in order.
    #[serde(default)]
    pub fetches: Vec<ParticipantsSnapshot>,
    /// Answers to participant edits, consumed in order. Missing entries
    /// are treated as accepted without updates.
    #[serde(default)]
    pub edits: Vec<Option<UpdatesEnvelope>>,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Push {
        #[serde(default)]
        call_id: Option<CallId>,
        update: Update,
    },
    LoadMore {
        token: String,
    },
    EnsureHave {
        sources: Vec<u32>,
    },
    Speaking {
        speaking: Vec<(PeerId, u32)>,
    },
    Presence {
        activity: Vec<SpeakingActivity>,
    },
    Chain {
        participants: Vec<BlockchainParticipant>,
    },
    Mute {
        peer_id: PeerId,
        #[serde(default)]
        mute_state: Option<MuteState>,
        #[serde(default)]
        volume: Option<i32>,
    },
    RaiseHand,
    LowerHand,
    Clock {
        now: f64,
    },
    Wait {
        ms: u64,
    },
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub state: CallState,
    pub member_events: Vec<MemberEvent>,
    pub pending_overlay: Vec<PeerId>,
    pub service_state: Option<ServiceState>,
    pub requests: RequestLog,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RequestLog {
    pub fetches: Vec<FetchParticipantsRequest>,
    pub edits: Vec<EditParticipantRequest>,
    pub settings: Vec<CallSettingsRequest>,
    pub recordings: Vec<RecordingRequest>,
}

struct ScriptedBackend {
    fetches: Mutex<VecDeque<ParticipantsSnapshot>>,
    edits: Mutex<VecDeque<Option<UpdatesEnvelope>>>,
    log: Mutex<RequestLog>,
}

#[async_trait]
impl ParticipantsBackend for ScriptedBackend {
    async fn fetch_participants(
        &self,
        request: FetchParticipantsRequest,
    ) -> Result<ParticipantsSnapshot> {
        self.log.lock().await.fetches.push(request.clone());
        self.fetches.lock().await.pop_front().ok_or_else(|| {
            anyhow!(
                "scenario has no fetch answer for offset {:?} sources {:?}",
                request.offset,
                request.sources
            )
        })
    }

    async fn edit_participant(
        &self,
        request: EditParticipantRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        self.log.lock().await.edits.push(request);
        Ok(self.edits.lock().await.pop_front().flatten())
    }

    async fn toggle_call_settings(
        &self,
        request: CallSettingsRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        self.log.lock().await.settings.push(request);
        Ok(None)
    }

    async fn toggle_recording(
        &self,
        request: RecordingRequest,
    ) -> Result<Option<UpdatesEnvelope>> {
        self.log.lock().await.recordings.push(request);
        Ok(None)
    }

    async fn toggle_schedule_subscription(
        &self,
        parent_peer_id: PeerId,
        call: CallReference,
        subscribe: bool,
    ) -> Result<()> {
        info!(%parent_peer_id, call_id = %call.call_id, subscribe, "replay: schedule subscription");
        Ok(())
    }
}

struct ScenarioDirectory {
    peers: HashMap<PeerId, Peer>,
}

#[async_trait]
impl PeerDirectory for ScenarioDirectory {
    async fn resolve(&self, ids: &[PeerId]) -> HashMap<PeerId, Peer> {
        ids.iter()
            .filter_map(|id| Some((*id, self.peers.get(id)?.clone())))
            .collect()
    }
}

struct ReplayClock {
    now: std::sync::Mutex<f64>,
}

impl ReplayClock {
    fn set(&self, now: f64) {
        if let Ok(mut current) = self.now.lock() {
            *current = now;
        }
    }
}

impl Clock for ReplayClock {
    fn now(&self) -> f64 {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }
}

struct LoggingChainSink;

impl ChainBlockSink for LoggingChainSink {
    fn submit(&self, call_id: CallId, sub_chain_id: i32, blocks: Vec<Vec<u8>>, next_offset: i32) {
        info!(
            call_id = %call_id,
            sub_chain_id,
            blocks = blocks.len(),
            next_offset,
            "replay: chain blocks"
        );
    }
}

/// Feeds every step through a fresh engine and reports where it ended up.
/// `settle` is how long to let the engine work after each step.
pub async fn run(scenario: Scenario, settings: EngineSettings, settle: Duration) -> Result<Report> {
    let Scenario {
        call,
        account_peer_id,
        my_peer_id,
        parent_peer_id,
        service_state,
        now,
        initial,
        peers,
        fetches,
        edits,
        steps,
    } = scenario;

    let backend = Arc::new(ScriptedBackend {
        fetches: Mutex::new(fetches.into()),
        edits: Mutex::new(edits.into()),
        log: Mutex::new(RequestLog::default()),
    });
    let clock = Arc::new(ReplayClock {
        now: std::sync::Mutex::new(now),
    });
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let (presence_tx, presence_rx) = mpsc::unbounded_channel();
    let (chain_tx, chain_rx) = mpsc::unbounded_channel();

    let handle = GroupCallParticipants::spawn(
        CallContext {
            reference: call,
            account_peer_id,
            my_peer_id: my_peer_id.unwrap_or(account_peer_id),
            parent_peer_id,
            previous_service_state: service_state,
        },
        initial.into_state(),
        Dependencies {
            backend: backend.clone(),
            directory: Arc::new(ScenarioDirectory {
                peers: peers.into_iter().map(|peer| (peer.id, peer)).collect(),
            }),
            chain_blocks: Arc::new(LoggingChainSink),
            clock: clock.clone(),
        },
        Feeds {
            updates: Some(UnboundedReceiverStream::new(push_rx).boxed()),
            presence: Some(UnboundedReceiverStream::new(presence_rx).boxed()),
            blockchain: Some(UnboundedReceiverStream::new(chain_rx).boxed()),
        },
        settings,
    );
    let mut events = handle.member_events();

    info!(steps = steps.len(), call_id = %call.call_id, "replay: starting");
    for (index, step) in steps.into_iter().enumerate() {
        match step {
            Step::Push { call_id, update } => {
                let push = PushUpdate {
                    call_id: call_id.unwrap_or(call.call_id),
                    update,
                };
                push_tx
                    .send(push)
                    .map_err(|_| anyhow!("engine stopped before step {index}"))?;
            }
            Step::LoadMore { token } => handle.load_more(token),
            Step::EnsureHave { sources } => {
                handle.ensure_have_participants(sources.into_iter().collect::<HashSet<_>>())
            }
            Step::Speaking { speaking } => {
                handle.report_speaking_participants(speaking.into_iter().collect())
            }
            Step::Presence { activity } => presence_tx
                .send(activity)
                .map_err(|_| anyhow!("engine stopped before step {index}"))?,
            Step::Chain { participants } => chain_tx
                .send(participants)
                .map_err(|_| anyhow!("engine stopped before step {index}"))?,
            Step::Mute {
                peer_id,
                mute_state,
                volume,
            } => handle.update_mute_state(peer_id, mute_state, volume, None),
            Step::RaiseHand => handle.raise_hand(),
            Step::LowerHand => handle.lower_hand(),
            Step::Clock { now } => clock.set(now),
            Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
        tokio::time::sleep(settle).await;
    }

    let mut member_events = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => member_events.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                info!(skipped, "replay: member event buffer overflowed");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    let pending_overlay = handle.pending_overlay_peers().await.unwrap_or_default();
    let service_state = handle.service_state().await;
    let requests = backend.log.lock().await.clone();

    Ok(Report {
        state: handle.immediate_state(),
        member_events,
        pending_overlay,
        service_state,
        requests,
    })
}
