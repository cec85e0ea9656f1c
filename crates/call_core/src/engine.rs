use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::Arc,
};

use anyhow::Result;
use futures::{future, stream::BoxStream, StreamExt};
use shared::{
    domain::{ParticipantId, Peer, PeerId},
    error::ApiException,
    participant::{merge_and_sort_participants, CallState, MuteState},
    protocol::{
        BlockchainParticipant, FetchParticipantsRequest, MemberEvent, ParticipantsSnapshot,
        ParticipationChange, PushUpdate, SpeakingActivity, StateUpdate, Update, UpdatesEnvelope,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    activity::{expire_ranks, ActivityTracker, ServiceState},
    blockchain::{lookup_ids, BlockchainMerge, ResolvedBlockchainParticipant},
    config::EngineSettings,
    mutations::VideoFlags,
    overlay::OverlayStore,
    processor::{apply_call_update, apply_state_update, check_version, VersionCheck},
    projection::project,
    CallContext, Dependencies, Feeds,
};

pub(crate) enum Command {
    AddUpdates(Vec<Update>),
    LoadMore(String),
    EnsureHave(HashSet<u32>),
    ReportSpeaking(HashMap<PeerId, u32>),
    UpdateMute {
        peer_id: PeerId,
        mute_state: Option<MuteState>,
        volume: Option<i32>,
        raise_hand: Option<bool>,
    },
    SetHandRaised(bool),
    UpdateVideo {
        peer_id: PeerId,
        flags: VideoFlags,
    },
    SetDefaultMuted(bool),
    SetMessagesEnabled {
        is_enabled: bool,
        paid_message_stars: Option<i64>,
    },
    ResetInviteLinks,
    SetRecording {
        should_record: bool,
        title: Option<String>,
        video_portrait: Option<bool>,
    },
    SetScheduleSubscription(bool),
    SetAdminIds(HashSet<PeerId>),
    RemoveLocalPeer,
    SetLocalPeer(PeerId),
    PendingOverlayPeers(oneshot::Sender<Vec<PeerId>>),
    ServiceState(oneshot::Sender<ServiceState>),
}

/// Results of collaborator calls, delivered back onto the engine task.
pub(crate) enum Completion {
    PeersResolved {
        update: StateUpdate,
        peers: HashMap<PeerId, Peer>,
    },
    Resynced(Result<ParticipantsSnapshot>),
    PageLoaded(Result<ParticipantsSnapshot>),
    SourcesLoaded {
        sources: HashSet<u32>,
        result: Result<ParticipantsSnapshot>,
    },
    MuteEdited {
        peer_id: PeerId,
        request_id: Option<u64>,
        result: Result<Option<UpdatesEnvelope>>,
    },
    VideoEdited {
        peer_id: PeerId,
        result: Result<Option<UpdatesEnvelope>>,
    },
    CallToggled {
        action: &'static str,
        result: Result<Option<UpdatesEnvelope>>,
    },
    ScheduleToggled {
        subscribe: bool,
        result: Result<()>,
    },
    BlockchainResolved {
        seq: u64,
        participants: Vec<ResolvedBlockchainParticipant>,
    },
}

pub(crate) struct Engine {
    pub(crate) context: CallContext,
    previous_my_peer_id: Option<PeerId>,
    settings: EngineSettings,
    pub(crate) deps: Dependencies,
    pub(crate) state: CallState,
    pub(crate) overlay: OverlayStore,
    activity: ActivityTracker,
    blockchain: BlockchainMerge,
    service_state: ServiceState,
    queue: VecDeque<StateUpdate>,
    is_processing: bool,
    is_loading: bool,
    should_resync: bool,
    missing_sources: HashSet<u32>,
    pub(crate) last_video_request: VideoFlags,
    next_request_id: u64,
    state_tx: watch::Sender<CallState>,
    speakers_tx: watch::Sender<HashSet<PeerId>>,
    member_events: broadcast::Sender<MemberEvent>,
    completions: mpsc::UnboundedSender<Completion>,
}

pub(crate) fn start(
    context: CallContext,
    initial_state: CallState,
    deps: Dependencies,
    feeds: Feeds,
    settings: EngineSettings,
    member_events: broadcast::Sender<MemberEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
) -> (watch::Receiver<CallState>, watch::Receiver<HashSet<PeerId>>) {
    let mut state = initial_state;
    state.sort();

    let overlay = OverlayStore::default();
    let blockchain = BlockchainMerge::new(settings.blockchain_merge_debounce());
    let projected = project(
        &state,
        &overlay,
        blockchain.participants(),
        context.account_peer_id,
        context.my_peer_id,
    );
    let (state_tx, state_rx) = watch::channel(projected);
    let (speakers_tx, speakers_rx) = watch::channel(HashSet::new());
    let (completions, completion_rx) = mpsc::unbounded_channel();

    let engine = Engine {
        service_state: context.previous_service_state.unwrap_or_default(),
        context,
        previous_my_peer_id: None,
        settings,
        deps,
        state,
        overlay,
        activity: ActivityTracker::default(),
        blockchain,
        queue: VecDeque::new(),
        is_processing: false,
        is_loading: false,
        should_resync: false,
        missing_sources: HashSet::new(),
        last_video_request: VideoFlags::default(),
        next_request_id: 0,
        state_tx,
        speakers_tx,
        member_events,
        completions,
    };
    tokio::spawn(engine.run(commands, completion_rx, feeds));

    (state_rx, speakers_rx)
}

async fn next_item<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    let Some(inner) = stream.as_mut() else {
        return future::pending().await;
    };
    let item = inner.next().await;
    if item.is_none() {
        *stream = None;
    }
    item
}

async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Logs a failed collaborator call. Permission denials are routine for
/// optimistic edits and stay at info.
pub(crate) fn log_failure(action: &str, err: &anyhow::Error) {
    match err.downcast_ref::<ApiException>() {
        Some(api) if api.code.is_permission_denied() => {
            info!(code = ?api.code, "participants: {action} rejected: {}", api.message);
        }
        _ => warn!("participants: {action} failed: {err:#}"),
    }
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        feeds: Feeds,
    ) {
        let Feeds {
            updates: mut push_updates,
            mut presence,
            blockchain: mut chain,
        } = feeds;
        let period = self.settings.activity_tick();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            call_id = %self.context.reference.call_id,
            version = self.state.version,
            participants = self.state.participants.len(),
            "participants: engine started"
        );

        loop {
            let debounce = self.blockchain.deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = completions.recv() => self.handle_completion(completion),
                Some(push) = next_item(&mut push_updates) => self.handle_push(push),
                Some(batch) = next_item(&mut presence) => self.handle_presence(batch),
                Some(facts) = next_item(&mut chain) => self.handle_chain_emission(facts),
                _ = ticker.tick() => self.expire_activity_ranks(),
                _ = debounce_elapsed(debounce) => {
                    self.blockchain.apply_pending();
                }
            }
            self.publish();
        }

        info!(call_id = %self.context.reference.call_id, "participants: engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddUpdates(updates) => self.add_updates(updates),
            Command::LoadMore(token) => self.load_more(token),
            Command::EnsureHave(sources) => self.ensure_have(sources),
            Command::ReportSpeaking(speaking) => self.report_speaking(speaking),
            Command::UpdateMute {
                peer_id,
                mute_state,
                volume,
                raise_hand,
            } => self.update_mute_state(peer_id, mute_state, volume, raise_hand),
            Command::SetHandRaised(raise) => {
                self.update_mute_state(self.context.my_peer_id, None, None, Some(raise))
            }
            Command::UpdateVideo { peer_id, flags } => self.update_video_state(peer_id, flags),
            Command::SetDefaultMuted(is_muted) => self.update_default_participants_muted(is_muted),
            Command::SetMessagesEnabled {
                is_enabled,
                paid_message_stars,
            } => self.update_messages_enabled(is_enabled, paid_message_stars),
            Command::ResetInviteLinks => self.reset_invite_links(),
            Command::SetRecording {
                should_record,
                title,
                video_portrait,
            } => self.update_should_be_recording(should_record, title, video_portrait),
            Command::SetScheduleSubscription(subscribe) => {
                self.toggle_scheduled_subscription(subscribe)
            }
            Command::SetAdminIds(admin_ids) => self.state.admin_ids = admin_ids,
            Command::RemoveLocalPeer => {
                let me = ParticipantId::Peer(self.context.my_peer_id);
                self.state.participants.retain(|participant| participant.id != me);
            }
            Command::SetLocalPeer(peer_id) => {
                if peer_id != self.context.my_peer_id {
                    self.previous_my_peer_id = Some(self.context.my_peer_id);
                    self.context.my_peer_id = peer_id;
                }
            }
            Command::PendingOverlayPeers(reply) => {
                let _ = reply.send(self.overlay.peers());
            }
            Command::ServiceState(reply) => {
                let _ = reply.send(self.service_state);
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::PeersResolved { update, peers } => self.on_peers_resolved(update, peers),
            Completion::Resynced(result) => self.on_resynced(result),
            Completion::PageLoaded(result) => self.on_page_loaded(result),
            Completion::SourcesLoaded { sources, result } => {
                self.on_sources_loaded(sources, result)
            }
            Completion::MuteEdited {
                peer_id,
                request_id,
                result,
            } => self.on_mute_edited(peer_id, request_id, result),
            Completion::VideoEdited { peer_id, result } => self.on_video_edited(peer_id, result),
            Completion::CallToggled { action, result } => self.on_call_toggled(action, result),
            Completion::ScheduleToggled { subscribe, result } => {
                if let Err(err) = result {
                    log_failure("schedule subscription", &err);
                } else {
                    debug!(subscribe, "participants: schedule subscription updated");
                }
            }
            Completion::BlockchainResolved { seq, participants } => {
                let applied =
                    self.blockchain
                        .accept(seq, participants, &self.state, Instant::now());
                debug!(seq, applied, "participants: chain roster resolved");
            }
        }
    }

    fn handle_push(&mut self, push: PushUpdate) {
        if push.call_id != self.context.reference.call_id {
            return;
        }
        self.add_updates(vec![push.update]);
    }

    pub(crate) fn spawn_completion<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let completion = work.await;
            let _ = completions.send(completion);
        });
    }

    pub(crate) fn take_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn publish(&self) {
        let projected = project(
            &self.state,
            &self.overlay,
            self.blockchain.participants(),
            self.context.account_peer_id,
            self.context.my_peer_id,
        );
        self.state_tx.send_if_modified(|current| {
            if *current == projected {
                return false;
            }
            *current = projected;
            true
        });

        let speakers = self.activity.active_speakers();
        self.speakers_tx.send_if_modified(|current| {
            if current == speakers {
                return false;
            }
            current.clone_from(speakers);
            true
        });
    }

    pub(crate) fn add_updates(&mut self, updates: Vec<Update>) {
        let mut queued = false;
        for update in updates {
            match update {
                Update::State(state_update) => {
                    self.queue.push_back(state_update);
                    queued = true;
                }
                Update::Call(call_update) => {
                    if call_update.is_terminated {
                        info!(call_id = %self.context.reference.call_id, "participants: call terminated");
                    }
                    apply_call_update(&mut self.state, &call_update);
                }
                Update::ChainBlocks {
                    sub_chain_id,
                    blocks,
                    next_offset,
                } => self.deps.chain_blocks.submit(
                    self.context.reference.call_id,
                    sub_chain_id,
                    blocks,
                    next_offset,
                ),
            }
        }
        if queued {
            self.drain_queue();
        }
    }

    /// Starts on queued diffs until one needs to wait for a collaborator.
    fn drain_queue(&mut self) {
        while !self.is_processing {
            let Some(update) = self.queue.pop_front() else {
                return;
            };
            self.is_processing = true;

            match check_version(self.state.version, update.version) {
                VersionCheck::Stale => {
                    debug!(
                        version = update.version,
                        current = self.state.version,
                        "participants: dropping stale update"
                    );
                    self.overlay.remove_all(&update.invalidate_overlay_for);
                    self.is_processing = false;
                }
                VersionCheck::Gap => {
                    info!(
                        version = update.version,
                        current = self.state.version,
                        "participants: version gap, resyncing"
                    );
                    self.overlay.remove_all(&update.invalidate_overlay_for);
                    self.request_resync();
                }
                VersionCheck::Next => self.resolve_peers(update),
            }
        }
    }

    fn resolve_peers(&self, update: StateUpdate) {
        let ids: Vec<PeerId> = update
            .participant_updates
            .iter()
            .filter(|change| change.change != ParticipationChange::Left)
            .map(|change| change.peer_id)
            .collect();
        let directory = Arc::clone(&self.deps.directory);
        self.spawn_completion(async move {
            let peers = if ids.is_empty() {
                HashMap::new()
            } else {
                directory.resolve(&ids).await
            };
            Completion::PeersResolved { update, peers }
        });
    }

    fn on_peers_resolved(&mut self, update: StateUpdate, peers: HashMap<PeerId, Peer>) {
        if check_version(self.state.version, update.version) == VersionCheck::Next {
            let events = apply_state_update(&mut self.state, &update, &peers);
            for event in events {
                let _ = self.member_events.send(event);
            }
        } else {
            debug!(
                version = update.version,
                current = self.state.version,
                "participants: state moved on while resolving peers"
            );
        }
        self.overlay.remove_all(&update.invalidate_overlay_for);
        self.is_processing = false;
        self.drain_queue();
    }

    fn fetch(
        &self,
        offset: String,
        sources: Vec<u32>,
        sort_ascending: bool,
    ) -> impl Future<Output = Result<ParticipantsSnapshot>> + Send + 'static {
        let backend = Arc::clone(&self.deps.backend);
        let request = FetchParticipantsRequest {
            call: self.context.reference,
            offset,
            sources,
            limit: self.settings.page_limit,
            sort_ascending: Some(sort_ascending),
        };
        async move { backend.fetch_participants(request).await }
    }

    fn request_resync(&mut self) {
        if self.is_loading {
            debug!("participants.resync: deferred until the running load completes");
            self.should_resync = true;
            return;
        }
        self.is_loading = true;
        self.should_resync = false;
        for discarded in self.queue.drain(..) {
            self.overlay.remove_all(&discarded.invalidate_overlay_for);
        }

        let fetch = self.fetch(String::new(), Vec::new(), self.state.sort_ascending);
        self.spawn_completion(async move { Completion::Resynced(fetch.await) });
    }

    fn on_resynced(&mut self, result: Result<ParticipantsSnapshot>) {
        self.is_loading = false;
        self.should_resync = false;

        match result {
            Ok(snapshot) => {
                let mut next = snapshot.into_state();
                next.admin_ids = self.state.admin_ids.clone();
                next.is_creator = self.state.is_creator;
                next.default_mute_policy = self.state.default_mute_policy;
                next.messaging_policy = self.state.messaging_policy;
                next.title = self.state.title.clone();
                next.recording_start_timestamp = self.state.recording_start_timestamp;
                next.schedule_timestamp = self.state.schedule_timestamp;
                next.default_send_as = self.state.default_send_as;
                next.merge_activity(
                    &self.state,
                    Some(self.context.my_peer_id),
                    self.previous_my_peer_id,
                    true,
                );
                info!(
                    previous = self.state.version,
                    version = next.version,
                    participants = next.participants.len(),
                    "participants.resync: applied snapshot"
                );
                self.state = next;
            }
            Err(err) => log_failure("resync", &err),
        }

        self.is_processing = false;
        self.drain_queue();
        self.load_missing_sources();
    }

    fn load_more(&mut self, token: String) {
        if self.state.next_page_token.as_deref() != Some(token.as_str()) {
            warn!(
                token = %token,
                expected = ?self.state.next_page_token,
                "participants: load_more called with a stale token"
            );
            return;
        }
        if self.is_loading {
            debug!(token = %token, "participants: load already running");
            return;
        }
        self.is_loading = true;

        let fetch = self.fetch(token, Vec::new(), self.state.sort_ascending);
        self.spawn_completion(async move { Completion::PageLoaded(fetch.await) });
    }

    fn on_page_loaded(&mut self, result: Result<ParticipantsSnapshot>) {
        self.is_loading = false;
        match result {
            Ok(snapshot) => {
                self.merge_fetched(&snapshot);
                self.state.next_page_token = snapshot.next_page_token;
                info!(
                    fetched = snapshot.participants.len(),
                    participants = self.state.participants.len(),
                    has_more = self.state.next_page_token.is_some(),
                    "participants: loaded page"
                );
                self.after_load();
            }
            Err(err) => {
                log_failure("page fetch", &err);
                self.after_load();
            }
        }
    }

    fn merge_fetched(&mut self, snapshot: &ParticipantsSnapshot) {
        self.state.participants = merge_and_sort_participants(
            &self.state.participants,
            &snapshot.participants,
            self.state.sort_ascending,
        );
        self.state.total_count = self.state.total_count.max(snapshot.total_count);
    }

    fn after_load(&mut self) {
        if self.should_resync {
            self.request_resync();
        } else {
            self.load_missing_sources();
        }
    }

    fn known_sources(&self) -> HashSet<u32> {
        self.state
            .participants
            .iter()
            .flat_map(|participant| participant.audio_sources())
            .collect()
    }

    fn ensure_have(&mut self, sources: HashSet<u32>) {
        let known = self.known_sources();
        let mut unknown = false;
        for source in sources.into_iter().filter(|source| !known.contains(source)) {
            self.missing_sources.insert(source);
            unknown = true;
        }
        if unknown {
            self.load_missing_sources();
        }
    }

    fn load_missing_sources(&mut self) {
        let known = self.known_sources();
        self.missing_sources.retain(|source| !known.contains(source));
        if self.missing_sources.is_empty() || self.is_loading {
            return;
        }
        self.is_loading = true;

        let requested = self.missing_sources.clone();
        let mut sources: Vec<u32> = requested.iter().copied().collect();
        sources.sort_unstable();
        debug!(?sources, "participants: requesting unknown sources");

        let fetch = self.fetch(String::new(), sources, true);
        self.spawn_completion(async move {
            Completion::SourcesLoaded {
                sources: requested,
                result: fetch.await,
            }
        });
    }

    fn on_sources_loaded(&mut self, sources: HashSet<u32>, result: Result<ParticipantsSnapshot>) {
        self.is_loading = false;
        match result {
            Ok(snapshot) => {
                self.missing_sources.retain(|source| !sources.contains(source));
                self.merge_fetched(&snapshot);
                debug!(
                    requested = sources.len(),
                    fetched = snapshot.participants.len(),
                    "participants: resolved unknown sources"
                );
                self.after_load();
            }
            Err(err) => {
                log_failure("source fetch", &err);
                if self.should_resync {
                    self.request_resync();
                }
            }
        }
    }

    fn handle_presence(&mut self, batch: Vec<SpeakingActivity>) {
        self.activity
            .apply_presence(&mut self.state, &mut self.service_state, &batch);
    }

    fn report_speaking(&mut self, speaking: HashMap<PeerId, u32>) {
        let now = self.deps.clock.now();
        self.activity.report_speaking(
            &mut self.state,
            &mut self.service_state,
            speaking.keys().copied(),
            now,
        );
        self.ensure_have(speaking.into_values().collect());
    }

    fn expire_activity_ranks(&mut self) {
        let now = self.deps.clock.now();
        let ttl = self.settings.activity_rank_ttl().as_secs_f64();
        if expire_ranks(&mut self.state, now, ttl) {
            debug!("participants: expired activity ranks");
        }
    }

    fn handle_chain_emission(&mut self, facts: Vec<BlockchainParticipant>) {
        let seq = self.blockchain.begin_emission();
        let directory = Arc::clone(&self.deps.directory);
        self.spawn_completion(async move {
            let ids = lookup_ids(&facts);
            let peers = if ids.is_empty() {
                HashMap::new()
            } else {
                directory.resolve(&ids).await
            };
            let participants = facts
                .into_iter()
                .map(|fact| {
                    let peer = (fact.user_id != 0)
                        .then(|| peers.get(&PeerId(fact.user_id)).cloned())
                        .flatten();
                    ResolvedBlockchainParticipant { fact, peer }
                })
                .collect();
            Completion::BlockchainResolved { seq, participants }
        });
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
