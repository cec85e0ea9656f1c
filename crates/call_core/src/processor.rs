use std::collections::HashMap;

use shared::{
    domain::{CallId, ParticipantId, Peer, PeerId},
    participant::{CallState, DefaultMutePolicy, MessagingPolicy, MuteState, Participant},
    protocol::{
        CallUpdate, MemberEvent, ParticipantUpdate, ParticipationChange, StateUpdate, Update,
        UpdatesEnvelope,
    },
};
use tracing::debug;

/// Where an incoming version sits relative to the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Stale,
    Gap,
    Next,
}

pub fn check_version(current: i32, incoming: i32) -> VersionCheck {
    if incoming <= current {
        VersionCheck::Stale
    } else if incoming > current.saturating_add(1) {
        VersionCheck::Gap
    } else {
        VersionCheck::Next
    }
}

/// Decides which previously known values survive a push that the server
/// trimmed for the receiving user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MinimalUpdatePolicy {
    pub is_minimal: bool,
}

impl MinimalUpdatePolicy {
    pub fn new(is_minimal: bool) -> Self {
        Self { is_minimal }
    }

    /// A local "muted by you" is stronger than whatever a minimal push says.
    pub fn mute_state(
        self,
        previous: Option<MuteState>,
        incoming: Option<MuteState>,
    ) -> Option<MuteState> {
        match previous {
            Some(previous) if self.is_minimal && previous.muted_by_you => Some(previous),
            _ => incoming,
        }
    }

    pub fn volume(self, previous: Option<i32>, incoming: Option<i32>) -> Option<i32> {
        if self.is_minimal {
            previous.or(incoming)
        } else {
            incoming
        }
    }

    pub fn default_mute(
        self,
        previous: DefaultMutePolicy,
        incoming: DefaultMutePolicy,
    ) -> DefaultMutePolicy {
        if self.is_minimal {
            DefaultMutePolicy {
                is_muted: incoming.is_muted,
                can_change: previous.can_change,
            }
        } else {
            incoming
        }
    }

    pub fn messaging(self, previous: MessagingPolicy, incoming: MessagingPolicy) -> MessagingPolicy {
        if self.is_minimal {
            MessagingPolicy {
                is_enabled: incoming.is_enabled,
                can_change: previous.can_change,
                paid_message_stars: previous.paid_message_stars,
            }
        } else {
            incoming
        }
    }

    pub fn video_enabled(self, previous: bool, incoming: bool) -> bool {
        if self.is_minimal {
            previous
        } else {
            incoming
        }
    }
}

/// Applies one in-order diff. The caller has already checked the version
/// and resolved peers; updates for peers missing from `peers` are skipped.
pub fn apply_state_update(
    state: &mut CallState,
    update: &StateUpdate,
    peers: &HashMap<PeerId, Peer>,
) -> Vec<MemberEvent> {
    let mut events = Vec::new();
    let mut total_count = state.total_count;

    for change in &update.participant_updates {
        let id = ParticipantId::Peer(change.peer_id);
        let index = state
            .participants
            .iter()
            .position(|participant| participant.id == id);

        if change.change == ParticipationChange::Left {
            if let Some(index) = index {
                state.participants.remove(index);
                events.push(MemberEvent {
                    peer_id: change.peer_id,
                    can_unmute: false,
                    joined: false,
                });
            }
            total_count = total_count.saturating_sub(1);
            continue;
        }

        let Some(peer) = peers.get(&change.peer_id) else {
            debug!(peer_id = %change.peer_id, version = update.version, "participants: skipping unresolved peer");
            continue;
        };

        let previous = match index {
            Some(index) => Some(state.participants.remove(index)),
            None => {
                if change.change == ParticipationChange::Joined {
                    total_count += 1;
                    events.push(MemberEvent {
                        peer_id: change.peer_id,
                        can_unmute: change.mute_state.map_or(true, |state| state.can_unmute),
                        joined: true,
                    });
                }
                None
            }
        };

        state
            .participants
            .push(merge_participant(change, peer.clone(), previous.as_ref()));
    }

    state.total_count = total_count.max(state.participants.len());
    state.version = update.version;
    state.sort();
    events
}

fn merge_participant(
    update: &ParticipantUpdate,
    peer: Peer,
    previous: Option<&Participant>,
) -> Participant {
    let policy = MinimalUpdatePolicy::new(update.is_minimal);
    let mute_state = policy.mute_state(
        previous.and_then(|participant| participant.mute_state),
        update.mute_state,
    );
    let volume = policy.volume(previous.and_then(|participant| participant.volume), update.volume);

    let mut activity_timestamp = match (
        previous.and_then(|participant| participant.activity_timestamp),
        update.activity_timestamp,
    ) {
        (Some(previous), Some(incoming)) => Some(previous.max(incoming)),
        (previous, incoming) => incoming.or(previous),
    };
    let mut activity_rank = previous.and_then(|participant| participant.activity_rank);
    let mut video_description = update.video_description.clone();
    let mut presentation_description = update.presentation_description.clone();

    if mute_state.is_some_and(|state| !state.can_unmute) {
        activity_rank = None;
        activity_timestamp = None;
        video_description = None;
        presentation_description = None;
    }

    Participant {
        id: ParticipantId::Peer(update.peer_id),
        peer: Some(peer),
        source: update.source,
        video_description,
        presentation_description,
        join_timestamp: previous.map_or(update.join_timestamp, |participant| {
            participant.join_timestamp
        }),
        raise_hand_rating: update.raise_hand_rating,
        activity_timestamp,
        activity_rank,
        mute_state,
        volume,
        about: update.about.clone(),
        joined_video: update.joined_video,
        paid_stars_total: update.paid_stars_total,
    }
}

pub fn apply_call_update(state: &mut CallState, update: &CallUpdate) {
    let policy = MinimalUpdatePolicy::new(update.is_minimal);
    state.default_mute_policy =
        policy.default_mute(state.default_mute_policy, update.default_mute_policy);
    state.messaging_policy = policy.messaging(state.messaging_policy, update.messaging_policy);
    state.recording_start_timestamp = update.recording_start_timestamp;
    state.title = update.title.clone();
    state.schedule_timestamp = update.schedule_timestamp;
    state.video_enabled = policy.video_enabled(state.video_enabled, update.video_enabled);
    if let Some(count) = update.participant_count {
        state.total_count = count;
    }
}

/// Unpacks a mutation response into updates for `call_id`. State diffs are
/// tagged so that applying them settles the overlay for `invalidate`.
pub fn updates_for_call(
    envelope: UpdatesEnvelope,
    call_id: CallId,
    invalidate: Option<PeerId>,
) -> Vec<Update> {
    envelope
        .updates
        .into_iter()
        .filter(|push| push.call_id == call_id)
        .map(|push| match push.update {
            Update::State(mut state_update) => {
                if let Some(peer_id) = invalidate {
                    if !state_update.invalidate_overlay_for.contains(&peer_id) {
                        state_update.invalidate_overlay_for.push(peer_id);
                    }
                }
                Update::State(state_update)
            }
            other => other,
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/processor_tests.rs"]
mod tests;
