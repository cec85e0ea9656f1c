use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use serde::{Deserialize, Serialize};

use crate::domain::{ParticipantId, Peer, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MuteState {
    pub can_unmute: bool,
    pub muted_by_you: bool,
}

impl MuteState {
    pub fn new(can_unmute: bool, muted_by_you: bool) -> Self {
        Self {
            can_unmute,
            muted_by_you,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub semantics: String,
    pub sources: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDescription {
    pub endpoint_id: String,
    #[serde(default)]
    pub source_groups: Vec<SourceGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_source: Option<u32>,
    #[serde(default)]
    pub is_paused: bool,
}

/// One roster entry. Equality is structural so unchanged entries never
/// produce a new published state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    #[serde(default)]
    pub peer: Option<Peer>,
    #[serde(default)]
    pub source: Option<u32>,
    #[serde(default)]
    pub video_description: Option<VideoDescription>,
    #[serde(default)]
    pub presentation_description: Option<VideoDescription>,
    pub join_timestamp: i32,
    #[serde(default)]
    pub raise_hand_rating: Option<i64>,
    #[serde(default)]
    pub activity_timestamp: Option<f64>,
    #[serde(default)]
    pub activity_rank: Option<u64>,
    #[serde(default)]
    pub mute_state: Option<MuteState>,
    #[serde(default)]
    pub volume: Option<i32>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub joined_video: bool,
    #[serde(default)]
    pub paid_stars_total: Option<i64>,
}

impl Participant {
    /// Bare entry with nothing but an identity and a join time.
    pub fn new(id: ParticipantId, peer: Option<Peer>, join_timestamp: i32) -> Self {
        Self {
            id,
            peer,
            source: None,
            video_description: None,
            presentation_description: None,
            join_timestamp,
            raise_hand_rating: None,
            activity_timestamp: None,
            activity_rank: None,
            mute_state: None,
            volume: None,
            about: None,
            joined_video: false,
            paid_stars_total: None,
        }
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.id.peer_id()
    }

    pub fn can_unmute(&self) -> bool {
        self.mute_state.map_or(true, |state| state.can_unmute)
    }

    pub fn has_raised_hand(&self) -> bool {
        self.raise_hand_rating.is_some()
    }

    /// Audio sources this participant is known to publish.
    pub fn audio_sources(&self) -> impl Iterator<Item = u32> + '_ {
        self.source.into_iter().chain(
            self.presentation_description
                .as_ref()
                .and_then(|description| description.audio_source),
        )
    }

    pub fn merge_activity(&mut self, other: &Participant, merge_activity_timestamp: bool) {
        self.activity_rank = other.activity_rank;
        if merge_activity_timestamp {
            self.activity_timestamp = other.activity_timestamp;
        }
    }

    /// Display order. The first discriminator that differs wins:
    /// unmute capability, activity rank, activity recency, raised hand,
    /// join time, then id.
    pub fn compare(lhs: &Participant, rhs: &Participant, sort_ascending: bool) -> Ordering {
        let by_unmute = rhs.can_unmute().cmp(&lhs.can_unmute());
        if by_unmute != Ordering::Equal {
            return by_unmute;
        }

        let by_rank = match (lhs.activity_rank, rhs.activity_rank) {
            (Some(lhs_rank), Some(rhs_rank)) => lhs_rank.cmp(&rhs_rank),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if by_rank != Ordering::Equal {
            return by_rank;
        }

        let by_activity = match (lhs.activity_timestamp, rhs.activity_timestamp) {
            (Some(lhs_ts), Some(rhs_ts)) => rhs_ts.total_cmp(&lhs_ts),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if by_activity != Ordering::Equal {
            return by_activity;
        }

        let by_hand = match (lhs.raise_hand_rating, rhs.raise_hand_rating) {
            (Some(lhs_rating), Some(rhs_rating)) => rhs_rating.cmp(&lhs_rating),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if by_hand != Ordering::Equal {
            return by_hand;
        }

        let by_join = if sort_ascending {
            lhs.join_timestamp.cmp(&rhs.join_timestamp)
        } else {
            rhs.join_timestamp.cmp(&lhs.join_timestamp)
        };
        if by_join != Ordering::Equal {
            return by_join;
        }

        lhs.id.cmp(&rhs.id)
    }
}

pub fn sort_participants(participants: &mut [Participant], sort_ascending: bool) {
    participants.sort_by(|lhs, rhs| Participant::compare(lhs, rhs, sort_ascending));
}

pub fn is_sorted(participants: &[Participant], sort_ascending: bool) -> bool {
    participants.windows(2).all(|pair| {
        Participant::compare(&pair[0], &pair[1], sort_ascending) != Ordering::Greater
    })
}

/// Appends entries not yet present and re-sorts. Existing entries win:
/// a page or source fetch never overwrites what updates already told us.
pub fn merge_and_sort_participants(
    current: &[Participant],
    fetched: &[Participant],
    sort_ascending: bool,
) -> Vec<Participant> {
    let mut merged = current.to_vec();
    let mut known: HashSet<ParticipantId> =
        current.iter().map(|participant| participant.id.clone()).collect();
    for participant in fetched {
        if known.insert(participant.id.clone()) {
            merged.push(participant.clone());
        }
    }
    sort_participants(&mut merged, sort_ascending);
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DefaultMutePolicy {
    pub is_muted: bool,
    pub can_change: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingPolicy {
    pub is_enabled: bool,
    pub can_change: bool,
    #[serde(default)]
    pub paid_message_stars: Option<i64>,
}

impl Default for MessagingPolicy {
    fn default() -> Self {
        Self {
            is_enabled: true,
            can_change: false,
            paid_message_stars: None,
        }
    }
}

/// Call-wide snapshot. `participants` is kept sorted by
/// [`Participant::compare`] after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallState {
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub admin_ids: HashSet<PeerId>,
    #[serde(default)]
    pub is_creator: bool,
    #[serde(default)]
    pub default_mute_policy: DefaultMutePolicy,
    #[serde(default)]
    pub messaging_policy: MessagingPolicy,
    #[serde(default)]
    pub sort_ascending: bool,
    #[serde(default)]
    pub recording_start_timestamp: Option<i32>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub schedule_timestamp: Option<i32>,
    #[serde(default)]
    pub subscribed_to_schedule: bool,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub video_enabled: bool,
    #[serde(default)]
    pub unmuted_video_limit: usize,
    #[serde(default)]
    pub is_broadcast_stream: bool,
    #[serde(default)]
    pub default_send_as: Option<PeerId>,
    pub version: i32,
}

impl CallState {
    pub fn empty(version: i32) -> Self {
        Self {
            participants: Vec::new(),
            next_page_token: None,
            admin_ids: HashSet::new(),
            is_creator: false,
            default_mute_policy: DefaultMutePolicy::default(),
            messaging_policy: MessagingPolicy::default(),
            sort_ascending: true,
            recording_start_timestamp: None,
            title: None,
            schedule_timestamp: None,
            subscribed_to_schedule: false,
            total_count: 0,
            video_enabled: false,
            unmuted_video_limit: 0,
            is_broadcast_stream: false,
            default_send_as: None,
            version,
        }
    }

    pub fn participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| &participant.id == id)
    }

    pub fn contains_peer(&self, peer_id: PeerId) -> bool {
        self.participants
            .iter()
            .any(|participant| participant.id == ParticipantId::Peer(peer_id))
    }

    pub fn sort(&mut self) {
        sort_participants(&mut self.participants, self.sort_ascending);
    }

    /// Carries activity over from `other` for every peer present in both.
    /// The local peer (current or previous join-as identity) also keeps its
    /// join time, so re-fetching never reorders the user's own entry.
    pub fn merge_activity(
        &mut self,
        other: &CallState,
        my_peer_id: Option<PeerId>,
        previous_my_peer_id: Option<PeerId>,
        merge_activity_timestamps: bool,
    ) {
        let index: HashMap<PeerId, &Participant> = other
            .participants
            .iter()
            .filter_map(|participant| Some((participant.peer.as_ref()?.id, participant)))
            .collect();

        for participant in &mut self.participants {
            let Some(peer_id) = participant.peer.as_ref().map(|peer| peer.id) else {
                continue;
            };
            let Some(previous) = index.get(&peer_id) else {
                continue;
            };
            participant.merge_activity(previous, merge_activity_timestamps);
            if Some(peer_id) == my_peer_id || Some(peer_id) == previous_my_peer_id {
                participant.join_timestamp = previous.join_timestamp;
            }
        }

        self.sort();
    }
}

#[cfg(test)]
#[path = "tests/participant_tests.rs"]
mod tests;
