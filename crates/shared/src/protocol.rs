use serde::{Deserialize, Serialize};

use crate::{
    domain::{CallId, CallReference, PeerId},
    participant::{
        sort_participants, CallState, DefaultMutePolicy, MessagingPolicy, MuteState, Participant,
        VideoDescription,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationChange {
    #[default]
    None,
    Joined,
    Left,
}

/// One participant diff inside a versioned [`StateUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub peer_id: PeerId,
    #[serde(default)]
    pub source: Option<u32>,
    #[serde(default)]
    pub video_description: Option<VideoDescription>,
    #[serde(default)]
    pub presentation_description: Option<VideoDescription>,
    pub join_timestamp: i32,
    #[serde(default)]
    pub activity_timestamp: Option<f64>,
    #[serde(default)]
    pub raise_hand_rating: Option<i64>,
    #[serde(default)]
    pub mute_state: Option<MuteState>,
    #[serde(default)]
    pub change: ParticipationChange,
    #[serde(default)]
    pub volume: Option<i32>,
    #[serde(default)]
    pub about: Option<String>,
    #[serde(default)]
    pub joined_video: bool,
    #[serde(default)]
    pub paid_stars_total: Option<i64>,
    /// Set when the server omitted fields it considers private to the
    /// receiving user; see `MinimalUpdatePolicy`.
    #[serde(default)]
    pub is_minimal: bool,
}

impl ParticipantUpdate {
    pub fn new(peer_id: PeerId, join_timestamp: i32, change: ParticipationChange) -> Self {
        Self {
            peer_id,
            source: None,
            video_description: None,
            presentation_description: None,
            join_timestamp,
            activity_timestamp: None,
            raise_hand_rating: None,
            mute_state: None,
            change,
            volume: None,
            about: None,
            joined_video: false,
            paid_stars_total: None,
            is_minimal: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub participant_updates: Vec<ParticipantUpdate>,
    pub version: i32,
    /// Peers whose pending local overlay is settled by this update.
    #[serde(default)]
    pub invalidate_overlay_for: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallUpdate {
    #[serde(default)]
    pub is_terminated: bool,
    pub default_mute_policy: DefaultMutePolicy,
    pub messaging_policy: MessagingPolicy,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub recording_start_timestamp: Option<i32>,
    #[serde(default)]
    pub schedule_timestamp: Option<i32>,
    #[serde(default)]
    pub video_enabled: bool,
    #[serde(default)]
    pub participant_count: Option<usize>,
    #[serde(default)]
    pub is_minimal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Update {
    State(StateUpdate),
    Call(CallUpdate),
    ChainBlocks {
        sub_chain_id: i32,
        blocks: Vec<Vec<u8>>,
        next_offset: i32,
    },
}

/// An update addressed to one call; the push feed carries these for every
/// call the account is in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushUpdate {
    pub call_id: CallId,
    pub update: Update,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatesEnvelope {
    pub updates: Vec<PushUpdate>,
}

/// Call-wide fields a participants fetch reports alongside the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPolicyFields {
    pub sort_ascending: bool,
    #[serde(default)]
    pub schedule_timestamp: Option<i32>,
    #[serde(default)]
    pub subscribed_to_schedule: bool,
    #[serde(default)]
    pub default_mute_policy: Option<DefaultMutePolicy>,
    #[serde(default)]
    pub messaging_policy: Option<MessagingPolicy>,
    #[serde(default)]
    pub video_enabled: bool,
    #[serde(default)]
    pub unmuted_video_limit: usize,
    #[serde(default)]
    pub is_broadcast_stream: bool,
    #[serde(default)]
    pub is_creator: bool,
}

impl Default for CallPolicyFields {
    fn default() -> Self {
        Self {
            sort_ascending: true,
            schedule_timestamp: None,
            subscribed_to_schedule: false,
            default_mute_policy: None,
            messaging_policy: None,
            video_enabled: false,
            unmuted_video_limit: 0,
            is_broadcast_stream: false,
            is_creator: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantsSnapshot {
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    pub total_count: usize,
    pub version: i32,
    #[serde(default)]
    pub policy: CallPolicyFields,
}

impl ParticipantsSnapshot {
    /// Builds a state from a fetched page. Admin ids, title and recording
    /// state are not part of a participants fetch and start out empty.
    pub fn into_state(self) -> CallState {
        let policy = self.policy;
        let mut participants = self.participants;
        sort_participants(&mut participants, policy.sort_ascending);

        let mut state = CallState::empty(self.version);
        state.participants = participants;
        state.next_page_token = self.next_page_token;
        state.is_creator = policy.is_creator;
        state.default_mute_policy = policy.default_mute_policy.unwrap_or_default();
        state.messaging_policy = policy.messaging_policy.unwrap_or_default();
        state.sort_ascending = policy.sort_ascending;
        state.schedule_timestamp = policy.schedule_timestamp;
        state.subscribed_to_schedule = policy.subscribed_to_schedule;
        state.total_count = self.total_count;
        state.video_enabled = policy.video_enabled;
        state.unmuted_video_limit = policy.unmuted_video_limit;
        state.is_broadcast_stream = policy.is_broadcast_stream;
        state
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchParticipantsRequest {
    pub call: CallReference,
    pub offset: String,
    pub sources: Vec<u32>,
    pub limit: u32,
    pub sort_ascending: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditParticipantRequest {
    pub call: CallReference,
    pub peer_id: PeerId,
    pub muted: Option<bool>,
    pub volume: Option<i32>,
    pub raise_hand: Option<bool>,
    pub video_stopped: Option<bool>,
    pub video_paused: Option<bool>,
    pub presentation_paused: Option<bool>,
}

impl EditParticipantRequest {
    pub fn new(call: CallReference, peer_id: PeerId) -> Self {
        Self {
            call,
            peer_id,
            muted: None,
            volume: None,
            raise_hand: None,
            video_stopped: None,
            video_paused: None,
            presentation_paused: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSettingsRequest {
    pub call: CallReference,
    pub join_muted: Option<bool>,
    pub messages_enabled: Option<bool>,
    pub paid_message_stars: Option<i64>,
    pub reset_invite_links: bool,
}

impl CallSettingsRequest {
    pub fn new(call: CallReference) -> Self {
        Self {
            call,
            join_muted: None,
            messages_enabled: None,
            paid_message_stars: None,
            reset_invite_links: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub call: CallReference,
    pub start: bool,
    pub title: Option<String>,
    pub video_portrait: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEvent {
    pub peer_id: PeerId,
    pub can_unmute: bool,
    pub joined: bool,
}

/// A membership fact decrypted from the conference chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainParticipant {
    pub user_id: i64,
    pub internal_id: String,
}

/// Presence-channel speaking signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakingActivity {
    pub peer_id: PeerId,
    pub timestamp: i32,
}
