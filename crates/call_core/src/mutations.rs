use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{CallReference, ParticipantId, PeerId},
    participant::MuteState,
    protocol::{
        CallSettingsRequest, EditParticipantRequest, RecordingRequest, Update, UpdatesEnvelope,
    },
};
use tracing::{debug, warn};

use crate::{
    engine::{log_failure, Completion, Engine},
    overlay::PendingMuteChange,
    processor::updates_for_call,
};

/// Last requested camera/screen flags for the local user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct VideoFlags {
    pub video_stopped: Option<bool>,
    pub video_paused: Option<bool>,
    pub presentation_paused: Option<bool>,
}

pub(crate) fn mute_request(
    call: CallReference,
    peer_id: PeerId,
    my_peer_id: PeerId,
    mute_state: Option<MuteState>,
    volume: Option<i32>,
    raise_hand: Option<bool>,
) -> EditParticipantRequest {
    let mut request = EditParticipantRequest::new(call, peer_id);
    request.muted = match mute_state {
        Some(state) if !state.can_unmute || state.muted_by_you || peer_id == my_peer_id => {
            Some(true)
        }
        None if peer_id == my_peer_id => Some(false),
        _ => None,
    };
    request.volume = volume.filter(|volume| *volume > 0);
    request.raise_hand = raise_hand;
    request
}

pub(crate) fn video_request(
    call: CallReference,
    peer_id: PeerId,
    flags: VideoFlags,
) -> EditParticipantRequest {
    let mut request = EditParticipantRequest::new(call, peer_id);
    request.video_stopped = flags.video_stopped;
    request.video_paused = flags.video_stopped.and(flags.video_paused);
    request.presentation_paused = flags.presentation_paused;
    request
}

impl Engine {
    pub(crate) fn update_mute_state(
        &mut self,
        peer_id: PeerId,
        mute_state: Option<MuteState>,
        volume: Option<i32>,
        raise_hand: Option<bool>,
    ) {
        if let Some(pending) = self.overlay.get(peer_id) {
            if raise_hand.is_none() && pending.matches(mute_state, volume) {
                debug!(peer_id = %peer_id, "participants: identical mute change already pending");
                return;
            }
            self.overlay.remove(peer_id);
        }

        if let Some(current) = self.state.participant(&ParticipantId::Peer(peer_id)) {
            let hand_matches =
                raise_hand.map_or(true, |raise| current.has_raised_hand() == raise);
            if current.mute_state == mute_state && current.volume == volume && hand_matches {
                debug!(peer_id = %peer_id, "participants: mute state already current");
                return;
            }
        }

        let request_id = self.take_request_id();
        let overlay_request = if raise_hand.is_none() {
            self.overlay.install(
                peer_id,
                PendingMuteChange {
                    mute_state,
                    volume,
                    request_id,
                },
            );
            Some(request_id)
        } else {
            None
        };

        let request = mute_request(
            self.context.reference,
            peer_id,
            self.context.my_peer_id,
            mute_state,
            volume,
            raise_hand,
        );
        let backend = Arc::clone(&self.deps.backend);
        self.spawn_completion(async move {
            let result = backend.edit_participant(request).await;
            Completion::MuteEdited {
                peer_id,
                request_id: overlay_request,
                result,
            }
        });
    }

    pub(crate) fn on_mute_edited(
        &mut self,
        peer_id: PeerId,
        request_id: Option<u64>,
        result: Result<Option<UpdatesEnvelope>>,
    ) {
        let updates = match result {
            Ok(Some(envelope)) => {
                updates_for_call(envelope, self.context.reference.call_id, Some(peer_id))
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                log_failure("mute edit", &err);
                Vec::new()
            }
        };

        let settled_by_update = updates
            .iter()
            .any(|update| matches!(update, Update::State(_)));
        if !settled_by_update {
            if let Some(request_id) = request_id {
                self.overlay.settle(peer_id, request_id);
            }
        }
        self.add_updates(updates);
    }

    pub(crate) fn update_video_state(&mut self, peer_id: PeerId, flags: VideoFlags) {
        if self.last_video_request == flags {
            return;
        }
        self.last_video_request = flags;
        if let Some(stopped) = flags.video_stopped {
            self.overlay.set_local_video((!stopped).then_some(peer_id));
        }

        let request = video_request(self.context.reference, peer_id, flags);
        let backend = Arc::clone(&self.deps.backend);
        self.spawn_completion(async move {
            let result = backend.edit_participant(request).await;
            Completion::VideoEdited { peer_id, result }
        });
    }

    pub(crate) fn on_video_edited(
        &mut self,
        peer_id: PeerId,
        result: Result<Option<UpdatesEnvelope>>,
    ) {
        match result {
            Ok(Some(envelope)) => {
                let updates =
                    updates_for_call(envelope, self.context.reference.call_id, Some(peer_id));
                self.add_updates(updates);
            }
            Ok(None) => {}
            Err(err) => log_failure("video edit", &err),
        }
    }

    pub(crate) fn update_default_participants_muted(&mut self, is_muted: bool) {
        if self.state.default_mute_policy.is_muted == is_muted {
            return;
        }
        self.state.default_mute_policy.is_muted = is_muted;

        let mut request = CallSettingsRequest::new(self.context.reference);
        request.join_muted = Some(is_muted);
        self.send_call_settings("default mute", request);
    }

    pub(crate) fn update_messages_enabled(
        &mut self,
        is_enabled: bool,
        paid_message_stars: Option<i64>,
    ) {
        let policy = &mut self.state.messaging_policy;
        if policy.is_enabled == is_enabled && policy.paid_message_stars == paid_message_stars {
            return;
        }
        policy.is_enabled = is_enabled;
        policy.paid_message_stars = paid_message_stars;

        let mut request = CallSettingsRequest::new(self.context.reference);
        request.messages_enabled = Some(is_enabled);
        request.paid_message_stars = paid_message_stars;
        self.send_call_settings("messaging", request);
    }

    pub(crate) fn reset_invite_links(&mut self) {
        let mut request = CallSettingsRequest::new(self.context.reference);
        request.reset_invite_links = true;
        self.send_call_settings("invite link reset", request);
    }

    fn send_call_settings(&self, action: &'static str, request: CallSettingsRequest) {
        let backend = Arc::clone(&self.deps.backend);
        self.spawn_completion(async move {
            let result = backend.toggle_call_settings(request).await;
            Completion::CallToggled { action, result }
        });
    }

    pub(crate) fn update_should_be_recording(
        &mut self,
        should_record: bool,
        title: Option<String>,
        video_portrait: Option<bool>,
    ) {
        let request = RecordingRequest {
            call: self.context.reference,
            start: should_record,
            title: title.filter(|title| !title.is_empty()),
            video_portrait,
        };
        let backend = Arc::clone(&self.deps.backend);
        self.spawn_completion(async move {
            let result = backend.toggle_recording(request).await;
            Completion::CallToggled {
                action: "recording",
                result,
            }
        });
    }

    pub(crate) fn on_call_toggled(
        &mut self,
        action: &'static str,
        result: Result<Option<UpdatesEnvelope>>,
    ) {
        match result {
            Ok(Some(envelope)) => {
                let updates = updates_for_call(envelope, self.context.reference.call_id, None);
                self.add_updates(updates);
            }
            Ok(None) => debug!(action, "participants: call setting accepted"),
            Err(err) => log_failure(action, &err),
        }
    }

    pub(crate) fn toggle_scheduled_subscription(&mut self, subscribe: bool) {
        let Some(parent_peer_id) = self.context.parent_peer_id else {
            warn!(subscribe, "participants: schedule subscription needs a parent peer");
            return;
        };
        if self.state.subscribed_to_schedule == subscribe {
            return;
        }
        self.state.subscribed_to_schedule = subscribe;

        let call = self.context.reference;
        let backend = Arc::clone(&self.deps.backend);
        self.spawn_completion(async move {
            let result = backend
                .toggle_schedule_subscription(parent_peer_id, call, subscribe)
                .await;
            Completion::ScheduleToggled { subscribe, result }
        });
    }
}

#[cfg(test)]
#[path = "tests/mutations_tests.rs"]
mod tests;
