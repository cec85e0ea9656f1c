use std::collections::HashMap;

use shared::{
    domain::PeerId,
    participant::{MuteState, Participant},
};

/// A local mute/volume intent waiting for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMuteChange {
    pub mute_state: Option<MuteState>,
    pub volume: Option<i32>,
    pub request_id: u64,
}

impl PendingMuteChange {
    pub fn matches(&self, mute_state: Option<MuteState>, volume: Option<i32>) -> bool {
        self.mute_state == mute_state && self.volume == volume
    }
}

#[derive(Debug, Default)]
pub struct OverlayStore {
    pending: HashMap<PeerId, PendingMuteChange>,
    local_video: Option<PeerId>,
}

impl OverlayStore {
    pub fn get(&self, peer_id: PeerId) -> Option<&PendingMuteChange> {
        self.pending.get(&peer_id)
    }

    pub fn install(&mut self, peer_id: PeerId, change: PendingMuteChange) {
        self.pending.insert(peer_id, change);
    }

    pub fn remove(&mut self, peer_id: PeerId) -> Option<PendingMuteChange> {
        self.pending.remove(&peer_id)
    }

    pub fn remove_all(&mut self, peer_ids: &[PeerId]) {
        for peer_id in peer_ids {
            self.pending.remove(peer_id);
        }
    }

    /// Drops the entry for `peer_id` only if `request_id` installed it.
    pub fn settle(&mut self, peer_id: PeerId, request_id: u64) -> bool {
        match self.pending.get(&peer_id) {
            Some(change) if change.request_id == request_id => {
                self.pending.remove(&peer_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.pending.keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn local_video(&self) -> Option<PeerId> {
        self.local_video
    }

    pub fn set_local_video(&mut self, peer_id: Option<PeerId>) {
        self.local_video = peer_id;
    }

    /// Overrides authoritative mute/volume with the pending intent, if any.
    pub fn apply_to(&self, participant: &mut Participant) -> bool {
        let Some(peer_id) = participant.peer.as_ref().map(|peer| peer.id) else {
            return false;
        };
        let Some(change) = self.pending.get(&peer_id) else {
            return false;
        };
        let changed =
            participant.mute_state != change.mute_state || participant.volume != change.volume;
        participant.mute_state = change.mute_state;
        participant.volume = change.volume;
        changed
    }
}

#[cfg(test)]
#[path = "tests/overlay_tests.rs"]
mod tests;
