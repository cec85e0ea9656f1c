use shared::{
    domain::{ParticipantId, PeerId},
    participant::CallState,
};

use crate::{
    blockchain::{synthetic_entries, ResolvedBlockchainParticipant},
    overlay::OverlayStore,
};

/// Whether the observer may see raised hands: the call owner, an admin,
/// or anyone currently allowed to speak.
pub fn can_see_hands(state: &CallState, account_peer_id: PeerId, my_peer_id: PeerId) -> bool {
    if state.is_creator || state.admin_ids.contains(&account_peer_id) {
        return true;
    }
    state
        .participant(&ParticipantId::Peer(my_peer_id))
        .is_some_and(|me| me.can_unmute())
}

/// The state consumers observe: authoritative roster with pending local
/// intents on top, hands hidden from observers who may not see them, and
/// chain-only members merged in. The result is always sorted.
pub fn project(
    state: &CallState,
    overlay: &OverlayStore,
    chain: &[ResolvedBlockchainParticipant],
    account_peer_id: PeerId,
    my_peer_id: PeerId,
) -> CallState {
    let mut projected = state.clone();
    let show_hands = can_see_hands(state, account_peer_id, my_peer_id);

    let mut reorder = false;
    for participant in &mut projected.participants {
        reorder |= overlay.apply_to(participant);
        if !show_hands && participant.raise_hand_rating.take().is_some() {
            reorder = true;
        }
    }
    let extra = synthetic_entries(&projected.participants, chain);
    reorder |= !extra.is_empty();
    projected.participants.extend(extra);
    if reorder {
        projected.sort();
    }
    projected
}

#[cfg(test)]
#[path = "tests/projection_tests.rs"]
mod tests;
