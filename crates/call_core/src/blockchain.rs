use std::time::Duration;

use shared::{
    domain::{ParticipantId, Peer, PeerId},
    participant::{CallState, Participant},
    protocol::BlockchainParticipant,
};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBlockchainParticipant {
    pub fact: BlockchainParticipant,
    pub peer: Option<Peer>,
}

impl ResolvedBlockchainParticipant {
    /// Facts without an account mapping keep their chain-internal id.
    pub fn participant_id(&self) -> ParticipantId {
        match self.account_peer_id() {
            Some(peer_id) => ParticipantId::Peer(peer_id),
            None => ParticipantId::Blockchain(self.fact.internal_id.clone()),
        }
    }

    pub fn account_peer_id(&self) -> Option<PeerId> {
        (self.fact.user_id != 0).then_some(PeerId(self.fact.user_id))
    }
}

/// Peer ids worth a directory lookup for an emission.
pub fn lookup_ids(facts: &[BlockchainParticipant]) -> Vec<PeerId> {
    let mut ids: Vec<PeerId> = facts
        .iter()
        .filter(|fact| fact.user_id != 0)
        .map(|fact| PeerId(fact.user_id))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// Secondary roster from the encrypted conference chain. Emissions that
/// name peers the primary roster has not seen yet are held back for the
/// debounce period so a racing roster update can land first.
#[derive(Debug)]
pub struct BlockchainMerge {
    applied: Vec<ResolvedBlockchainParticipant>,
    pending: Option<Vec<ResolvedBlockchainParticipant>>,
    deadline: Option<Instant>,
    emission_seq: u64,
    debounce: Duration,
}

impl BlockchainMerge {
    pub fn new(debounce: Duration) -> Self {
        Self {
            applied: Vec::new(),
            pending: None,
            deadline: None,
            emission_seq: 0,
            debounce,
        }
    }

    pub fn begin_emission(&mut self) -> u64 {
        self.emission_seq += 1;
        self.emission_seq
    }

    /// Takes a resolved emission. Returns true when it was applied right
    /// away; resolutions overtaken by a newer emission are dropped.
    pub fn accept(
        &mut self,
        seq: u64,
        resolved: Vec<ResolvedBlockchainParticipant>,
        state: &CallState,
        now: Instant,
    ) -> bool {
        if seq != self.emission_seq {
            return false;
        }
        self.pending = Some(resolved);
        self.deadline = None;

        let has_unknown = self.pending.iter().flatten().any(|entry| {
            entry
                .account_peer_id()
                .is_some_and(|peer_id| !state.contains_peer(peer_id))
        });
        if has_unknown {
            self.deadline = Some(now + self.debounce);
            false
        } else {
            self.apply_pending()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn apply_pending(&mut self) -> bool {
        self.deadline = None;
        match self.pending.take() {
            Some(pending) if pending != self.applied => {
                self.applied = pending;
                true
            }
            _ => false,
        }
    }

    pub fn participants(&self) -> &[ResolvedBlockchainParticipant] {
        &self.applied
    }
}

/// Placeholder entries for chain members the primary roster lacks.
pub fn synthetic_entries(
    roster: &[Participant],
    chain: &[ResolvedBlockchainParticipant],
) -> Vec<Participant> {
    let mut entries: Vec<Participant> = Vec::new();
    for entry in chain {
        let id = entry.participant_id();
        let known = roster.iter().chain(entries.iter()).any(|p| p.id == id);
        if !known {
            entries.push(Participant::new(id, entry.peer.clone(), 0));
        }
    }
    entries
}

#[cfg(test)]
#[path = "tests/blockchain_tests.rs"]
mod tests;
