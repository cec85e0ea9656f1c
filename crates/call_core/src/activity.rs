use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use shared::{domain::PeerId, participant::CallState, protocol::SpeakingActivity};

/// Engine bookkeeping that outlives a single call context. Seeding a new
/// engine with the previous one keeps activity ranks increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub next_activity_rank: u64,
}

impl ServiceState {
    pub fn take_next_activity_rank(&mut self) -> u64 {
        let rank = self.next_activity_rank;
        self.next_activity_rank += 1;
        rank
    }
}

/// Speaking-signal bookkeeping. Presence batches rank participants only
/// until the first explicit speaking report arrives.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    has_speaking_report: bool,
    active_speakers: HashSet<PeerId>,
}

impl ActivityTracker {
    pub fn active_speakers(&self) -> &HashSet<PeerId> {
        &self.active_speakers
    }

    pub fn has_speaking_report(&self) -> bool {
        self.has_speaking_report
    }

    /// Returns true when the roster changed.
    pub fn apply_presence(
        &mut self,
        state: &mut CallState,
        service: &mut ServiceState,
        batch: &[SpeakingActivity],
    ) -> bool {
        self.active_speakers = batch.iter().map(|activity| activity.peer_id).collect();
        if self.has_speaking_report {
            return false;
        }

        let updated = batch.iter().fold(false, |updated, activity| {
            touch(state, service, activity.peer_id, f64::from(activity.timestamp)) || updated
        });
        if updated {
            state.sort();
        }
        updated
    }

    /// Stamps every reported peer with `now`. A non-empty report latches the
    /// tracker into report-driven ranking.
    pub fn report_speaking<I>(
        &mut self,
        state: &mut CallState,
        service: &mut ServiceState,
        peers: I,
        now: f64,
    ) -> bool
    where
        I: IntoIterator<Item = PeerId>,
    {
        let mut reported = false;
        let mut updated = false;
        for peer_id in peers {
            reported = true;
            updated |= touch(state, service, peer_id, now);
        }
        if reported {
            self.has_speaking_report = true;
        }
        if updated {
            state.sort();
        }
        updated
    }
}

fn touch(
    state: &mut CallState,
    service: &mut ServiceState,
    peer_id: PeerId,
    timestamp: f64,
) -> bool {
    let Some(participant) = state
        .participants
        .iter_mut()
        .find(|participant| participant.peer.as_ref().is_some_and(|peer| peer.id == peer_id))
    else {
        return false;
    };
    if participant
        .activity_timestamp
        .is_some_and(|current| current >= timestamp)
    {
        return false;
    }
    participant.activity_timestamp = Some(timestamp);
    if participant.activity_rank.is_none() {
        participant.activity_rank = Some(service.take_next_activity_rank());
    }
    true
}

/// Drops ranks whose last activity is missing or older than `ttl_secs`.
pub fn expire_ranks(state: &mut CallState, now: f64, ttl_secs: f64) -> bool {
    let mut updated = false;
    for participant in &mut state.participants {
        if participant.activity_rank.is_none() {
            continue;
        }
        let expired = participant
            .activity_timestamp
            .map_or(true, |timestamp| timestamp < now - ttl_secs);
        if expired {
            participant.activity_rank = None;
            updated = true;
        }
    }
    if updated {
        state.sort();
    }
    updated
}

#[cfg(test)]
#[path = "tests/activity_tests.rs"]
mod tests;
