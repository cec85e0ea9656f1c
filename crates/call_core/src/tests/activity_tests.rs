use shared::{
    domain::{ParticipantId, Peer},
    participant::{is_sorted, MuteState, Participant},
};

use super::*;

fn participant(id: i64, join_timestamp: i32) -> Participant {
    Participant::new(
        ParticipantId::Peer(PeerId(id)),
        Some(Peer::new(PeerId(id), format!("user-{id}"))),
        join_timestamp,
    )
}

fn roster(participants: Vec<Participant>) -> CallState {
    let mut state = CallState::empty(1);
    state.participants = participants;
    state.sort();
    state
}

fn entry(state: &CallState, id: i64) -> &Participant {
    state
        .participant(&ParticipantId::Peer(PeerId(id)))
        .expect("participant present")
}

fn speaking(id: i64, timestamp: i32) -> SpeakingActivity {
    SpeakingActivity {
        peer_id: PeerId(id),
        timestamp,
    }
}

#[test]
fn presence_assigns_ranks_in_arrival_order() {
    let mut state = roster(vec![participant(1, 10), participant(2, 20), participant(3, 30)]);
    let mut service = ServiceState::default();
    let mut tracker = ActivityTracker::default();

    assert!(tracker.apply_presence(&mut state, &mut service, &[speaking(3, 100)]));
    assert!(tracker.apply_presence(
        &mut state,
        &mut service,
        &[speaking(2, 101), speaking(3, 101)]
    ));

    assert_eq!(entry(&state, 3).activity_rank, Some(0));
    assert_eq!(entry(&state, 2).activity_rank, Some(1));
    assert_eq!(entry(&state, 3).activity_timestamp, Some(101.0));
    assert_eq!(service.next_activity_rank, 2);
    assert_eq!(state.participants[0].id, ParticipantId::Peer(PeerId(3)));
    assert_eq!(
        tracker.active_speakers(),
        &HashSet::from([PeerId(2), PeerId(3)])
    );
}

#[test]
fn presence_ignores_older_timestamps_and_unknown_peers() {
    let mut first = participant(1, 10);
    first.activity_timestamp = Some(200.0);
    first.activity_rank = Some(4);
    let mut state = roster(vec![first]);
    let mut service = ServiceState::default();
    let mut tracker = ActivityTracker::default();

    let changed = tracker.apply_presence(
        &mut state,
        &mut service,
        &[speaking(1, 150), speaking(99, 300)],
    );

    assert!(!changed);
    assert_eq!(entry(&state, 1).activity_timestamp, Some(200.0));
    assert_eq!(service.next_activity_rank, 0);
    assert!(tracker.active_speakers().contains(&PeerId(99)));
}

#[test]
fn speaking_report_latches_out_presence_ranking() {
    let mut state = roster(vec![participant(1, 10), participant(2, 20)]);
    let mut service = ServiceState {
        next_activity_rank: 10,
    };
    let mut tracker = ActivityTracker::default();

    assert!(tracker.report_speaking(&mut state, &mut service, [PeerId(2)], 1_000.0));
    assert!(tracker.has_speaking_report());
    assert_eq!(entry(&state, 2).activity_rank, Some(10));

    let changed = tracker.apply_presence(&mut state, &mut service, &[speaking(1, 2_000)]);
    assert!(!changed);
    assert_eq!(entry(&state, 1).activity_rank, None);
    assert_eq!(tracker.active_speakers(), &HashSet::from([PeerId(1)]));
}

#[test]
fn empty_report_does_not_latch() {
    let mut state = roster(vec![participant(1, 10)]);
    let mut service = ServiceState::default();
    let mut tracker = ActivityTracker::default();

    assert!(!tracker.report_speaking(&mut state, &mut service, Vec::new(), 5.0));
    assert!(!tracker.has_speaking_report());
    assert!(tracker.apply_presence(&mut state, &mut service, &[speaking(1, 6)]));
}

#[test]
fn stale_rank_expires_and_moves_below_ranked_participants() {
    let now = 10_000.0;
    let mut stale = participant(1, 10);
    stale.activity_rank = Some(3);
    stale.activity_timestamp = Some(now - 61.0);
    let mut fresh = participant(2, 20);
    fresh.activity_rank = Some(5);
    fresh.activity_timestamp = Some(now - 5.0);
    let mut forced = participant(3, 5);
    forced.mute_state = Some(MuteState::new(false, false));
    let mut state = roster(vec![stale, fresh, forced]);
    assert_eq!(state.participants[0].id, ParticipantId::Peer(PeerId(1)));

    assert!(expire_ranks(&mut state, now, 60.0));

    assert_eq!(entry(&state, 1).activity_rank, None);
    assert_eq!(entry(&state, 2).activity_rank, Some(5));
    assert_eq!(
        state.participants.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
        vec![
            ParticipantId::Peer(PeerId(2)),
            ParticipantId::Peer(PeerId(1)),
            ParticipantId::Peer(PeerId(3)),
        ]
    );
    assert!(is_sorted(&state.participants, state.sort_ascending));
}

#[test]
fn rank_without_timestamp_expires() {
    let mut ranked = participant(1, 10);
    ranked.activity_rank = Some(0);
    let mut state = roster(vec![ranked]);

    assert!(expire_ranks(&mut state, 50.0, 60.0));
    assert_eq!(entry(&state, 1).activity_rank, None);
    assert!(!expire_ranks(&mut state, 50.0, 60.0));
}
