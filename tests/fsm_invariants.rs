//! Properties of the transition table that hold for every state pair

use pgkeeper::keeper::fsm::{self, Guard, MAX_HOPS, TRANSITIONS};
use pgkeeper::keeper::NodeState;
use pgkeeper::Error;

#[test]
fn test_no_transition_without_a_new_assignment() {
    for state in NodeState::ALL {
        assert!(fsm::plan(state, state).unwrap().is_empty());
        assert!(fsm::find_transition(state, state).is_none());
    }
}

#[test]
fn test_plans_end_at_the_assigned_state() {
    for from in NodeState::ALL {
        for to in NodeState::ALL {
            match fsm::plan(from, to) {
                Ok(hops) => {
                    assert!(hops.len() <= MAX_HOPS);
                    let mut state = from;
                    for hop in &hops {
                        assert_eq!(hop.current, state);
                        assert_eq!(hop.assigned, to);
                        state = hop.next;
                    }
                    assert_eq!(state, to);
                }
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => panic!("unexpected error planning {} -> {}: {}", from, to, e),
            }
        }
    }
}

#[test]
fn test_primary_only_reached_from_promotion_or_primary_side() {
    for t in TRANSITIONS.iter().filter(|t| t.next == NodeState::Primary) {
        assert!(
            !t.current.is_standby(),
            "{} reaches primary directly",
            t.current
        );
    }
}

#[test]
fn test_standby_plans_to_primary_pass_prepare_promotion() {
    for from in NodeState::ALL.into_iter().filter(|s| s.is_standby()) {
        if let Ok(hops) = fsm::plan(from, NodeState::Primary) {
            assert!(hops.len() >= 2);
            assert_eq!(hops[0].next, NodeState::PreparePromotion);
            assert_eq!(hops[0].guard, Guard::SyncStandby);
        }
    }
}

#[test]
fn test_every_state_is_reachable_or_initial() {
    for state in NodeState::ALL {
        let reachable = TRANSITIONS.iter().any(|t| t.next == state);
        assert!(reachable || state == NodeState::Init, "{} is unreachable", state);
    }
}
