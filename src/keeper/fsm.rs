//! Transition table of the keeper state machine
//!
//! The coordinator assigns a state; the keeper looks up the row for
//! `(current, assigned)`, runs its action and moves to `next`. Most rows go
//! straight to the assigned state. A few stop at an intermediate state (a
//! standby asked to become primary first goes through `prepare_promotion`),
//! in which case the keeper walks the table again from there.

use crate::common::{Error, Result};
use crate::keeper::state::NodeState;
use serde::Serialize;
use std::fmt::Write;

/// Upper bound on the hops walked in a single cycle.
pub const MAX_HOPS: usize = 4;

/// Local work done when taking a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Nothing to do besides recording the new state
    None,
    /// Start Postgres and create the replication role, database and extensions
    InitPrimary,
    /// Drop the standby slot and turn synchronous replication off
    DisableReplication,
    StopPostgres,
    StartPostgres,
    /// Restart a demoted primary as a writable single node
    ResumeAsPrimary,
    /// Promote and allow writes
    PromoteStandby,
    /// Create the slot the upcoming standby will use
    PrepareReplication,
    DisableSyncRep,
    EnableSyncRep,
    /// Allow writes on a node promoted while read-only
    PromoteStandbyToPrimary,
    /// Base backup from the primary, then start streaming
    InitStandby,
    /// Rewind against the new primary, base backup when rewind fails
    RewindOrInit,
    /// Checkpoint so that the upcoming promotion is fast
    PrepareStandbyForPromotion,
    /// Promote while refusing writes, so the old primary can no longer
    /// receive acknowledgements from this node
    StopReplication,
    /// Keep reporting the received LSN
    ReportLsn,
    /// Re-attach to whichever node is primary now
    FollowNewPrimary,
    StartMaintenance,
    RestartStandby,
}

/// Extra condition checked before a transition is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    None,
    /// The node's last known sync state must be `sync` or `quorum`
    SyncStandby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub current: NodeState,
    pub assigned: NodeState,
    pub next: NodeState,
    pub action: Action,
    pub guard: Guard,
    pub comment: &'static str,
}

const fn to(
    current: NodeState,
    assigned: NodeState,
    action: Action,
    comment: &'static str,
) -> Transition {
    Transition {
        current,
        assigned,
        next: assigned,
        action,
        guard: Guard::None,
        comment,
    }
}

const fn via(
    current: NodeState,
    assigned: NodeState,
    next: NodeState,
    action: Action,
    guard: Guard,
    comment: &'static str,
) -> Transition {
    Transition {
        current,
        assigned,
        next,
        action,
        guard,
        comment,
    }
}

use NodeState::*;

const REMOVED_STANDBY: &str = "The standby was removed, continue alone";
const DEMOTED_ALONE: &str = "Demoted, but the standby was removed: resume as primary";
const LOST_PRIMARY: &str = "The primary was removed, take over";
const START_PROMOTION: &str = "Stop traffic to the primary and get ready to take over";
const MAINTENANCE: &str = "Stop the standby for maintenance";

pub static TRANSITIONS: &[Transition] = &[
    to(Init, Single, Action::InitPrimary, "Start as a single node"),
    to(Init, WaitStandby, Action::None, "Wait for a primary to follow"),
    // the only other node went away
    to(Primary, Single, Action::DisableReplication, REMOVED_STANDBY),
    to(WaitPrimary, Single, Action::DisableReplication, REMOVED_STANDBY),
    // failover: the old primary stops accepting writes
    to(Primary, Draining, Action::StopPostgres, "Failover in progress, stop writes"),
    to(Draining, Demoted, Action::StopPostgres, "Demoted after a failover"),
    to(Primary, Demoted, Action::StopPostgres, "Failover done, no longer primary"),
    to(Primary, DemoteTimeout, Action::StopPostgres, "Failover done, no longer primary"),
    to(Draining, DemoteTimeout, Action::StopPostgres, "The standby receives no more writes"),
    to(DemoteTimeout, Demoted, Action::StopPostgres, "Demote timeout expired"),
    to(Demoted, Single, Action::ResumeAsPrimary, DEMOTED_ALONE),
    to(DemoteTimeout, Single, Action::ResumeAsPrimary, DEMOTED_ALONE),
    to(Draining, Single, Action::ResumeAsPrimary, DEMOTED_ALONE),
    to(Secondary, Single, Action::PromoteStandby, LOST_PRIMARY),
    to(Catchingup, Single, Action::PromoteStandby, LOST_PRIMARY),
    to(PreparePromotion, Single, Action::PromoteStandby, LOST_PRIMARY),
    to(StopReplication, Single, Action::PromoteStandby, LOST_PRIMARY),
    // primary side, waiting for a standby
    to(Single, WaitPrimary, Action::PrepareReplication, "A standby was added"),
    to(Primary, WaitPrimary, Action::DisableSyncRep, "The standby became unhealthy"),
    to(StopReplication, WaitPrimary, Action::PromoteStandbyToPrimary, "Promotion confirmed by the coordinator"),
    to(WaitPrimary, Primary, Action::EnableSyncRep, "A healthy standby appeared"),
    to(DemoteTimeout, Primary, Action::StartPostgres, "Network partition, but no failover happened"),
    // standby side
    to(WaitStandby, Catchingup, Action::InitStandby, "The primary is ready for a standby"),
    to(Demoted, Catchingup, Action::RewindOrInit, "A new primary is available, rewind or rebuild"),
    to(Secondary, Catchingup, Action::None, "Lost contact with the coordinator, not eligible for promotion"),
    to(Catchingup, Secondary, Action::None, "Caught up, eligible for promotion again"),
    // promotion
    to(Secondary, PreparePromotion, Action::PrepareStandbyForPromotion, START_PROMOTION),
    to(Catchingup, PreparePromotion, Action::PrepareStandbyForPromotion, START_PROMOTION),
    via(Secondary, Primary, PreparePromotion, Action::PrepareStandbyForPromotion, Guard::SyncStandby, START_PROMOTION),
    via(ReportLsn, Primary, PreparePromotion, Action::PrepareStandbyForPromotion, Guard::SyncStandby, START_PROMOTION),
    to(PreparePromotion, Primary, Action::PromoteStandby, "Promoted"),
    to(PreparePromotion, StopReplication, Action::StopReplication, "Promote read-only to rule out a split brain"),
    to(PreparePromotion, WaitPrimary, Action::PromoteStandby, "Promoted, waiting for a standby"),
    // election
    to(Secondary, ReportLsn, Action::ReportLsn, "Report the received LSN for the election"),
    to(Catchingup, ReportLsn, Action::ReportLsn, "Report the received LSN for the election"),
    to(ReportLsn, PreparePromotion, Action::PrepareStandbyForPromotion, START_PROMOTION),
    to(ReportLsn, Secondary, Action::FollowNewPrimary, "Another node won the election"),
    to(ReportLsn, Catchingup, Action::FollowNewPrimary, "Another node won the election"),
    // maintenance
    to(Secondary, Maintenance, Action::StartMaintenance, MAINTENANCE),
    to(Catchingup, Maintenance, Action::StartMaintenance, MAINTENANCE),
    to(Maintenance, Catchingup, Action::RestartStandby, "Maintenance done, restart the standby"),
];

/// Row for `(current, assigned)`, if the pair is supported.
pub fn find_transition(current: NodeState, assigned: NodeState) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|t| t.current == current && t.assigned == assigned)
}

/// Every hop needed to go from `current` to `assigned`, in order. Empty when
/// the node is already there.
pub fn plan(current: NodeState, assigned: NodeState) -> Result<Vec<&'static Transition>> {
    let mut hops = Vec::new();
    let mut state = current;

    while state != assigned {
        if hops.len() == MAX_HOPS {
            return Err(Error::InvalidTransition {
                from: current,
                to: assigned,
            });
        }
        let transition = find_transition(state, assigned).ok_or(Error::InvalidTransition {
            from: state,
            to: assigned,
        })?;
        hops.push(transition);
        state = transition.next;
    }

    Ok(hops)
}

/// Rows leaving `current`.
pub fn reachable_states(current: NodeState) -> Vec<&'static Transition> {
    TRANSITIONS.iter().filter(|t| t.current == current).collect()
}

/// Table rendering of [`reachable_states`].
pub fn format_reachable_states(current: NodeState) -> String {
    let mut out = String::new();
    let rows = reachable_states(current);
    if rows.is_empty() {
        return out;
    }
    let _ = writeln!(out, "{:>20} | {:>20} | Comment", "Current", "Reachable");
    let _ = writeln!(out, "{:->20}-+-{:->20}-+-{:->20}", "", "", "");
    for t in rows {
        let _ = writeln!(out, "{:>20} | {:>20} | {}", t.current, t.assigned, t.comment);
    }
    out
}

/// The transition table as a graphviz program, e.g. `pgkeeper show fsm --dot | dot -Tpng`.
pub fn graphviz() -> String {
    let mut out = String::from(
        "digraph finite_state_machine\n{\n    size=\"12\"\n    ratio=\"fill\"\n    \
         node [shape = doubleoctagon, style=filled, color=\"bisque1\"]; init primary secondary;\n    \
         node [shape = octagon, style=filled color=\"bisque3\"];\n",
    );
    for t in TRANSITIONS {
        if t.next == t.assigned {
            let _ = writeln!(out, "    {} -> {} [ label = \"{}\" ];", t.current, t.assigned, t.comment);
        } else {
            let _ = writeln!(
                out,
                "    {} -> {} [ label = \"{} (assigned {})\" ];",
                t.current, t.next, t.comment, t.assigned
            );
        }
    }
    out.push_str("}\n");
    out
}
