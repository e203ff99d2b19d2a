//! Node states shared by the keeper and the coordinator

use crate::pgsql::result::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Init,
    Single,
    WaitStandby,
    Catchingup,
    Secondary,
    PreparePromotion,
    StopReplication,
    Primary,
    WaitPrimary,
    Draining,
    DemoteTimeout,
    Demoted,
    Maintenance,
    ReportLsn,
}

impl NodeState {
    pub const ALL: [NodeState; 14] = [
        NodeState::Init,
        NodeState::Single,
        NodeState::WaitStandby,
        NodeState::Catchingup,
        NodeState::Secondary,
        NodeState::PreparePromotion,
        NodeState::StopReplication,
        NodeState::Primary,
        NodeState::WaitPrimary,
        NodeState::Draining,
        NodeState::DemoteTimeout,
        NodeState::Demoted,
        NodeState::Maintenance,
        NodeState::ReportLsn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::Single => "single",
            NodeState::WaitStandby => "wait_standby",
            NodeState::Catchingup => "catchingup",
            NodeState::Secondary => "secondary",
            NodeState::PreparePromotion => "prepare_promotion",
            NodeState::StopReplication => "stop_replication",
            NodeState::Primary => "primary",
            NodeState::WaitPrimary => "wait_primary",
            NodeState::Draining => "draining",
            NodeState::DemoteTimeout => "demote_timeout",
            NodeState::Demoted => "demoted",
            NodeState::Maintenance => "maintenance",
            NodeState::ReportLsn => "report_lsn",
        }
    }

    /// States in which the node accepts writes.
    pub fn is_writable_primary(&self) -> bool {
        matches!(
            self,
            NodeState::Single | NodeState::Primary | NodeState::WaitPrimary
        )
    }

    /// States of a node following another node's WAL.
    pub fn is_standby(&self) -> bool {
        matches!(
            self,
            NodeState::WaitStandby
                | NodeState::Catchingup
                | NodeState::Secondary
                | NodeState::ReportLsn
                | NodeState::Maintenance
        )
    }

    /// Should Postgres be running while the node sits in this state?
    /// `None` when the state has no opinion.
    pub fn expects_running(&self) -> Option<bool> {
        match self {
            NodeState::Single
            | NodeState::Primary
            | NodeState::WaitPrimary
            | NodeState::Secondary
            | NodeState::Catchingup
            | NodeState::ReportLsn
            | NodeState::PreparePromotion
            | NodeState::StopReplication => Some(true),
            NodeState::Demoted
            | NodeState::Draining
            | NodeState::DemoteTimeout
            | NodeState::Maintenance => Some(false),
            NodeState::Init | NodeState::WaitStandby => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        NodeState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseError::InvalidValue {
                value: s.to_string(),
                expected: "node state",
            })
    }
}
