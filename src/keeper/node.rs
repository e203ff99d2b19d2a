//! The local node and its replication group

use crate::common::{Error, Result};
use crate::keeper::state::NodeState;
use crate::pgsql::conninfo::{conninfo_field_int, conninfo_field_str};
use crate::pgsql::replication::{Lsn, ReplicationSide, ReplicationStatus};
use serde::{Deserialize, Serialize};

/// Where another node of the group can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node_id: i64,
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    /// Connection string to this node's `dbname` as `user`.
    pub fn conninfo(&self, dbname: &str, user: Option<&str>) -> String {
        let mut conninfo = format!(
            "{}{}{}",
            conninfo_field_str("host", &self.host).trim_start(),
            conninfo_field_int("port", self.port as i64),
            conninfo_field_str("dbname", dbname)
        );
        if let Some(user) = user {
            conninfo.push_str(&conninfo_field_str("user", user));
        }
        conninfo
    }
}

/// This keeper's node. Changed only by the state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub node_id: i64,
    pub group_id: i32,
    /// State the node last reached
    pub reported: NodeState,
    /// State the coordinator wants
    pub assigned: NodeState,
    pub pg_is_running: bool,
    /// Last probe result, reset on every probe
    pub replication: ReplicationStatus,
}

impl Node {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, group_id: i32) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            node_id: -1,
            group_id,
            reported: NodeState::Init,
            assigned: NodeState::Init,
            pg_is_running: false,
            replication: ReplicationStatus::default(),
        }
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress {
            node_id: self.node_id,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.node_id >= 0
    }

    /// Which probe applies to the node in its current state, if any.
    pub fn replication_side(&self) -> Option<ReplicationSide> {
        match self.reported {
            NodeState::Single
            | NodeState::Primary
            | NodeState::WaitPrimary
            | NodeState::Draining => Some(ReplicationSide::Primary),
            NodeState::Catchingup
            | NodeState::Secondary
            | NodeState::ReportLsn
            | NodeState::PreparePromotion => Some(ReplicationSide::Standby),
            _ => None,
        }
    }
}

/// A node of the group as listed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub address: NodeAddress,
    pub lsn: Option<Lsn>,
    pub is_primary: bool,
}

/// The nodes of one replication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub formation: String,
    pub group_id: i32,
    pub members: Vec<GroupMember>,
}

impl Group {
    /// The member currently acting as primary.
    ///
    /// More than one is a coordinator bug and is reported as such.
    pub fn primary(&self) -> Result<Option<&GroupMember>> {
        let mut primaries = self.members.iter().filter(|m| m.is_primary);
        let first = primaries.next();
        if primaries.next().is_some() {
            return Err(Error::ProtocolViolation(format!(
                "coordinator lists more than one primary in group {}/{}",
                self.formation, self.group_id
            )));
        }
        Ok(first)
    }

    /// Members other than `node_id`.
    pub fn others(&self, node_id: i64) -> impl Iterator<Item = &GroupMember> {
        self.members
            .iter()
            .filter(move |m| m.address.node_id != node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(node_id: i64, is_primary: bool) -> GroupMember {
        GroupMember {
            address: NodeAddress {
                node_id,
                host: format!("node{}", node_id),
                port: 5432,
            },
            lsn: None,
            is_primary,
        }
    }

    #[test]
    fn test_group_primary() {
        let group = Group {
            formation: "default".into(),
            group_id: 0,
            members: vec![member(1, false), member(2, true)],
        };
        assert_eq!(group.primary().unwrap().unwrap().address.node_id, 2);
        assert_eq!(group.others(2).count(), 1);
    }

    #[test]
    fn test_two_primaries_is_protocol_violation() {
        let group = Group {
            formation: "default".into(),
            group_id: 0,
            members: vec![member(1, true), member(2, true)],
        };
        assert!(matches!(group.primary(), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_no_primary() {
        let group = Group {
            formation: "default".into(),
            group_id: 0,
            members: vec![member(1, false)],
        };
        assert!(group.primary().unwrap().is_none());
    }

    #[test]
    fn test_address_conninfo() {
        let address = NodeAddress {
            node_id: 1,
            host: "db-1".into(),
            port: 6432,
        };
        assert_eq!(
            address.conninfo("postgres", Some("pgkeeper_replicator")),
            "host='db-1' port=6432 dbname='postgres' user='pgkeeper_replicator'"
        );
    }

    #[test]
    fn test_replication_side() {
        let mut node = Node::new("node1", "localhost", 5432, 0);
        assert_eq!(node.replication_side(), None);
        node.reported = NodeState::Primary;
        assert_eq!(node.replication_side(), Some(ReplicationSide::Primary));
        node.reported = NodeState::Secondary;
        assert_eq!(node.replication_side(), Some(ReplicationSide::Standby));
    }
}
